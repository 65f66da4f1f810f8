//! AxoPortal server binary.
//!
//! Serves folder and file metadata over HTTP and keeps each stored file's
//! bytes on disk consistent with its SQLite record. The main entry point
//! opens the database and storage root, builds the Axum router, and starts
//! the HTTP listener together with the background maintenance tasks.

mod atomic;
mod auth;
mod background;
mod blob;
mod config;
mod db;
mod error;
mod files;
mod folders;
mod http;
mod logging;
mod metadata;
mod storage;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::{Account, AuthConfig};
use crate::background::{SweepSchedule, spawn_background_tasks};
use crate::blob::{BlobCoordinator, CoordinatorConfig};
use crate::config::Args;
use crate::db::Database;
use crate::folders::FolderRepository;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::metadata::SqliteMetadataStore;
use crate::storage::LocalBlobBackend;

/// Starts the AxoPortal server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let accounts = args
        .accounts
        .iter()
        .map(|value| value.parse::<Account>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let auth_config = Arc::new(AuthConfig::new(
        accounts,
        Duration::from_secs(args.session_ttl_secs),
    ));

    let backend = LocalBlobBackend::new(PathBuf::from(&args.storage_dir));
    backend.ensure_root().await?;
    let storage_root = backend.root_path().to_path_buf();
    let db = Database::open(&PathBuf::from(&args.database_path))
        .await
        .map_err(std::io::Error::other)?;
    let coordinator = Arc::new(BlobCoordinator::new(
        Arc::new(SqliteMetadataStore::new(&db)),
        Arc::new(backend),
        CoordinatorConfig {
            max_size: args.max_upload_size,
            enforce_retrieve_ownership: true,
        },
    ));
    let folder_repo = Arc::new(FolderRepository::new(&db));

    let mut app = Router::new()
        .route(
            "/api/files",
            get(files::list_files)
                .post(files::upload_file)
                .layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/files/{id}",
            get(files::get_file).delete(files::delete_file),
        )
        .route("/api/files/{id}/download", get(files::download_file))
        .route(
            "/api/folders",
            get(folders::list_folders).post(folders::create_folder),
        )
        .route(
            "/api/folders/with-files",
            get(folders::list_folders_with_files),
        )
        .route(
            "/api/folders/{id}",
            get(folders::get_folder)
                .put(folders::update_folder)
                .delete(folders::delete_folder),
        )
        .route(
            "/api/folders/{id}/with-files",
            get(folders::get_folder_with_files),
        )
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/status", get(auth::auth_status))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(coordinator.clone()))
        .layer(Extension(folder_repo))
        .layer(Extension(auth_config.clone()));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!(
        addr = %http_addr,
        storage = %storage_root.display(),
        database = %args.database_path,
        "starting HTTP server"
    );

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(
        coordinator,
        auth_config,
        SweepSchedule {
            interval: Duration::from_secs(args.sweep_interval_secs),
            temp_ttl: Duration::from_secs(args.temp_ttl_secs),
        },
    );
    tokio::spawn(shutdown_signal(handle));
    http_server.await?;

    db.close().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
