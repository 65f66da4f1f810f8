//! CLI arguments and server configuration defaults.

use clap::Parser;

pub const DEFAULT_ACCOUNT: &str = "axo:axo:admin";
pub const AUTH_COOKIE_NAME: &str = "AXO_SESSION";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const MIN_TEMP_TTL_SECS: u64 = 10 * 60;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-portal", version, about = "AxoPortal file server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = ".axo/storage",
        help = "Root directory for stored file contents"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'd',
        long,
        env = "AXO_DATABASE_PATH",
        default_value = ".axo/portal.db",
        help = "SQLite database file for file and folder metadata"
    )]
    pub database_path: String,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'a',
        long = "account",
        env = "AXO_ACCOUNTS",
        value_delimiter = ',',
        default_value = DEFAULT_ACCOUNT,
        help = "Account as user:password[:admin], repeatable"
    )]
    pub accounts: Vec<String>,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_MAX_UPLOAD_SIZE",
        default_value_t = DEFAULT_MAX_UPLOAD_SIZE,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Max size of one uploaded file in bytes"
    )]
    pub max_upload_size: u64,
    #[arg(
        long,
        env = "AXO_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        help = "Interval of orphan reconciliation and temp sweeping (0 to disable)"
    )]
    pub sweep_interval_secs: u64,
    #[arg(
        long,
        env = "AXO_TEMP_TTL_SECS",
        default_value_t = DEFAULT_TEMP_TTL_SECS,
        value_parser = clap::value_parser!(u64).range(MIN_TEMP_TTL_SECS..),
        help = "Age after which stray temp files and unreferenced blobs are swept (at least 600)"
    )]
    pub temp_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_LOG_LEVEL",
        default_value = "info",
        help = "Log filter used when RUST_LOG is not set"
    )]
    pub log_level: String,
}
