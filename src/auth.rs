//! 认证处理与会话管理。

use axum::extract::{Extension, Json};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::{body::Body as AxumBody, middleware, response::IntoResponse};
use axum_extra::extract::{CookieJar, TypedHeader, cookie::Cookie};
use axum_extra::headers::{Authorization, authorization::Basic};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob::Requester;
use crate::config::AUTH_COOKIE_NAME;
use crate::error::ApiError;
use crate::http::is_https_request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// 通过认证的调用者，由中间件放入请求扩展。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn requester(&self) -> Requester {
        if self.is_admin() {
            Requester::elevated(self.user_id.clone())
        } else {
            Requester::owner(self.user_id.clone())
        }
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub role: Role,
}

impl FromStr for Account {
    type Err = String;

    /// 格式：`user:password[:admin|user]`，密码中可以包含 `:`。
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (username, rest) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("account `{}` has no password", value.trim()))?;
        let (password, role) = match rest.rsplit_once(':') {
            Some((password, "admin")) => (password, Role::Admin),
            Some((password, "user")) => (password, Role::User),
            _ => (rest, Role::User),
        };
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err("account needs both a user name and a password".into());
        }
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            role,
        })
    }
}

#[derive(Debug)]
pub struct AuthConfig {
    accounts: HashMap<String, Account>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    session_ttl: Duration,
}

#[derive(Debug)]
struct SessionEntry {
    principal: Principal,
    expires_at: Instant,
}

impl AuthConfig {
    pub fn new(accounts: Vec<Account>, session_ttl: Duration) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|account| (account.username.clone(), account))
            .collect();
        Self {
            accounts,
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
        }
    }

    fn verify(&self, username: &str, password: &str) -> Option<Principal> {
        self.accounts
            .get(username)
            .filter(|account| account.password == password)
            .map(|account| Principal {
                user_id: account.username.clone(),
                role: account.role,
            })
    }

    async fn session_principal(&self, token: &str) -> Option<Principal> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        match sessions.get(token) {
            Some(entry) if entry.expires_at > now => Some(entry.principal.clone()),
            _ => {
                sessions.remove(token);
                None
            }
        }
    }

    async fn create_session(&self, principal: Principal) -> String {
        let token = Uuid::new_v4().to_string();
        let expires_at = Instant::now() + self.session_ttl;
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            token.clone(),
            SessionEntry {
                principal,
                expires_at,
            },
        );
        token
    }

    async fn remove_session(&self, token: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(token);
    }
}

/// 认证中间件：校验 Cookie 或 Basic 认证，并写入 [`Principal`]。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    auth_header: Option<TypedHeader<Authorization<Basic>>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let mut principal = None;
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        principal = auth.session_principal(cookie.value()).await;
    }
    if principal.is_none()
        && let Some(TypedHeader(auth_header)) = auth_header
    {
        principal = auth.verify(auth_header.username(), auth_header.password());
    }

    match principal {
        Some(principal) => {
            req.extensions_mut().insert(principal);
            Ok(next.run(req).await)
        }
        None => Err(ApiError::Unauthorized(HeaderMap::new())),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthLoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub user_id: String,
    pub role: Role,
}

/// 登录接口：创建会话并写入 Cookie。
pub async fn auth_login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<AuthLoginRequest>,
) -> Result<(CookieJar, axum::response::Response), ApiError> {
    let Some(principal) = auth.verify(&payload.username, &payload.password) else {
        warn!(user = %payload.username, "login rejected");
        return Err(ApiError::Unauthorized(HeaderMap::new()));
    };
    info!(user = %principal.user_id, "login");
    let token = auth.create_session(principal).await;

    let secure = is_https_request(&headers);
    let cookie = Cookie::build((AUTH_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(axum_extra::extract::cookie::SameSite::Strict)
        .max_age(CookieDuration::seconds(auth.session_ttl.as_secs() as i64))
        .build();
    let jar = jar.add(cookie);
    Ok((jar, StatusCode::NO_CONTENT.into_response()))
}

/// 登出接口：清理会话并删除 Cookie。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        auth.remove_session(cookie.value()).await;
    }

    (
        jar.remove(Cookie::build(AUTH_COOKIE_NAME).path("/").build()),
        StatusCode::NO_CONTENT,
    )
}

/// 查询当前登录状态。
pub async fn auth_status(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> Result<Json<AuthStatus>, StatusCode> {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME)
        && let Some(principal) = auth.session_principal(cookie.value()).await
    {
        return Ok(Json(AuthStatus {
            user_id: principal.user_id,
            role: principal.role,
        }));
    }
    Err(StatusCode::UNAUTHORIZED)
}

fn is_auth_exempt_path(path: &str) -> bool {
    matches!(
        path,
        "/api/auth/login" | "/api/auth/logout" | "/api/auth/status"
    ) || !path.starts_with("/api/")
}

/// 清理过期会话。
pub async fn prune_expired_sessions(auth: &AuthConfig) {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    sessions.retain(|_, entry| entry.expires_at > now);
}
