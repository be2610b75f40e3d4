//! 认证处理：用户注册、HMAC 会话令牌与管理操作。

use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic::write_atomic;
use crate::config::{AUTH_SAVE_DEBOUNCE_MS, SESSION_TTL_SECS};
use crate::error::ApiError;
use crate::http::{ProxyMode, client_ip};
use crate::ratelimit::RateLimiter;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub registration_ip: String,
    pub status: UserStatus,
    pub op_level: u8,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: Uuid,
    pub current_username: String,
    pub observed_ip: String,
    pub expires_at: Instant,
}

/// Verified request identity handed to handlers.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: Uuid,
    pub username: String,
    pub op_level: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid username")]
    InvalidUsername,
    #[error("password too short")]
    InvalidPassword,
    #[error("username already taken")]
    DuplicateUsername,
    #[error("invalid credentials")]
    BadCredentials,
    #[error("account not approved")]
    NotApproved,
    #[error("unknown user")]
    UnknownUser,
    #[error("invalid op level")]
    InvalidLevel,
}

/// 用户与会话存储。会话仅保存在内存中，密钥随进程重新生成。
#[derive(Debug)]
pub struct Auth {
    path: PathBuf,
    secret: [u8; 32],
    users: Mutex<Vec<User>>,
    sessions: Mutex<HashMap<String, Session>>,
    dirty: AtomicBool,
}

impl Auth {
    /// Load `users.json`; a missing or unreadable file starts empty.
    pub async fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(crate::config::USERS_FILE);
        let users = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<User>>(&bytes) {
                Ok(users) => users,
                Err(err) => {
                    warn!(error = %err, "users file unreadable, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            secret: rand::random::<[u8; 32]>(),
            users: Mutex::new(users),
            sessions: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Background flusher for debounced persistence.
    pub fn spawn_flusher(self: &Arc<Self>) {
        let auth = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(AUTH_SAVE_DEBOUNCE_MS));
            loop {
                interval.tick().await;
                if auth.dirty.swap(false, Ordering::AcqRel)
                    && let Err(err) = auth.persist().await
                {
                    warn!(error = %err, "user store save failed");
                    auth.dirty.store(true, Ordering::Release);
                }
            }
        });
    }

    /// Force a synchronous-ish save; called on shutdown.
    pub async fn flush(&self) {
        self.dirty.store(false, Ordering::Release);
        if let Err(err) = self.persist().await {
            warn!(error = %err, "user store flush failed");
        }
    }

    fn schedule_save(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    async fn persist(&self) -> std::io::Result<()> {
        let bytes = {
            let users = self.users.lock().await;
            serde_json::to_vec_pretty(&*users)
                .map_err(|err| std::io::Error::other(err.to_string()))?
        };
        write_atomic(&self.path, &bytes).await
    }

    /// Create a `pending` user. Usernames are lowercased before validation.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        ip: &str,
    ) -> Result<User, AuthError> {
        let username = username.trim().to_lowercase();
        if !valid_username(&username) {
            return Err(AuthError::InvalidUsername);
        }
        if password.len() < 4 {
            return Err(AuthError::InvalidPassword);
        }

        let mut users = self.users.lock().await;
        if users.iter().any(|user| user.username == username) {
            return Err(AuthError::DuplicateUsername);
        }

        let salt = hex_encode(&rand::random::<[u8; 16]>());
        let user = User {
            id: Uuid::new_v4(),
            password_hash: hash_password(&salt, password),
            salt,
            username,
            registration_ip: ip.to_string(),
            status: UserStatus::Pending,
            op_level: 1,
            created_at: Utc::now(),
        };
        users.push(user.clone());
        drop(users);

        self.schedule_save();
        info!(username = %user.username, "user registered");
        Ok(user)
    }

    /// Constant-time password check against the stored HMAC.
    pub async fn check_password(&self, username: &str, password: &str) -> Result<User, AuthError> {
        let username = username.trim().to_lowercase();
        let users = self.users.lock().await;
        let user = users
            .iter()
            .find(|user| user.username == username)
            .ok_or(AuthError::BadCredentials)?;

        let salt = hex_decode(&user.salt).ok_or(AuthError::BadCredentials)?;
        let expected = hex_decode(&user.password_hash).ok_or(AuthError::BadCredentials)?;
        let mut mac =
            HmacSha256::new_from_slice(&salt).map_err(|_| AuthError::BadCredentials)?;
        mac.update(password.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| AuthError::BadCredentials)?;

        if user.status != UserStatus::Approved {
            return Err(AuthError::NotApproved);
        }
        Ok(user.clone())
    }

    /// Verify credentials and mint a session token.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        ip: &str,
    ) -> Result<(String, User), AuthError> {
        let user = self.check_password(username, password).await?;

        let payload = json!({
            "uid": user.id,
            "nonce": hex_encode(&rand::random::<[u8; 16]>()),
            "iat": Utc::now().timestamp(),
        })
        .to_string();
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AuthError::BadCredentials)?;
        mac.update(payload.as_bytes());
        let signature = hex_encode(&mac.finalize().into_bytes());
        let token = format!("{}.{}", URL_SAFE_NO_PAD.encode(payload), signature);

        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            token.clone(),
            Session {
                user_id: user.id,
                current_username: user.username.clone(),
                observed_ip: ip.to_string(),
                expires_at: Instant::now() + Duration::from_secs(SESSION_TTL_SECS),
            },
        );
        drop(sessions);

        info!(username = %user.username, "login");
        Ok((token, user))
    }

    /// Resolve a bearer token to a live, approved identity. Expired
    /// sessions are deleted on sight.
    pub async fn verify_token(&self, token: &str) -> Option<AuthedUser> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get(token)?;
        if session.expires_at <= Instant::now() {
            sessions.remove(token);
            return None;
        }
        // The session carries the display name so admin renames show up
        // without another registry pass.
        let user_id = session.user_id;
        let username = session.current_username.clone();
        drop(sessions);

        let users = self.users.lock().await;
        let user = users.iter().find(|user| user.id == user_id)?;
        if user.status != UserStatus::Approved {
            return None;
        }
        Some(AuthedUser {
            user_id,
            username,
            op_level: user.op_level,
        })
    }

    pub async fn logout(&self, token: &str) {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        if let Some(session) = self.sessions.lock().await.remove(token) {
            info!(ip = %session.observed_ip, "session ended");
        }
    }

    pub async fn approve(&self, username: &str) -> Result<(), AuthError> {
        self.set_status(username, UserStatus::Approved).await
    }

    /// Deny a user and drop every session they own.
    pub async fn deny(&self, username: &str) -> Result<(), AuthError> {
        let id = {
            let mut users = self.users.lock().await;
            let user = users
                .iter_mut()
                .find(|user| user.username == username)
                .ok_or(AuthError::UnknownUser)?;
            user.status = UserStatus::Denied;
            user.id
        };
        self.invalidate_sessions_of(id).await;
        self.schedule_save();
        Ok(())
    }

    pub async fn clear_pending(&self) {
        let mut users = self.users.lock().await;
        users.retain(|user| user.status != UserStatus::Pending);
        drop(users);
        self.schedule_save();
    }

    pub async fn reset_all(&self) {
        self.users.lock().await.clear();
        self.sessions.lock().await.clear();
        self.schedule_save();
    }

    pub async fn reset_password(&self, username: &str, password: &str) -> Result<(), AuthError> {
        if password.len() < 4 {
            return Err(AuthError::InvalidPassword);
        }
        let id = {
            let mut users = self.users.lock().await;
            let user = users
                .iter_mut()
                .find(|user| user.username == username)
                .ok_or(AuthError::UnknownUser)?;
            let salt = hex_encode(&rand::random::<[u8; 16]>());
            user.password_hash = hash_password(&salt, password);
            user.salt = salt;
            user.id
        };
        self.invalidate_sessions_of(id).await;
        self.schedule_save();
        Ok(())
    }

    /// Rename a user; live sessions keep working and reflect the new name.
    pub async fn reset_username(&self, old: &str, new: &str) -> Result<(), AuthError> {
        let new = new.trim().to_lowercase();
        if !valid_username(&new) {
            return Err(AuthError::InvalidUsername);
        }
        let id = {
            let mut users = self.users.lock().await;
            if users.iter().any(|user| user.username == new) {
                return Err(AuthError::DuplicateUsername);
            }
            let user = users
                .iter_mut()
                .find(|user| user.username == old)
                .ok_or(AuthError::UnknownUser)?;
            user.username = new.clone();
            user.id
        };
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            if session.user_id == id {
                session.current_username = new.clone();
            }
        }
        drop(sessions);
        self.schedule_save();
        Ok(())
    }

    pub async fn delete_user(&self, username: &str) -> Result<(), AuthError> {
        let id = {
            let mut users = self.users.lock().await;
            let index = users
                .iter()
                .position(|user| user.username == username)
                .ok_or(AuthError::UnknownUser)?;
            users.remove(index).id
        };
        self.invalidate_sessions_of(id).await;
        self.schedule_save();
        Ok(())
    }

    pub async fn set_op_level(&self, username: &str, level: u8) -> Result<(), AuthError> {
        if !(1..=2).contains(&level) {
            return Err(AuthError::InvalidLevel);
        }
        let mut users = self.users.lock().await;
        let user = users
            .iter_mut()
            .find(|user| user.username == username)
            .ok_or(AuthError::UnknownUser)?;
        user.op_level = level;
        drop(users);
        self.schedule_save();
        Ok(())
    }

    pub async fn user_by_name(&self, username: &str) -> Option<User> {
        let username = username.trim().to_lowercase();
        let users = self.users.lock().await;
        users.iter().find(|user| user.username == username).cloned()
    }

    async fn set_status(&self, username: &str, status: UserStatus) -> Result<(), AuthError> {
        let mut users = self.users.lock().await;
        let user = users
            .iter_mut()
            .find(|user| user.username == username)
            .ok_or(AuthError::UnknownUser)?;
        user.status = status;
        drop(users);
        self.schedule_save();
        Ok(())
    }

    async fn invalidate_sessions_of(&self, id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, session| session.user_id != id);
    }
}

/// Bearer-token gate used by mutating handlers.
pub async fn require_auth(headers: &HeaderMap, auth: &Auth) -> Result<AuthedUser, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing token".into()))?;
    auth.verify_token(token)
        .await
        .ok_or_else(|| ApiError::Unauthorized("invalid or expired token".into()))
}

fn valid_username(username: &str) -> bool {
    (2..=32).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn hash_password(salt_hex: &str, password: &str) -> String {
    let salt = hex_decode(salt_hex).unwrap_or_default();
    let mut mac = HmacSha256::new_from_slice(&salt).expect("hmac accepts any key length");
    mac.update(password.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub(crate) fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CredentialsBody {
    username: String,
    password: String,
}

/// 注册接口：新用户进入待审核状态。
pub async fn auth_register(
    Extension(auth): Extension<Arc<Auth>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<CredentialsBody>,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, Some(addr.ip()), proxy.0);
    limiter.check("auth", &ip).await?;

    match auth
        .register(&payload.username, &payload.password, &ip)
        .await
    {
        Ok(user) => Ok(JsonResponse(json!({ "ok": true, "status": user.status })).into_response()),
        Err(AuthError::DuplicateUsername) => Ok((
            StatusCode::CONFLICT,
            JsonResponse(json!({ "ok": false, "error": "username already taken" })),
        )
            .into_response()),
        Err(err) => Ok((
            StatusCode::BAD_REQUEST,
            JsonResponse(json!({ "ok": false, "error": err.to_string() })),
        )
            .into_response()),
    }
}

/// 登录接口：验证密码并颁发 Bearer 令牌。
pub async fn auth_login(
    Extension(auth): Extension<Arc<Auth>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(proxy): Extension<ProxyMode>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<CredentialsBody>,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, Some(addr.ip()), proxy.0);
    limiter.check("auth", &ip).await?;

    match auth.login(&payload.username, &payload.password, &ip).await {
        Ok((token, user)) => Ok(JsonResponse(json!({
            "ok": true,
            "token": token,
            "username": user.username,
            "oplevel": user.op_level,
        }))
        .into_response()),
        Err(_) => Ok((
            StatusCode::UNAUTHORIZED,
            JsonResponse(json!({ "ok": false, "error": "invalid credentials" })),
        )
            .into_response()),
    }
}

/// 登出接口：删除会话。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<Auth>>,
    headers: HeaderMap,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    let user = require_auth(&headers, &auth).await?;
    if let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        auth.logout(token).await;
    }
    info!(username = %user.username, "logout");
    Ok(JsonResponse(json!({ "ok": true })))
}

/// 查询当前登录状态。
pub async fn auth_status(
    Extension(auth): Extension<Arc<Auth>>,
    headers: HeaderMap,
) -> JsonResponse<serde_json::Value> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if let Some(token) = token
        && let Some(user) = auth.verify_token(token).await
    {
        return JsonResponse(json!({
            "authenticated": true,
            "username": user.username,
            "oplevel": user.op_level,
        }));
    }
    JsonResponse(json!({ "authenticated": false }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn make_auth() -> (tempfile::TempDir, Auth) {
        let temp = tempdir().expect("tempdir");
        let auth = Auth::load(temp.path()).await;
        (temp, auth)
    }

    #[tokio::test]
    async fn register_normalizes_and_validates_usernames() {
        let (_temp, auth) = make_auth().await;
        let user = auth
            .register("  NewUser_1 ", "password", "10.0.0.1")
            .await
            .expect("register");
        assert_eq!(user.username, "newuser_1");
        assert_eq!(user.status, UserStatus::Pending);
        assert_eq!(user.op_level, 1);

        assert_eq!(
            auth.register("x", "password", "10.0.0.1").await,
            Err(AuthError::InvalidUsername)
        );
        assert_eq!(
            auth.register("bad name", "password", "10.0.0.1").await,
            Err(AuthError::InvalidUsername)
        );
        assert_eq!(
            auth.register("shortpw", "abc", "10.0.0.1").await,
            Err(AuthError::InvalidPassword)
        );
    }

    #[tokio::test]
    async fn duplicate_usernames_rejected_case_insensitively() {
        let (_temp, auth) = make_auth().await;
        auth.register("alice", "password", "ip").await.expect("first");
        assert_eq!(
            auth.register("ALICE", "password", "ip").await,
            Err(AuthError::DuplicateUsername)
        );
    }

    #[tokio::test]
    async fn login_requires_approval() {
        let (_temp, auth) = make_auth().await;
        auth.register("bob", "hunter2", "ip").await.expect("register");
        assert_eq!(
            auth.login("bob", "hunter2", "ip").await.map(|_| ()),
            Err(AuthError::NotApproved)
        );

        auth.approve("bob").await.expect("approve");
        let (token, user) = auth.login("bob", "hunter2", "ip").await.expect("login");
        assert_eq!(user.username, "bob");
        assert!(token.contains('.'));

        let verified = auth.verify_token(&token).await.expect("verify");
        assert_eq!(verified.username, "bob");
        assert_eq!(verified.op_level, 1);
    }

    #[tokio::test]
    async fn wrong_password_rejected() {
        let (_temp, auth) = make_auth().await;
        auth.register("carol", "secret99", "ip").await.expect("register");
        auth.approve("carol").await.expect("approve");
        assert_eq!(
            auth.login("carol", "wrong", "ip").await.map(|_| ()),
            Err(AuthError::BadCredentials)
        );
    }

    #[tokio::test]
    async fn bearer_prefix_is_stripped() {
        let (_temp, auth) = make_auth().await;
        auth.register("dave", "pass1234", "ip").await.expect("register");
        auth.approve("dave").await.expect("approve");
        let (token, _) = auth.login("dave", "pass1234", "ip").await.expect("login");
        assert!(
            auth.verify_token(&format!("Bearer {token}"))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn deny_invalidates_sessions_immediately() {
        let (_temp, auth) = make_auth().await;
        auth.register("eve", "pass1234", "ip").await.expect("register");
        auth.approve("eve").await.expect("approve");
        let (token, _) = auth.login("eve", "pass1234", "ip").await.expect("login");

        auth.deny("eve").await.expect("deny");
        assert!(auth.verify_token(&token).await.is_none());
    }

    #[tokio::test]
    async fn rename_keeps_sessions_live_with_new_name() {
        let (_temp, auth) = make_auth().await;
        auth.register("frank", "pass1234", "ip").await.expect("register");
        auth.approve("frank").await.expect("approve");
        let (token, _) = auth.login("frank", "pass1234", "ip").await.expect("login");

        auth.reset_username("frank", "francis").await.expect("rename");
        let verified = auth.verify_token(&token).await.expect("still valid");
        assert_eq!(verified.username, "francis");
    }

    #[tokio::test]
    async fn reset_password_invalidates_sessions() {
        let (_temp, auth) = make_auth().await;
        auth.register("gina", "pass1234", "ip").await.expect("register");
        auth.approve("gina").await.expect("approve");
        let (token, _) = auth.login("gina", "pass1234", "ip").await.expect("login");

        auth.reset_password("gina", "newpass1").await.expect("reset");
        assert!(auth.verify_token(&token).await.is_none());
        assert!(auth.login("gina", "newpass1", "ip").await.is_ok());
    }

    #[tokio::test]
    async fn set_op_level_bounds() {
        let (_temp, auth) = make_auth().await;
        auth.register("henry", "pass1234", "ip").await.expect("register");
        assert_eq!(
            auth.set_op_level("henry", 3).await,
            Err(AuthError::InvalidLevel)
        );
        auth.set_op_level("henry", 2).await.expect("level 2");
        assert_eq!(auth.user_by_name("henry").await.expect("user").op_level, 2);
    }

    #[tokio::test]
    async fn users_persist_across_loads() {
        let temp = tempdir().expect("tempdir");
        {
            let auth = Auth::load(temp.path()).await;
            auth.register("iris", "pass1234", "ip").await.expect("register");
            auth.flush().await;
        }
        let auth = Auth::load(temp.path()).await;
        let user = auth.user_by_name("iris").await.expect("reloaded");
        assert_eq!(user.status, UserStatus::Pending);
    }

    #[test]
    fn hex_roundtrip() {
        let bytes = [0u8, 1, 0xab, 0xff];
        assert_eq!(hex_decode(&hex_encode(&bytes)).expect("decode"), bytes);
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }
}
