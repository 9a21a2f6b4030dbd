use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use uuid::Uuid;

use tracing::info;

use crate::{
    config::AuthSettings,
    db::{Database, NewUser, User},
    error::{ApiError, ApiResult},
    web::AppState,
};

pub fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|e| ApiError::Internal(format!("salt: {e}")))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(format!("hashing password: {e}")))?;
    Ok(hash.to_string())
}

/// False for a wrong password and for a hash that cannot be parsed.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn new_session_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Random one-time password handed out when users are imported.
pub fn generate_start_password() -> String {
    let mut password = Uuid::new_v4().simple().to_string();
    password.truncate(12);
    password
}

/// Creates the configured admin account when no user exists yet.
pub fn bootstrap_admin(db: &Database, settings: &AuthSettings) -> ApiResult<bool> {
    let (Some(username), Some(password)) = (&settings.admin_username, &settings.admin_password)
    else {
        return Ok(false);
    };
    if db.user_count()? > 0 {
        return Ok(false);
    }
    let username = username.to_lowercase();
    db.add_user(&NewUser {
        username: &username,
        name: &username,
        class_name: None,
        password_hash: &hash_password(password)?,
        start_password: None,
        admin: true,
    })?;
    info!(%username, "created admin account");
    Ok(true)
}

fn token_from_parts(parts: &Parts, cookie_name: &str) -> Option<String> {
    let bearer = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_owned);
    bearer.or_else(|| {
        CookieJar::from_headers(&parts.headers)
            .get(cookie_name)
            .map(|c| c.value().to_owned())
    })
}

/// The logged-in user, from a bearer token or the session cookie.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts, &state.settings.auth.cookie_name)
            .ok_or_else(|| ApiError::Unauthorized("no session token".to_owned()))?;
        let user = state
            .db
            .session_user(&token, Utc::now())?
            .ok_or_else(|| ApiError::Unauthorized("session expired or unknown".to_owned()))?;
        Ok(CurrentUser { user, token })
    }
}

/// A [`CurrentUser`] with the admin flag set.
#[derive(Debug, Clone)]
pub struct AdminUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser { user, .. } = CurrentUser::from_request_parts(parts, state).await?;
        if !user.admin {
            return Err(ApiError::Forbidden(format!("{} is not an admin", user.username)));
        }
        Ok(AdminUser(user))
    }
}
