//! Registration, login, sessions, and profiles.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use campus_sdk::models::{AuthResponse, LoginRequest, RegisterRequest, UpdateProfileRequest, UserProfile};

use crate::auth::{self, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::server::SharedState;

const MAX_DISPLAY_NAME: usize = 50;
const MAX_BIO: usize = 500;

pub fn routes() -> Router<Arc<SharedState>> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/users/me", get(me).patch(update_me))
        .route("/api/users/{uid}", get(user_profile))
}

fn valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn check_display_name(name: &str) -> ApiResult<()> {
    let len = name.trim().chars().count();
    if len == 0 || len > MAX_DISPLAY_NAME {
        return Err(ApiError::bad_request(format!(
            "display_name must be 1-{MAX_DISPLAY_NAME} characters"
        )));
    }
    Ok(())
}

async fn register(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let email = req.email.trim();
    if !valid_email(email) {
        return Err(ApiError::bad_request("invalid email address"));
    }
    check_display_name(&req.display_name)?;
    let hash = auth::hash_password(&req.password)?;

    let user = state.with_db(|db| db.create_user(email, &hash, req.display_name.trim()))?;
    let token = auth::issue_session(&state, &user.uid)?;
    tracing::info!(uid = %user.uid, "Registered account");
    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

async fn login(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let bad_credentials = || ApiError::Unauthorized("invalid email or password".to_string());
    let record = state
        .with_db(|db| db.get_user_by_email(req.email.trim()))?
        .ok_or_else(bad_credentials)?;
    let hash = record.password_hash.as_deref().ok_or_else(bad_credentials)?;
    if !auth::verify_password(&req.password, hash) {
        return Err(bad_credentials());
    }
    let token = auth::issue_session(&state, &record.profile.uid)?;
    Ok(Json(AuthResponse { token, user: record.profile }))
}

async fn logout(State(state): State<Arc<SharedState>>, user: AuthUser) -> ApiResult<StatusCode> {
    state.with_db(|db| db.delete_session(&user.token_hash))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn me(user: AuthUser) -> Json<UserProfile> {
    Json(user.profile)
}

async fn update_me(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<Json<UserProfile>> {
    if let Some(name) = req.display_name.as_deref() {
        check_display_name(name)?;
    }
    if req.bio.as_deref().is_some_and(|b| b.chars().count() > MAX_BIO) {
        return Err(ApiError::bad_request(format!("bio must be at most {MAX_BIO} characters")));
    }
    let profile = state
        .with_db(|db| db.update_profile(user.uid(), &req))?
        .ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(profile))
}

/// Public profile. Email is only shown to its owner.
async fn user_profile(
    State(state): State<Arc<SharedState>>,
    Path(uid): Path<String>,
) -> ApiResult<Json<UserProfile>> {
    let mut profile = state
        .with_db(|db| db.get_user(&uid))?
        .ok_or_else(|| ApiError::not_found("user"))?;
    profile.email = None;
    Ok(Json(profile))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape() {
        assert!(valid_email("a@uni.edu"));
        assert!(!valid_email("a@uni"));
        assert!(!valid_email("@uni.edu"));
        assert!(!valid_email("a b@uni.edu"));
        assert!(!valid_email("a@.edu"));
    }

    #[test]
    fn display_name_bounds() {
        assert!(check_display_name("Mina").is_ok());
        assert!(check_display_name("   ").is_err());
        assert!(check_display_name(&"x".repeat(MAX_DISPLAY_NAME + 1)).is_err());
    }
}
