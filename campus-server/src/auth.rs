//! Local accounts: Argon2id password hashing and opaque bearer sessions.
//!
//! A session token is 32 random bytes, base64url encoded, handed to the
//! client once. Only its SHA-256 hex digest is stored, so a leaked database
//! does not leak usable tokens.

use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::header::AUTHORIZATION;
use base64::Engine;
use sha2::{Digest, Sha256};

use campus_sdk::models::UserProfile;

use crate::error::{ApiError, ApiResult};
use crate::ids;
use crate::server::SharedState;

pub const MIN_PASSWORD_LEN: usize = 8;

/// Hash a password with Argon2id and a random salt. Returns a PHC string.
pub fn hash_password(password: &str) -> ApiResult<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let salt_bytes: [u8; 16] = rand::random();
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| ApiError::Internal(format!("salt encoding failed: {e}")))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Check a password against a stored PHC hash. Malformed hashes never match.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(password_hash) else {
        tracing::warn!("Stored password hash is malformed");
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

/// Fresh random session token (43 chars, base64url, no padding).
pub fn new_session_token() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest under which a token is stored.
pub fn token_hash(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Create a session for `uid` and return the plaintext token.
pub fn issue_session(state: &SharedState, uid: &str) -> ApiResult<String> {
    let token = new_session_token();
    let now = ids::now_ms() as i64;
    let expires_at = now + state.config.session_ttl_ms();
    let hash = token_hash(&token);
    state.with_db(|db| db.create_session(&hash, uid, now, expires_at))?;
    Ok(token)
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

/// The authenticated caller. Extracting it rejects the request with 401 when
/// the bearer token is missing, unknown, or expired.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub profile: UserProfile,
    pub token_hash: String,
    pub is_admin: bool,
}

impl AuthUser {
    pub fn uid(&self) -> &str {
        &self.profile.uid
    }

    pub fn require_admin(&self) -> ApiResult<()> {
        if self.is_admin {
            Ok(())
        } else {
            Err(ApiError::forbidden("administrator access required"))
        }
    }
}

fn resolve(parts: &Parts, state: &SharedState) -> ApiResult<Option<AuthUser>> {
    let Some(token) = bearer_token(parts) else {
        return Ok(None);
    };
    let hash = token_hash(token);
    let now = ids::now_ms() as i64;
    let Some(profile) = state.with_db(|db| db.session_user(&hash, now))? else {
        return Ok(None);
    };
    let is_admin = profile
        .email
        .as_deref()
        .is_some_and(|e| state.config.is_admin_email(e));
    Ok(Some(AuthUser { profile, token_hash: hash, is_admin }))
}

impl FromRequestParts<Arc<SharedState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<SharedState>) -> Result<Self, Self::Rejection> {
        resolve(parts, state)?
            .ok_or_else(|| ApiError::Unauthorized("missing or invalid session token".to_string()))
    }
}

/// Like [`AuthUser`] but anonymous requests are let through as `None`.
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<AuthUser>);

impl MaybeAuthUser {
    pub fn uid(&self) -> Option<&str> {
        self.0.as_ref().map(|u| u.uid())
    }
}

impl FromRequestParts<Arc<SharedState>> for MaybeAuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<SharedState>) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuthUser(resolve(parts, state)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[test]
    fn short_password_rejected() {
        let err = hash_password("short").unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn tokens_are_unique_and_hash_is_stable() {
        let a = new_session_token();
        let b = new_session_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert_eq!(token_hash(&a), token_hash(&a));
        assert_eq!(token_hash(&a).len(), 64);
        assert_ne!(token_hash(&a), token_hash(&b));
    }

    #[test]
    fn bearer_header_parsing() {
        let req = axum::http::Request::builder()
            .header(AUTHORIZATION, "Bearer abc123")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        assert_eq!(bearer_token(&parts), Some("abc123"));

        let req = axum::http::Request::builder()
            .header(AUTHORIZATION, "Basic abc123")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        assert_eq!(bearer_token(&parts), None);
    }
}
