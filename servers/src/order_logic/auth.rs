//! # Authentication
//!
//! Verifies the HS256 tokens issued by the external login service. Tokens
//! carry `{sub, kind, iat, exp}`; `kind` says whether `sub` is a restaurant
//! or a customer id.
//!
//! HTTP handlers receive the caller through the `AuthRestaurant` and
//! `AuthUser` extractors, which read `Authorization: Bearer <token>`. The
//! WebSocket route passes its token in the query string and calls
//! `JwtAuth::verify` directly.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::order_logic::state::AppState;

/// Which kind of account a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    Restaurante,
    Usuario,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub kind: PrincipalKind,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token is for a {found:?}, expected a {expected:?}")]
    WrongKind { expected: PrincipalKind, found: PrincipalKind },
    #[error("token does not grant access to this resource")]
    Forbidden,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::Invalid(_) => StatusCode::UNAUTHORIZED,
            AuthError::WrongKind { .. } | AuthError::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!(%status, error = %self, "request rejected by auth");
        let error_type = match self {
            AuthError::MissingToken | AuthError::Invalid(_) => "Unauthorized",
            AuthError::WrongKind { .. } | AuthError::Forbidden => "Forbidden",
        };
        (status, Json(json!({"error_type": error_type, "message": self.to_string()}))).into_response()
    }
}

/// A verified caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: Uuid,
    pub kind: PrincipalKind,
}

/// Token verification (and issuance, for tests and the load tool).
#[derive(Clone)]
pub struct JwtAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Signs a token for `id` valid for `ttl_seconds`.
    pub fn issue_token(&self, id: Uuid, kind: PrincipalKind, ttl_seconds: i64) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: id.to_string(),
            kind,
            iat: now,
            exp: now + ttl_seconds,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| AuthError::Invalid(e.to_string()))
    }

    /// Checks signature and expiry and returns the caller.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        let id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| AuthError::Invalid(format!("subject '{}' is not a valid id", data.claims.sub)))?;
        Ok(Principal {
            id,
            kind: data.claims.kind,
        })
    }

    /// Verifies and requires a specific account kind.
    pub fn verify_kind(&self, token: &str, expected: PrincipalKind) -> Result<Principal, AuthError> {
        let principal = self.verify(token)?;
        if principal.kind != expected {
            return Err(AuthError::WrongKind {
                expected,
                found: principal.kind,
            });
        }
        Ok(principal)
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    let value = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        state.auth.verify(token)
    }
}

/// The calling restaurant.
#[derive(Debug, Clone, Copy)]
pub struct AuthRestaurant(pub Uuid);

impl FromRequestParts<AppState> for AuthRestaurant {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let principal = state.auth.verify_kind(token, PrincipalKind::Restaurante)?;
        Ok(AuthRestaurant(principal.id))
    }
}

/// The calling customer.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let principal = state.auth.verify_kind(token, PrincipalKind::Usuario)?;
        Ok(AuthUser(principal.id))
    }
}
