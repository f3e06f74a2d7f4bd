use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use subtle::ConstantTimeEq;
use ulid::Ulid;

use crate::api::ApiError;
use crate::engine::Actor;

pub const ROLE_HEADER: &str = "x-actor-role";
pub const ID_HEADER: &str = "x-actor-id";
pub const EMAIL_HEADER: &str = "x-actor-email";

/// Check `Authorization: Bearer <secret>` against the configured secret.
/// An unset secret means the endpoint is switched off.
pub fn check_bearer(headers: &HeaderMap, secret: Option<&str>) -> Result<(), ApiError> {
    let Some(secret) = secret else {
        return Err(ApiError::disabled());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthenticated("missing bearer token"))?;
    if bool::from(presented.as_bytes().ct_eq(secret.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::unauthenticated("bad bearer token"))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Identity set by the upstream auth layer.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let role = header_str(headers, ROLE_HEADER)
        .ok_or_else(|| ApiError::unauthenticated("missing actor role"))?;
    match role {
        "admin" => Ok(Actor::Admin),
        "instructor" => header_str(headers, ID_HEADER)
            .and_then(|id| id.parse::<Ulid>().ok())
            .map(|id| Actor::Instructor { id })
            .ok_or_else(|| ApiError::unauthenticated("instructor id missing or malformed")),
        "client" => header_str(headers, EMAIL_HEADER)
            .map(|email| Actor::Client {
                email: email.to_string(),
            })
            .ok_or_else(|| ApiError::unauthenticated("client email missing")),
        _ => Err(ApiError::unauthenticated("unknown actor role")),
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)
    }
}
