//! Admin authentication and client address extraction.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use tracing::{debug, warn};

use super::router::AppState;
use super::types::{ApiError, ErrorResponse};
use crate::realm::{Credentials, TokenChecker};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Reject admin requests that do not carry a token for a process manager.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(TokenChecker::extract_bearer)
        .map(str::to_owned);

    let Some(token) = token else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::unauthorized("missing bearer token")),
        ));
    };

    let avatar = state
        .sessions
        .portal()
        .authenticate(&Credentials::token(token))
        .map_err(|e| {
            debug!("admin token rejected: {}", e);
            ErrorResponse::from_error(&e)
        })?;

    if !avatar.can_manage_processes() {
        warn!(user = %avatar.user(), path = %request.uri().path(), "admin access denied");
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new(
                "AUTHORIZATION_ERROR",
                format!("{} may not manage processes", avatar.user()),
            )),
        ));
    }

    Ok(next.run(request).await)
}

/// Address of the client on the other end of a request.
///
/// Behind a reverse proxy the first `X-Forwarded-For` entry is used;
/// otherwise the socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr(pub String);

impl FromRequestParts<AppState> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if state.proxy {
            if let Some(addr) = forwarded_for(&parts.headers) {
                return Ok(PeerAddr(addr));
            }
        }
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(PeerAddr(addr))
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_owned)
}
