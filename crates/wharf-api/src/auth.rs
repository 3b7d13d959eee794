use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Middleware state binding a route to the permission it requires.
///
/// A permission is `<scope>:<action>` where scope is `i` (daemon-wide) or
/// `s` (one server).
#[derive(Clone)]
pub struct TokenGate {
    pub state: AppState,
    pub permission: &'static str,
}

impl TokenGate {
    pub fn new(state: &AppState, permission: &'static str) -> Self {
        Self {
            state: state.clone(),
            permission,
        }
    }
}

/// Validates `Authorization: Bearer <token>` for the gate's permission.
pub async fn auth_middleware(State(gate): State<TokenGate>, req: Request, next: Next) -> Response {
    match authorize(&gate.state.config.token, gate.permission, req.headers()) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

fn authorize(token: &str, permission: &str, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let scope = permission.split(':').next().unwrap_or_default();
    if scope != "i" && scope != "s" {
        tracing::warn!(permission, "could not match a permission scope");
        return Err(ApiError::NotFound);
    }

    // The global token supersedes every scope.
    if presented == token {
        return Ok(());
    }

    tracing::warn!(permission, "no authorization source for non-global token");
    Err(ApiError::NotImplemented)
}

/// Rejects requests addressing a server that is not registered.
pub async fn server_exists(
    State(state): State<AppState>,
    Path(server): Path<String>,
    req: Request,
    next: Next,
) -> Response {
    if state.servers.contains(&server) {
        next.run(req).await
    } else {
        ApiError::NotFound.into_response()
    }
}
