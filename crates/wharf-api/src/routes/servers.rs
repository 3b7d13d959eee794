use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::error::Category;

use crate::dispatcher::PowerAction;
use crate::dto::{PowerActionRequest, ServerResponse};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn index() -> &'static str {
    "Welcome!\n"
}

pub async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerResponse>> {
    let servers = state.servers.all();
    Json(servers.iter().map(|s| ServerResponse::from(s.as_ref())).collect())
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(server): Path<String>,
) -> Result<Json<ServerResponse>, ApiError> {
    // Can still miss if the server was removed after the existence check.
    let server = state.servers.get(&server).ok_or(ApiError::NotFound)?;
    Ok(Json(ServerResponse::from(server.as_ref())))
}

/// Accepts a power action and runs it in the background. The response never
/// reflects the outcome; clients watch the event stream for that.
pub async fn server_power(
    State(state): State<AppState>,
    Path(server): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let server = state.servers.get(&server).ok_or(ApiError::NotFound)?;

    // Only the first JSON value counts; `null` is an empty request.
    let decoded = serde_json::Deserializer::from_slice(&body)
        .into_iter::<Option<PowerActionRequest>>()
        .next();
    let req = match decoded {
        Some(Ok(req)) => req.unwrap_or_default(),
        Some(Err(e)) => {
            // Empty and truncated bodies are routine; only log real parse errors.
            if e.classify() != Category::Eof {
                tracing::error!(server = %server.id(), error = %e, "failed to decode power action");
            }
            return Err(unparsable());
        }
        None => return Err(unparsable()),
    };

    let action: PowerAction = req.action.parse().map_err(|_| ApiError::NotFound)?;

    state.dispatcher.dispatch(server, action);
    Ok(StatusCode::ACCEPTED)
}

fn unparsable() -> ApiError {
    ApiError::Internal("could not parse power action from request".into())
}
