use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use recall_core::context::{Capabilities, RequestContext};
use recall_core::events::StreamEvent;
use recall_core::ids::UserId;
use recall_engine::{PromptRequest, PromptResponse};

use crate::error::ApiError;
use crate::server::AppState;

/// Header carrying the authenticated caller, set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

pub async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

/// `POST /api/prompt`
pub async fn prompt(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PromptRequest>, JsonRejection>,
) -> Result<Json<PromptResponse>, ApiError> {
    let ctx = caller_context(&state, &headers)?;
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let response = state.orchestrator.run(request, ctx).await?;
    Ok(Json(response))
}

/// `POST /api/prompt/stream`
pub async fn prompt_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PromptRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let ctx = caller_context(&state, &headers)?;
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request_id = ctx.request_id.clone();

    let rx = state.orchestrator.run_streaming(request, ctx).await?;
    info!(request_id = %request_id, "prompt stream opened");

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            warn!(event = event.event_type(), error = %e, "failed to serialize stream event");
            Event::default().data(json!({"type": "error", "error": recall_core::errors::GENERIC_AI_ERROR}).to_string())
        }
    }
}

/// Identity and capabilities of the caller. Capabilities are decided here,
/// from configuration, and handed to the engine.
pub fn caller_context(state: &AppState, headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let user = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {USER_ID_HEADER} header")))?;

    let capabilities = Capabilities {
        assistant_user: state.assistant_users.contains(user),
    };
    Ok(RequestContext::new(UserId::new(user)).with_capabilities(capabilities))
}
