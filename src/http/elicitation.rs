//! Elicitation endpoints
//!
//! Requests parked by the manager are announced on an SSE stream and listed
//! as pending until a client answers them or they expire.

use super::{AppError, AppState};
use crate::constants::SSE_KEEPALIVE_INTERVAL;
use crate::model::{ElicitationRequest, ElicitationResponse};
use axum::{
    Json, Router,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures::{Stream, stream};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use tokio::sync::broadcast::{self, error::RecvError};

type HandlerResult<T> = std::result::Result<T, AppError>;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/mcp/elicitation/stream", get(stream_elicitations))
        .route("/api/mcp/elicitation/pending", get(pending_elicitations))
        .route("/api/mcp/elicitation/respond", post(respond))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondRequest {
    pub request_id: String,
    pub response: ElicitationResponse,
}

fn request_event(request: &ElicitationRequest) -> Result<Event, axum::Error> {
    Event::default()
        .event("elicitation_request")
        .json_data(json!({ "type": "elicitation_request", "request": request }))
}

struct StreamState {
    backlog: VecDeque<ElicitationRequest>,
    live: broadcast::Receiver<ElicitationRequest>,
}

/// Pending requests first, then new ones as they arrive
///
/// A request parked between the snapshot and the subscription can show up
/// twice; clients key on `requestId`.
async fn stream_elicitations(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let live = state.subscribe_elicitations();
    let backlog = state
        .manager
        .list_pending_elicitations()
        .into_iter()
        .filter_map(|info| info.request)
        .collect();

    let events = stream::unfold(StreamState { backlog, live }, |mut st| async move {
        if let Some(request) = st.backlog.pop_front() {
            return Some((request_event(&request), st));
        }
        loop {
            match st.live.recv().await {
                Ok(request) => return Some((request_event(&request), st)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Elicitation stream lagged, skipped {} requests", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE_INTERVAL))
}

async fn pending_elicitations(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "pending": state.manager.list_pending_elicitations() }))
}

async fn respond(
    State(state): State<AppState>,
    Json(request): Json<RespondRequest>,
) -> HandlerResult<Json<Value>> {
    state
        .manager
        .respond_to_elicitation(&request.request_id, request.response)?;
    Ok(Json(json!({ "success": true })))
}
