//! Agent chat, session and tool routes.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use agentgate_agent::{ChatRequest, RunFlags};
use agentgate_core::checkpoint::Checkpoint;
use agentgate_core::error::Error;
use agentgate_core::interrupt::Decision;
use agentgate_core::provider::ToolDefinition;

use crate::SharedState;

// ── Request / Response types ──────────────────────────────────────────────

/// Body of `POST /agent_chat`. Exactly one of `query` and `resume` is set.
#[derive(Debug, Deserialize)]
pub struct AgentChatBody {
    pub session_id: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub resume: Option<ResumeBody>,
    #[serde(default = "default_true")]
    pub internet_search: bool,
    #[serde(default = "default_true")]
    pub retrieval: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResumeBody {
    pub decisions: Vec<Decision>,
}

fn default_true() -> bool {
    true
}

impl AgentChatBody {
    fn into_request(self) -> ChatRequest {
        ChatRequest {
            session_id: self.session_id,
            // The browser client sends an empty query alongside a resume.
            query: self.query.filter(|q| !q.trim().is_empty()),
            resume: self.resume.map(|r| r.decisions),
            flags: RunFlags {
                internet_search: self.internet_search,
                retrieval: self.retrieval,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolDefinition>,
    pub count: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Map a request-boundary error to its HTTP status.
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidResume(_) => StatusCode::CONFLICT,
        Error::ConflictingInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /agent_chat`: start or resume a session and stream its events.
///
/// Boundary errors are answered with a JSON error before any event is
/// sent. Once streaming starts, failures arrive as an `error` event.
pub async fn agent_chat_handler(
    State(state): State<SharedState>,
    Json(body): Json<AgentChatBody>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if body.session_id.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "session_id must not be empty"));
    }
    info!(
        session_id = %body.session_id,
        resume = body.resume.is_some(),
        internet_search = body.internet_search,
        retrieval = body.retrieval,
        "agent_chat request"
    );

    let rx = state
        .runner
        .run_stream(body.into_request())
        .await
        .map_err(|e| {
            let status = status_for(&e);
            if status.is_server_error() {
                error!(error = %e, "agent_chat failed before streaming");
            }
            api_error(status, e.to_string())
        })?;

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /sessions/{id}`: the last committed checkpoint.
pub async fn get_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Checkpoint>, ApiError> {
    match state.runner.checkpoint(&id).await {
        Ok(Some(checkpoint)) => Ok(Json(checkpoint)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Session '{id}' not found"),
        )),
        Err(e) => {
            error!(session_id = %id, error = %e, "Checkpoint lookup failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn list_tools_handler(State(state): State<SharedState>) -> Json<ToolListResponse> {
    let tools = state.runner.tools().definitions();
    let count = tools.len();
    Json(ToolListResponse { tools, count })
}
