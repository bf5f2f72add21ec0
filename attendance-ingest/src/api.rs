use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use attendance_common::ingest::IngestError;
use attendance_common::store::StoreError;

/// Body returned to the device for every accepted request. Devices ignore
/// it, but it makes manual replay with curl much easier to follow.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_event_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_log_id: Option<i64>,
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("source address is not allowed")]
    ForbiddenSource,
    #[error("invalid webhook token")]
    InvalidToken,
    #[error("failed to parse request body: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("unknown tenant code: {0}")]
    UnknownTenant(String),
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match self {
            WebhookError::ForbiddenSource | WebhookError::InvalidToken => {
                (StatusCode::FORBIDDEN, self.to_string())
            }

            WebhookError::InvalidPayload(_) | WebhookError::UnknownTenant(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            WebhookError::Store(_) | WebhookError::Ingest(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
        .into_response()
    }
}
