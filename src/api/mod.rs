//! Thin HTTP adapter over the core: argument validation, marshalling,
//! and error mapping. No business logic lives here; handlers parse,
//! call into storage/pipelines on a blocking task, and fire the
//! post-commit signals.

mod attachments;
mod entries;
mod logbooks;
mod types;
mod users;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use jiff::civil;
use jiff::tz::TimeZone;
use jiff::{Span, Timestamp};
use serde_json::json;

use crate::actions::Dispatcher;
use crate::attachments::{AttachmentError, LocalBlobs};
use crate::content::ContentError;
use crate::export::Exporter;
use crate::storage::{Storage, StorageError};
use crate::users::Directory;

use types::lock_dto;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub blobs: Arc<LocalBlobs>,
    pub dispatcher: Dispatcher,
    pub directory: Arc<dyn Directory>,
    pub exporter: Option<Arc<dyn Exporter>>,
    /// Lifetime of freshly acquired edit locks.
    pub lock_ttl: Span,
}

/// Builds the `/api` router plus the blob-serving route.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(logbooks::routes())
        .merge(entries::routes())
        .merge(attachments::routes())
        .merge(users::routes());
    Router::new()
        .nest("/api", api)
        .route("/attachments/{*path}", get(attachments::serve_blob))
        .with_state(state)
}

/// API error taxonomy; each variant maps to exactly one status code.
#[derive(Debug)]
pub enum ApiError {
    /// 404: unknown logbook/entry/lock/revision/attachment.
    NotFound(String),
    /// 400: malformed input, missing `revision_n`.
    BadRequest(String),
    /// 422: attribute validation failure.
    Validation(String),
    /// 409: stale revision or integrity violation.
    Conflict(String),
    /// 409: locked by another IP; carries the lock descriptor.
    Locked {
        message: String,
        lock: types::LockDto,
    },
    /// 500: I/O, parser, unexpected. Logged on construction.
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, json!({ "message": message })),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, json!({ "message": message })),
            Self::Validation(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "message": message }),
            ),
            Self::Conflict(message) => (StatusCode::CONFLICT, json!({ "message": message })),
            Self::Locked { message, lock } => (
                StatusCode::CONFLICT,
                json!({ "message": message, "lock": lock }),
            ),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "message": message }),
            ),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::LogbookNotFound(_)
            | StorageError::EntryNotFound(_)
            | StorageError::LockNotFound(_)
            | StorageError::AttachmentNotFound(_)
            | StorageError::RevisionNotFound { .. } => Self::NotFound(err.to_string()),
            StorageError::MissingRevision(_) => Self::BadRequest(err.to_string()),
            StorageError::StaleRevision { .. } | StorageError::ParentCycle { .. } => {
                Self::Conflict(err.to_string())
            }
            StorageError::EntryLocked { lock } => Self::Locked {
                message: err.to_string(),
                lock: lock_dto(lock),
            },
            StorageError::DuplicateAttribute(_)
            | StorageError::CrossLogbookFollowup { .. }
            | StorageError::Attributes(_) => Self::Validation(err.to_string()),
            StorageError::UnsupportedSqlite(_)
            | StorageError::Db(_)
            | StorageError::Json(_)
            | StorageError::Time(_) => internal(&err),
        }
    }
}

impl From<AttachmentError> for ApiError {
    fn from(err: AttachmentError) -> Self {
        match err {
            AttachmentError::Storage(inner) => inner.into(),
            AttachmentError::Io(_) => internal(&err),
        }
    }
}

impl From<ContentError> for ApiError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::Attachment(inner) => inner.into(),
        }
    }
}

fn internal(err: &dyn std::fmt::Display) -> ApiError {
    tracing::error!(%err, "internal error");
    ApiError::Internal(err.to_string())
}

/// Runs a synchronous core operation off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ApiResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::Internal(format!("task failed: {err}")))?
}

/// The caller's address, as reported by the front proxy. Lock ownership
/// and change attribution key off this.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Parses a request timestamp: RFC 3339 with an offset, or a naive
/// date-time taken as UTC (imports often carry those).
pub(crate) fn parse_timestamp(raw: &str) -> ApiResult<Timestamp> {
    if let Ok(ts) = raw.parse::<Timestamp>() {
        return Ok(ts);
    }
    let naive = raw
        .parse::<civil::DateTime>()
        .map_err(|_| ApiError::BadRequest(format!("unparseable timestamp: {raw}")))?;
    naive
        .to_zoned(TimeZone::UTC)
        .map(|zoned| zoned.timestamp())
        .map_err(|_| ApiError::BadRequest(format!("unparseable timestamp: {raw}")))
}

/// Query-string boolean: `1`, `true`, `yes`, `on` (or a bare flag) are
/// true; everything else is false.
pub(crate) fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "" | "1" | "true" | "yes" | "on"
    )
}
