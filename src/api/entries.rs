//! Entry endpoints: search within a logbook, creation (including
//! followups), optimistic-concurrency updates, revision history, and the
//! cooperative edit-lock protocol.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use jiff::Timestamp;
use regex::Regex;
use serde_json::json;

use crate::actions::Signal;
use crate::content;
use crate::model::{ChangeMeta, Entry};
use crate::storage::{EntryPatch, NewEntry, SearchQuery, entry_state};

use super::types::{
    AcquireLockRequest, CancelLockRequest, CreateEntryRequest, UpdateEntryRequest, change_dtos,
    entry_dto, lock_dto, logbook_dto, search_hit_dto,
};
use super::{ApiError, ApiResult, AppState, blocking, client_ip, parse_bool, parse_timestamp};

pub fn routes() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/logbooks/{logbook_id}/entries/",
            get(search_entries).post(create_entry),
        )
        .route(
            "/logbooks/{logbook_id}/entries/{entry_id}/",
            get(get_entry_nested)
                .put(update_entry_nested)
                .post(create_followup),
        )
        .route(
            "/logbooks/{logbook_id}/entries/{entry_id}/revisions/",
            get(list_changes_nested),
        )
        .route(
            "/logbooks/{logbook_id}/entries/{entry_id}/revisions/{n}",
            get(get_revision_nested),
        )
        .route(
            "/logbooks/{logbook_id}/entries/{entry_id}/lock",
            get(get_lock_nested)
                .post(acquire_lock_nested)
                .delete(cancel_lock_nested),
        )
        .route("/entries/{entry_id}/", get(get_entry).put(update_entry))
        .route("/entries/{entry_id}/revisions/", get(list_changes))
        .route("/entries/{entry_id}/revisions/{n}", get(get_revision))
        .route(
            "/entries/{entry_id}/lock",
            get(get_lock).post(acquire_lock).delete(cancel_lock),
        )
}

// ── Search ──

fn parse_search(pairs: &[(String, String)]) -> ApiResult<(SearchQuery, Option<String>)> {
    let mut query = SearchQuery {
        child_logbooks: true,
        n: Some(50),
        ..SearchQuery::default()
    };
    let mut download = None;

    for (key, value) in pairs {
        match key.as_str() {
            "title" => query.title_filter = Some(checked_regex(value)?),
            "content" => query.content_filter = Some(checked_regex(value)?),
            "authors" => query.author_filter = Some(checked_regex(value)?),
            "attachments" => query.attachment_filter = Some(checked_regex(value)?),
            "attribute" => query.attribute_filters.push(name_value_pair(key, value)?),
            "metadata" => query.metadata_filters.push(name_value_pair(key, value)?),
            "archived" => query.archived = parse_bool(value),
            "ignore_children" => query.child_logbooks = !parse_bool(value),
            "followups" => query.followups = parse_bool(value),
            "sort_by_timestamp" => query.sort_by_timestamp = parse_bool(value),
            "n" => query.n = Some(parse_int(key, value)?),
            "offset" => query.offset = parse_int(key, value)?,
            "from" => query.from_timestamp = Some(parse_timestamp(value)?),
            "until" => query.until_timestamp = Some(parse_timestamp(value)?),
            "download" => download = Some(value.clone()),
            _ => {}
        }
    }
    Ok((query, download))
}

fn checked_regex(raw: &str) -> ApiResult<String> {
    Regex::new(raw)
        .map(|_| raw.to_string())
        .map_err(|err| ApiError::BadRequest(format!("invalid regular expression: {err}")))
}

fn name_value_pair(key: &str, raw: &str) -> ApiResult<(String, String)> {
    raw.split_once(':')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| ApiError::BadRequest(format!("{key} filters take the form name:value")))
}

fn parse_int(key: &str, raw: &str) -> ApiResult<u32> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("{key} must be a non-negative integer")))
}

async fn search_entries(
    State(state): State<AppState>,
    Path(logbook_id): Path<i64>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Response> {
    let (mut query, download) = parse_search(&pairs)?;
    query.logbook = Some(logbook_id);

    let storage = Arc::clone(&state.storage);
    let exporter = state.exporter.clone();
    let result = blocking(move || {
        let logbook = storage.get_logbook(logbook_id)?;
        let hits = storage.search(&query)?;
        let count = storage.search_count(&query)?;

        if let Some(format) = download {
            let Some(exporter) = exporter else {
                return Err(ApiError::BadRequest(format!(
                    "no exporter configured for download={format}"
                )));
            };
            let export = exporter
                .export(Some(&logbook), &hits)
                .map_err(|err| ApiError::Internal(format!("export failed: {err}")))?;
            return Ok(Err((logbook.name.clone(), export)));
        }

        let dtos = hits
            .iter()
            .map(|hit| search_hit_dto(&storage, hit))
            .collect::<Result<Vec<_>, _>>()?;
        let logbook = logbook_dto(&storage, &logbook)?;
        Ok(Ok(json!({ "logbook": logbook, "entries": dtos, "count": count })))
    })
    .await?;

    match result {
        Ok(body) => Ok(Json(body).into_response()),
        Err((name, export)) => {
            let disposition = format!("attachment; filename=\"{name}.{}\"",
                if export.content_type.contains("pdf") { "pdf" } else { "html" });
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, export.content_type.clone()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                export.bytes,
            )
                .into_response())
        }
    }
}

// ── Create / fetch / update ──

struct PreparedContent {
    content: Option<String>,
    attachment_ids: Vec<i64>,
}

/// Runs the HTML ingest pass when the content type calls for it. Inline
/// attachments come back unbound and are bound once the entry id is known.
fn prepare_content(
    state: &AppState,
    content: Option<&str>,
    content_type: &str,
    timestamp: Timestamp,
    entry_id: Option<i64>,
) -> ApiResult<PreparedContent> {
    match content {
        Some(html) if content_type.starts_with("text/html") => {
            let ingested =
                content::ingest_html(&state.storage, state.blobs.as_ref(), html, timestamp, entry_id)?;
            Ok(PreparedContent {
                content: Some(ingested.content),
                attachment_ids: ingested.attachments.iter().map(|a| a.id).collect(),
            })
        }
        other => Ok(PreparedContent {
            content: other.map(str::to_string),
            attachment_ids: Vec::new(),
        }),
    }
}

async fn create_entry(
    state: State<AppState>,
    Path(logbook_id): Path<i64>,
    Json(request): Json<CreateEntryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    create(state, logbook_id, None, request).await
}

async fn create_followup(
    state: State<AppState>,
    Path((logbook_id, entry_id)): Path<(i64, i64)>,
    Json(request): Json<CreateEntryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    create(state, logbook_id, Some(entry_id), request).await
}

async fn create(
    State(state): State<AppState>,
    logbook_id: i64,
    follows_override: Option<i64>,
    request: CreateEntryRequest,
) -> ApiResult<Json<serde_json::Value>> {
    let created_at = request
        .created_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;
    let last_changed_at = request
        .last_changed_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;

    let shared = state.clone();
    let dto = blocking(move || {
        let content_type = request
            .content_type
            .clone()
            .unwrap_or_else(|| crate::model::DEFAULT_CONTENT_TYPE.to_string());
        let prepared = prepare_content(
            &shared,
            request.content.as_deref(),
            &content_type,
            created_at.unwrap_or_else(Timestamp::now),
            None,
        )?;

        let entry = shared.storage.create_entry(NewEntry {
            logbook_id,
            title: request.title,
            authors: request.authors,
            content: prepared.content,
            content_type: Some(content_type),
            metadata: request.metadata,
            attributes: request.attributes,
            priority: request.priority,
            created_at,
            last_changed_at,
            follows_id: follows_override.or(request.follows_id),
            archived: request.archived,
        })?;
        shared
            .storage
            .bind_attachments(&prepared.attachment_ids, entry.id)?;
        Ok(entry_dto(&shared.storage, &entry)?)
    })
    .await?;

    let payload = json!({ "entry": dto });
    state.dispatcher.dispatch(Signal::NewEntry, payload.clone());
    Ok(Json(payload))
}

#[derive(Debug, Default, serde::Deserialize)]
struct GetEntryParams {
    #[serde(default)]
    thread: bool,
}

async fn get_entry(
    state: State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<GetEntryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    fetch(state, id, params).await
}

async fn get_entry_nested(
    state: State<AppState>,
    Path((_, id)): Path<(i64, i64)>,
    Query(params): Query<GetEntryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    fetch(state, id, params).await
}

async fn fetch(
    State(state): State<AppState>,
    id: i64,
    params: GetEntryParams,
) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let dto = blocking(move || {
        let entry: Entry = if params.thread {
            storage.thread_root(id)?
        } else {
            storage.get_entry(id)?
        };
        Ok(entry_dto(&storage, &entry)?)
    })
    .await?;
    Ok(Json(json!({ "entry": dto })))
}

async fn update_entry(
    state: State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<UpdateEntryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    update(state, id, headers, request).await
}

async fn update_entry_nested(
    state: State<AppState>,
    Path((_, id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(request): Json<UpdateEntryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    update(state, id, headers, request).await
}

async fn update(
    State(state): State<AppState>,
    id: i64,
    headers: HeaderMap,
    request: UpdateEntryRequest,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = client_ip(&headers);
    let created_at = request
        .created_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;
    let last_changed_at = request
        .last_changed_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;

    let shared = state.clone();
    let dto = blocking(move || {
        // The ingest pass knows the entry id up front on edits, so inline
        // attachments bind immediately.
        let content = match &request.content {
            Some(Some(html)) => {
                let content_type = request
                    .content_type
                    .clone()
                    .or_else(|| shared.storage.get_entry(id).ok().map(|e| e.content_type))
                    .unwrap_or_else(|| crate::model::DEFAULT_CONTENT_TYPE.to_string());
                let prepared = prepare_content(
                    &shared,
                    Some(html),
                    &content_type,
                    Timestamp::now(),
                    Some(id),
                )?;
                Some(prepared.content)
            }
            Some(None) => Some(None),
            None => None,
        };

        let patch = EntryPatch {
            title: request.title,
            authors: request.authors,
            content,
            content_type: request.content_type,
            metadata: request.metadata,
            attributes: request.attributes,
            priority: request.priority,
            follows_id: request.follows_id,
            archived: request.archived,
            created_at,
            last_changed_at,
        };
        let meta = ChangeMeta {
            ip: Some(ip),
            comment: request.change_comment,
            ..ChangeMeta::default()
        };
        let entry = shared
            .storage
            .update_entry(id, &patch, request.revision_n, &meta)?;
        Ok(entry_dto(&shared.storage, &entry)?)
    })
    .await?;

    let payload = json!({ "entry": dto });
    state.dispatcher.dispatch(Signal::EditEntry, payload.clone());
    Ok(Json(payload))
}

// ── Revisions ──

async fn list_changes(
    state: State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    changes(state, id).await
}

async fn list_changes_nested(
    state: State<AppState>,
    Path((_, id)): Path<(i64, i64)>,
) -> ApiResult<Json<serde_json::Value>> {
    changes(state, id).await
}

async fn changes(State(state): State<AppState>, id: i64) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let changes = blocking(move || {
        let entry = storage.get_entry(id)?;
        let changes = storage.entry_changes(id)?;
        Ok(change_dtos(&entry_state(&entry), &changes))
    })
    .await?;
    Ok(Json(json!({ "entry_changes": changes })))
}

async fn get_revision(
    state: State<AppState>,
    Path((id, n)): Path<(i64, usize)>,
) -> ApiResult<Json<serde_json::Value>> {
    revision(state, id, n).await
}

async fn get_revision_nested(
    state: State<AppState>,
    Path((_, id, n)): Path<(i64, i64, usize)>,
) -> ApiResult<Json<serde_json::Value>> {
    revision(state, id, n).await
}

async fn revision(
    State(state): State<AppState>,
    id: i64,
    n: usize,
) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let view = blocking(move || Ok(storage.entry_revision(id, n)?)).await?;
    Ok(Json(json!({ "entry_revision": view })))
}

// ── Locks ──

async fn get_lock(state: State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<serde_json::Value>> {
    read_lock(state, id).await
}

async fn get_lock_nested(
    state: State<AppState>,
    Path((_, id)): Path<(i64, i64)>,
) -> ApiResult<Json<serde_json::Value>> {
    read_lock(state, id).await
}

async fn read_lock(State(state): State<AppState>, id: i64) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let lock = blocking(move || Ok(storage.get_lock(id, None, false, false, None)?)).await?;
    match lock {
        Some(lock) => Ok(Json(json!({ "lock": lock_dto(&lock) }))),
        None => Err(ApiError::NotFound(format!("no active lock on entry {id}"))),
    }
}

async fn acquire_lock(
    state: State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Option<Json<AcquireLockRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    acquire(state, id, headers, body).await
}

async fn acquire_lock_nested(
    state: State<AppState>,
    Path((_, id)): Path<(i64, i64)>,
    headers: HeaderMap,
    body: Option<Json<AcquireLockRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    acquire(state, id, headers, body).await
}

async fn acquire(
    State(state): State<AppState>,
    id: i64,
    headers: HeaderMap,
    body: Option<Json<AcquireLockRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = client_ip(&headers);
    let steal = body.map(|Json(b)| b.steal).unwrap_or_default();
    let ttl = state.lock_ttl;
    let storage = Arc::clone(&state.storage);
    let lock = blocking(move || {
        Ok(storage.get_lock(id, Some(ip.as_str()), true, steal, Some(ttl))?)
    })
    .await?;
    let lock = lock.ok_or_else(|| ApiError::Internal("acquire returned no lock".into()))?;
    Ok(Json(json!({ "lock": lock_dto(&lock) })))
}

async fn cancel_lock(
    state: State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Option<Json<CancelLockRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    cancel(state, id, headers, body).await
}

async fn cancel_lock_nested(
    state: State<AppState>,
    Path((_, id)): Path<(i64, i64)>,
    headers: HeaderMap,
    body: Option<Json<CancelLockRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    cancel(state, id, headers, body).await
}

async fn cancel(
    State(state): State<AppState>,
    id: i64,
    headers: HeaderMap,
    body: Option<Json<CancelLockRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = client_ip(&headers);
    let lock_id = body.and_then(|Json(b)| b.lock_id);
    let storage = Arc::clone(&state.storage);
    let lock = blocking(move || {
        let lock_id = match lock_id {
            Some(lock_id) => lock_id,
            None => storage
                .get_lock(id, None, false, false, None)?
                .ok_or(crate::storage::StorageError::LockNotFound(id))?
                .id,
        };
        Ok(storage.cancel_lock(lock_id, Some(ip.as_str()))?)
    })
    .await?;
    Ok(Json(json!({ "lock": lock_dto(&lock) })))
}
