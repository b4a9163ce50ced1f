//! Logbook endpoints: listing, creation, updates, and revision history.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::get;
use serde_json::json;

use crate::actions::Signal;
use crate::model::ChangeMeta;
use crate::storage::{LogbookPatch, NewLogbook, logbook_state};

use super::types::{
    CreateLogbookRequest, UpdateLogbookRequest, change_dtos, logbook_dto,
};
use super::{ApiResult, AppState, blocking, client_ip};

pub fn routes() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/logbooks/", get(list_logbooks).post(create_logbook))
        .route(
            "/logbooks/{logbook_id}/",
            get(get_logbook).post(create_child).put(update_logbook),
        )
        .route("/logbooks/{logbook_id}/revisions/", get(list_changes))
        .route("/logbooks/{logbook_id}/revisions/{n}/", get(get_revision))
}

async fn list_logbooks(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let logbooks = blocking(move || {
        let logbooks = storage.list_top_level_logbooks(false)?;
        let dtos = logbooks
            .iter()
            .map(|lb| logbook_dto(&storage, lb))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dtos)
    })
    .await?;
    Ok(Json(json!({ "logbooks": logbooks })))
}

async fn create_logbook(
    state: State<AppState>,
    Json(request): Json<CreateLogbookRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    create(state, request, None).await
}

async fn create_child(
    state: State<AppState>,
    Path(parent_id): Path<i64>,
    Json(request): Json<CreateLogbookRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    create(state, request, Some(parent_id)).await
}

async fn create(
    State(state): State<AppState>,
    request: CreateLogbookRequest,
    parent_override: Option<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let dto = blocking(move || {
        let logbook = storage.create_logbook(NewLogbook {
            name: request.name,
            description: request.description,
            template: request.template,
            template_content_type: request.template_content_type,
            parent_id: parent_override.or(request.parent_id),
            attributes: request.attributes,
            metadata: request.metadata,
            archived: request.archived,
        })?;
        Ok(logbook_dto(&storage, &logbook)?)
    })
    .await?;
    let payload = json!({ "logbook": dto });
    state.dispatcher.dispatch(Signal::NewLogbook, payload.clone());
    Ok(Json(payload))
}

async fn get_logbook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let dto = blocking(move || {
        let logbook = storage.get_logbook(id)?;
        Ok(logbook_dto(&storage, &logbook)?)
    })
    .await?;
    Ok(Json(json!({ "logbook": dto })))
}

async fn update_logbook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<UpdateLogbookRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let ip = client_ip(&headers);
    let dto = blocking(move || {
        let patch = LogbookPatch {
            name: request.name,
            description: request.description,
            template: request.template,
            template_content_type: request.template_content_type,
            parent_id: request.parent_id,
            attributes: request.attributes,
            metadata: request.metadata,
            archived: request.archived,
        };
        let meta = ChangeMeta {
            ip: Some(ip),
            ..ChangeMeta::default()
        };
        let logbook = storage.update_logbook(id, &patch, &meta)?;
        Ok(logbook_dto(&storage, &logbook)?)
    })
    .await?;
    let payload = json!({ "logbook": dto });
    state.dispatcher.dispatch(Signal::EditLogbook, payload.clone());
    Ok(Json(payload))
}

async fn list_changes(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let changes = blocking(move || {
        let logbook = storage.get_logbook(id)?;
        let changes = storage.logbook_changes(id)?;
        Ok(change_dtos(&logbook_state(&logbook), &changes))
    })
    .await?;
    Ok(Json(json!({ "logbook_changes": changes })))
}

async fn get_revision(
    State(state): State<AppState>,
    Path((id, n)): Path<(i64, usize)>,
) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let view = blocking(move || Ok(storage.logbook_revision(id, n)?)).await?;
    Ok(Json(json!({ "logbook_revision": view })))
}
