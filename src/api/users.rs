//! User autocompletion endpoint, backed by the configured directory.

use axum::Json;
use axum::extract::{Query, State};
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;

use super::{ApiResult, AppState};

pub fn routes() -> axum::Router<AppState> {
    axum::Router::new().route("/users/", get(search_users))
}

#[derive(Debug, Default, Deserialize)]
struct UsersParams {
    #[serde(default)]
    search: String,
}

async fn search_users(
    State(state): State<AppState>,
    Query(params): Query<UsersParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let users = state.directory.search(&params.search);
    Ok(Json(json!({ "users": users })))
}
