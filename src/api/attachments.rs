//! Attachment endpoints: multipart upload, archival, and blob serving.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use jiff::Timestamp;
use serde_json::json;

use crate::attachments::{Upload, guess_content_type, save_attachment};

use super::types::attachment_dto;
use super::{ApiError, ApiResult, AppState, blocking, parse_bool, parse_timestamp};

pub fn routes() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/logbooks/{logbook_id}/entries/{entry_id}/attachments/",
            post(upload_attachments),
        )
        .route(
            "/logbooks/{logbook_id}/entries/{entry_id}/attachments/{attachment_id}",
            delete(archive_attachment),
        )
}

/// Multipart upload: repeatable `attachment` file fields, plus optional
/// `timestamp`, `metadata` (a JSON object as a string), and `embedded`.
async fn upload_attachments(
    State(state): State<AppState>,
    Path((_, entry_id)): Path<(i64, i64)>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut uploads: Vec<Upload> = Vec::new();
    let mut timestamp: Option<Timestamp> = None;
    let mut metadata = None;
    let mut embedded = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("malformed multipart body: {err}")))?
    {
        match field.name() {
            Some("attachment") => {
                let filename = field.file_name().unwrap_or("file").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("broken upload: {err}")))?;
                uploads.push(Upload {
                    filename,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            Some("timestamp") => {
                let raw = field.text().await.unwrap_or_default();
                timestamp = Some(parse_timestamp(&raw)?);
            }
            Some("metadata") => {
                let raw = field.text().await.unwrap_or_default();
                let value: serde_json::Value = serde_json::from_str(&raw).map_err(|err| {
                    ApiError::BadRequest(format!("metadata is not valid JSON: {err}"))
                })?;
                match value {
                    serde_json::Value::Object(map) => metadata = Some(map),
                    _ => {
                        return Err(ApiError::BadRequest(
                            "metadata must be a JSON object".into(),
                        ));
                    }
                }
            }
            Some("embedded") => {
                embedded = parse_bool(&field.text().await.unwrap_or_default());
            }
            _ => {}
        }
    }
    if uploads.is_empty() {
        return Err(ApiError::BadRequest("no attachment fields in upload".into()));
    }

    let storage = Arc::clone(&state.storage);
    let blobs = Arc::clone(&state.blobs);
    let dtos = blocking(move || {
        storage.get_entry(entry_id)?;
        let timestamp = timestamp.unwrap_or_else(Timestamp::now);
        let mut dtos = Vec::with_capacity(uploads.len());
        for upload in &uploads {
            let attachment = save_attachment(
                &storage,
                blobs.as_ref(),
                upload,
                timestamp,
                Some(entry_id),
                metadata.clone(),
                embedded,
            )?;
            dtos.push(attachment_dto(&attachment));
        }
        Ok(dtos)
    })
    .await?;
    Ok(Json(json!({ "attachments": dtos })))
}

/// "Deleting" an attachment archives the row; the blob stays put.
async fn archive_attachment(
    State(state): State<AppState>,
    Path((_, _, attachment_id)): Path<(i64, i64, i64)>,
) -> ApiResult<Json<serde_json::Value>> {
    let storage = Arc::clone(&state.storage);
    let dto = blocking(move || {
        let attachment = storage.archive_attachment(attachment_id)?;
        Ok(attachment_dto(&attachment))
    })
    .await?;
    Ok(Json(json!({ "attachment": dto })))
}

/// Streams a blob (or its thumbnail) out of the upload tree.
pub async fn serve_blob(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    let Some(resolved) = state.blobs.resolve(&path) else {
        return Err(ApiError::NotFound(format!("no such attachment: {path}")));
    };
    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|_| ApiError::NotFound(format!("no such attachment: {path}")))?;

    let content_type = if path.ends_with(".thumbnail") {
        "image/jpeg"
    } else {
        guess_content_type(&path).unwrap_or("application/octet-stream")
    };
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::api::testing::{json_body, send, test_app};

    async fn make_entry(app: &axum::Router) -> (i64, i64) {
        let lb = json_body(
            send(app, "POST", "/api/logbooks/", "1.2.3.4", Some(json!({"name": "Test"}))).await,
        )
        .await["logbook"]["id"]
            .as_i64()
            .unwrap();
        let entry = json_body(
            send(
                app,
                "POST",
                &format!("/api/logbooks/{lb}/entries/"),
                "1.2.3.4",
                Some(json!({"title": "t"})),
            )
            .await,
        )
        .await["entry"]["id"]
            .as_i64()
            .unwrap();
        (lb, entry)
    }

    fn multipart_body(boundary: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"attachment\"; filename=\"{filename}\"\r\n\
                 Content-Type: text/plain\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }

    #[tokio::test]
    async fn upload_bind_and_fetch_blob() {
        let (_dir, app) = test_app();
        let (lb, entry) = make_entry(&app).await;

        let boundary = "xyzzy";
        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/logbooks/{lb}/entries/{entry}/attachments/"))
            .header("x-forwarded-for", "1.2.3.4")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(multipart_body(boundary, "notes.txt", b"hello")))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let uploaded = &body["attachments"][0];
        assert_eq!(uploaded["filename"], json!("notes.txt"));
        let link = uploaded["link"].as_str().unwrap().to_string();

        // The entry now lists the attachment.
        let body = json_body(
            send(&app, "GET", &format!("/api/entries/{entry}/"), "1.2.3.4", None).await,
        )
        .await;
        assert_eq!(body["entry"]["attachments"].as_array().unwrap().len(), 1);

        // And the blob is served back.
        let response = send(&app, "GET", &link, "1.2.3.4", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn delete_archives_the_attachment() {
        let (_dir, app) = test_app();
        let (lb, entry) = make_entry(&app).await;

        let boundary = "xyzzy";
        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/logbooks/{lb}/entries/{entry}/attachments/"))
            .header("x-forwarded-for", "1.2.3.4")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(multipart_body(boundary, "old.txt", b"bye")))
            .unwrap();
        let body = json_body(app.clone().oneshot(request).await.unwrap()).await;
        let attachment_id = body["attachments"][0]["id"].as_i64().unwrap();

        let response = send(
            &app,
            "DELETE",
            &format!("/api/logbooks/{lb}/entries/{entry}/attachments/{attachment_id}"),
            "1.2.3.4",
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(
            send(&app, "GET", &format!("/api/entries/{entry}/"), "1.2.3.4", None).await,
        )
        .await;
        assert!(body["entry"]["attachments"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blob_path_escapes_are_refused() {
        let (_dir, app) = test_app();
        let response = send(&app, "GET", "/attachments/../secrets", "1.2.3.4", None).await;
        assert_ne!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_upload_is_400() {
        let (_dir, app) = test_app();
        let (lb, entry) = make_entry(&app).await;
        let boundary = "xyzzy";
        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/logbooks/{lb}/entries/{entry}/attachments/"))
            .header("x-forwarded-for", "1.2.3.4")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(format!("--{boundary}--\r\n")))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
