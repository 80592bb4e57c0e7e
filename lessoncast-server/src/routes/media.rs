//! Manifest, key and segment delivery plus on-demand conversion.

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use lessoncast_core::media::{KeyFetch, KeyToken, MediaPayload, MANIFEST_NAME};

use crate::error::AppError;
use crate::state::AppState;

/// Query carried by signed key URLs.
#[derive(Debug, Default, Deserialize)]
pub struct KeyQuery {
    pub expires: Option<i64>,
    pub token: Option<String>,
}

impl KeyQuery {
    fn token(self) -> Option<KeyToken> {
        match (self.expires, self.token) {
            (Some(expires), Some(token)) => Some(KeyToken { expires, token }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertResponse {
    pub message: String,
    pub video_url: String,
    pub video_id: Option<String>,
    pub encrypted: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/key/{id}", get(get_key))
        .route("/{id}/convert", post(convert_lesson))
        .route("/{id}/{name}", get(get_asset_file))
}

/// GET /media/key/{id}
async fn get_key(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    Query(query): Query<KeyQuery>,
) -> Result<Response, AppError> {
    let token = query.token();
    match state.library.fetch_key(&asset_id, token.as_ref()).await? {
        KeyFetch::Served(payload) => Ok(payload_response(payload)),
        KeyFetch::NotFound => Err(AppError::NotFound("Key not found".into())),
        KeyFetch::Denied(err) => Err(AppError::Forbidden(err.to_string())),
    }
}

/// GET /media/{id}/{name}
///
/// `index.m3u8` is the manifest; any other name is a segment, served only
/// when the manifest lists it.
async fn get_asset_file(
    State(state): State<AppState>,
    Path((asset_id, name)): Path<(String, String)>,
) -> Result<Response, AppError> {
    if name == MANIFEST_NAME {
        return match state.library.get_manifest(&asset_id).await? {
            Some(payload) => Ok(payload_response(payload)),
            None => Err(AppError::NotFound("Playlist not found".into())),
        };
    }
    match state.library.get_segment(&asset_id, &name).await? {
        Some(payload) => Ok(payload_response(payload)),
        None => Err(AppError::NotFound("Segment not found".into())),
    }
}

/// POST /media/{id}/convert
async fn convert_lesson(
    State(state): State<AppState>,
    Path(lesson_id): Path<String>,
) -> Result<Json<ConvertResponse>, AppError> {
    let outcome = state.coordinator.convert_lesson_by_id(&lesson_id).await?;
    let message = if outcome.encrypted {
        "Video converted to HLS successfully"
    } else {
        "Video conversion failed, serving original upload"
    };
    Ok(Json(ConvertResponse {
        message: message.to_string(),
        video_url: outcome.reference.video_url,
        video_id: outcome.reference.video_id,
        encrypted: outcome.encrypted,
    }))
}

fn payload_response(payload: MediaPayload) -> Response {
    let mut response = ([(header::CONTENT_TYPE, payload.content_type)], payload.bytes).into_response();
    if let Some(cache_control) = payload.cache_control {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static(cache_control),
        );
    }
    response
}
