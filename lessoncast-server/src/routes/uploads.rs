//! Raw uploads, served for lessons whose conversion fell back.

use std::io::ErrorKind;
use std::path::Path as FsPath;

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/{file}", get(get_upload))
}

/// GET /uploads/{file}
async fn get_upload(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, AppError> {
    let path = state
        .layout()
        .upload_path(&file)
        .map_err(|_| AppError::NotFound("Upload not found".into()))?;
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(AppError::NotFound("Upload not found".into()))
        }
        Err(err) => return Err(AppError::Internal(format!("{}: {err}", path.display()))),
    };
    Ok(([(header::CONTENT_TYPE, content_type_for(&path))], bytes).into_response())
}

fn content_type_for(path: &FsPath) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("mp4" | "m4v") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}
