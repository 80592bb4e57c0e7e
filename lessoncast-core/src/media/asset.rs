use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use crate::lesson::{Lesson, RenditionState};

use super::error::MediaResult;
use super::layout::{validate_asset_id, MediaLayout};

/// One source video and everything derived from it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VideoAsset {
    pub asset_id: String,
    pub source_path: PathBuf,
    pub rendition_state: RenditionState,
}

impl VideoAsset {
    /// Resolves the asset for a lesson, reusing its recorded asset id so that
    /// retries land on the same key and output directory.
    pub fn for_lesson(
        lesson: &Lesson,
        source_file: &str,
        layout: &MediaLayout,
    ) -> MediaResult<Self> {
        let asset_id = match lesson.video_id.as_deref() {
            Some(existing) if validate_asset_id(existing).is_ok() => existing.to_string(),
            _ => generate_asset_id(&lesson.lesson_id),
        };
        validate_asset_id(&asset_id)?;
        Ok(Self {
            source_path: layout.upload_path(source_file)?,
            asset_id,
            rendition_state: lesson.rendition_state,
        })
    }
}

/// `lesson-<lessonId>-<random>`; the random suffix keeps ids unique even for
/// concurrent creations against the same lesson.
pub fn generate_asset_id(lesson_id: &str) -> String {
    let sanitized: String = lesson_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .take(64)
        .collect();
    format!("lesson-{sanitized}-{}", Uuid::new_v4().simple())
}
