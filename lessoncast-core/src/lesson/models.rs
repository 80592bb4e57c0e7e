use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a lesson's video currently stands in the distribution pipeline.
///
/// The on-disk manifest remains the authority on whether an asset is
/// converted; this column mirrors it for listing and reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RenditionState {
    Unconverted,
    Converting,
    Converted,
    Failed,
}

impl RenditionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionState::Unconverted => "unconverted",
            RenditionState::Converting => "converting",
            RenditionState::Converted => "converted",
            RenditionState::Failed => "failed",
        }
    }

    /// Failed conversions are retried on the next access.
    pub fn needs_conversion(&self) -> bool {
        !matches!(self, RenditionState::Converted)
    }
}

impl fmt::Display for RenditionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenditionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unconverted" => Ok(RenditionState::Unconverted),
            "converting" => Ok(RenditionState::Converting),
            "converted" => Ok(RenditionState::Converted),
            "failed" => Ok(RenditionState::Failed),
            other => Err(format!("unknown rendition state: {other}")),
        }
    }
}

/// The only pipeline state stored on the lesson record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LessonVideoReference {
    pub video_url: String,
    pub video_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lesson {
    pub lesson_id: String,
    pub subject_id: String,
    pub teacher_id: String,
    pub title: String,
    pub description: String,
    pub video_url: String,
    pub video_id: Option<String>,
    pub source_file: Option<String>,
    pub rendition_state: RenditionState,
    pub duration_s: i64,
    pub views_count: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Lesson {
    pub fn new(
        lesson_id: impl Into<String>,
        subject_id: impl Into<String>,
        teacher_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            lesson_id: lesson_id.into(),
            subject_id: subject_id.into(),
            teacher_id: teacher_id.into(),
            title: title.into(),
            description: String::new(),
            video_url: String::new(),
            video_id: None,
            source_file: None,
            rendition_state: RenditionState::Unconverted,
            duration_s: 0,
            views_count: 0,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Attaches a raw upload and points the lesson at it until conversion
    /// produces a rendition.
    pub fn with_upload(mut self, source_file: impl Into<String>, uploads_prefix: &str) -> Self {
        let source_file = source_file.into();
        self.video_url = format!("{}/{}", uploads_prefix.trim_end_matches('/'), source_file);
        self.source_file = Some(source_file);
        self
    }

    pub fn video_reference(&self) -> LessonVideoReference {
        LessonVideoReference {
            video_url: self.video_url.clone(),
            video_id: self.video_id.clone(),
        }
    }

    pub fn apply_reference(&mut self, reference: &LessonVideoReference, state: RenditionState) {
        self.video_url = reference.video_url.clone();
        self.video_id = reference.video_id.clone();
        self.rendition_state = state;
    }

    /// Name of the raw upload. Legacy records only carry the upload URL, so
    /// fall back to its last path component.
    pub fn source_file_name(&self) -> Option<String> {
        if let Some(name) = self.source_file.as_deref().filter(|name| !name.is_empty()) {
            return Some(name.to_string());
        }
        self.video_url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        Ok(Self {
            lesson_id: row.get("lesson_id")?,
            subject_id: row.get("subject_id")?,
            teacher_id: row.get("teacher_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            video_url: row.get("video_url")?,
            video_id: row.get("video_id")?,
            source_file: row.get("source_file")?,
            rendition_state: row
                .get::<_, String>("rendition_state")?
                .parse()
                .unwrap_or(RenditionState::Unconverted),
            duration_s: row.get::<_, Option<i64>>("duration_s")?.unwrap_or(0),
            views_count: row.get::<_, Option<i64>>("views_count")?.unwrap_or(0),
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}
