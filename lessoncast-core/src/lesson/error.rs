use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LessonError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lesson {lesson_id} not found")]
    NotFound { lesson_id: String },
    #[error("lesson {lesson_id} already exists")]
    AlreadyExists { lesson_id: String },
    #[error("lesson store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type LessonResult<T> = std::result::Result<T, LessonError>;
