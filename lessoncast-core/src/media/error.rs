use std::path::PathBuf;

use thiserror::Error;

use super::access::AccessError;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid asset id: {0:?}")]
    InvalidAssetId(String),
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("source video unreadable at {path}")]
    SourceUnreadable { path: PathBuf },
    #[error("key io error at {path}: {source}")]
    KeyIo {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("encoding failed (status {status:?}): {stderr}")]
    EncodingFailed { status: Option<i32>, stderr: String },
    #[error("encoding exceeded {seconds}s and was killed")]
    Timeout { seconds: u64 },
    #[error("manifest {path} has no key reference for asset {asset_id}")]
    KeyReferenceMissing { path: PathBuf, asset_id: String },
    #[error("conversion task interrupted: {0}")]
    Interrupted(String),
    #[error(transparent)]
    Access(#[from] AccessError),
}

impl MediaError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> MediaError {
        let path = path.into();
        move |source| MediaError::Io { source, path }
    }

    pub(crate) fn key_io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> MediaError {
        let path = path.into();
        move |source| MediaError::KeyIo { source, path }
    }

    /// Failures of the external transcoder, as opposed to local disk faults.
    pub fn is_encoding_failure(&self) -> bool {
        matches!(
            self,
            MediaError::EncodingFailed { .. } | MediaError::Timeout { .. } | MediaError::Spawn { .. }
        )
    }
}

pub type MediaResult<T> = Result<T, MediaError>;
