use std::path::{Component, Path, PathBuf};

use crate::config::LessoncastConfig;

use super::error::{MediaError, MediaResult};

pub const MANIFEST_NAME: &str = "index.m3u8";
pub const MANIFEST_EXTENSION: &str = "m3u8";
pub const STAGING_MANIFEST_NAME: &str = "index.m3u8.part";
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";
pub const SEGMENT_EXTENSION: &str = "ts";
pub const REWRITE_MARKER_NAME: &str = ".key-uri-rewritten";

const UPLOADS_DIR: &str = "uploads";
const KEYS_DIR: &str = "keys";
const HLS_DIR: &str = "hls";
const MAX_ASSET_ID_LEN: usize = 128;

/// On-disk layout beneath the service data root:
///
/// ```text
/// uploads/<file>                  raw source video
/// keys/<asset>.key                16 raw key bytes
/// keys/<asset>.keyinfo            key reference + key local path
/// hls/<asset>/index.m3u8          published manifest
/// hls/<asset>/segment_NNN.ts      encrypted segments
/// ```
///
/// Every path handed out is confined to its directory; names that could
/// escape it are rejected.
#[derive(Debug, Clone)]
pub struct MediaLayout {
    root: PathBuf,
}

impl MediaLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &LessoncastConfig) -> Self {
        Self::new(config.data_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join(KEYS_DIR)
    }

    pub fn hls_dir(&self) -> PathBuf {
        self.root.join(HLS_DIR)
    }

    pub async fn ensure_directories(&self) -> MediaResult<()> {
        for dir in [self.uploads_dir(), self.keys_dir(), self.hls_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(MediaError::io(&dir))?;
        }
        Ok(())
    }

    pub fn upload_path(&self, file_name: &str) -> MediaResult<PathBuf> {
        validate_file_name(file_name)?;
        Ok(self.uploads_dir().join(file_name))
    }

    pub fn key_path(&self, asset_id: &str) -> MediaResult<PathBuf> {
        validate_asset_id(asset_id)?;
        Ok(self.keys_dir().join(format!("{asset_id}.key")))
    }

    pub fn key_info_path(&self, asset_id: &str) -> MediaResult<PathBuf> {
        validate_asset_id(asset_id)?;
        Ok(self.keys_dir().join(format!("{asset_id}.keyinfo")))
    }

    pub fn asset_dir(&self, asset_id: &str) -> MediaResult<PathBuf> {
        validate_asset_id(asset_id)?;
        Ok(self.hls_dir().join(asset_id))
    }

    pub fn manifest_path(&self, asset_id: &str) -> MediaResult<PathBuf> {
        Ok(self.asset_dir(asset_id)?.join(MANIFEST_NAME))
    }

    pub fn staging_manifest_path(&self, asset_id: &str) -> MediaResult<PathBuf> {
        Ok(self.asset_dir(asset_id)?.join(STAGING_MANIFEST_NAME))
    }

    pub fn rewrite_marker_path(&self, asset_id: &str) -> MediaResult<PathBuf> {
        Ok(self.asset_dir(asset_id)?.join(REWRITE_MARKER_NAME))
    }

    pub fn segment_path(&self, asset_id: &str, segment_name: &str) -> MediaResult<PathBuf> {
        validate_file_name(segment_name)?;
        Ok(self.asset_dir(asset_id)?.join(segment_name))
    }

    /// An asset is converted exactly when its published manifest exists.
    pub fn is_converted(&self, asset_id: &str) -> bool {
        self.manifest_path(asset_id)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }
}

/// Externally visible URLs for pipeline artifacts.
#[derive(Debug, Clone)]
pub struct MediaRoutes {
    media_prefix: String,
    uploads_prefix: String,
}

impl MediaRoutes {
    pub fn new(media_prefix: impl Into<String>, uploads_prefix: impl Into<String>) -> Self {
        Self {
            media_prefix: media_prefix.into().trim_end_matches('/').to_string(),
            uploads_prefix: uploads_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &LessoncastConfig) -> Self {
        Self::new(&config.server.media_prefix, &config.server.uploads_prefix)
    }

    pub fn media_prefix(&self) -> &str {
        &self.media_prefix
    }

    pub fn uploads_prefix(&self) -> &str {
        &self.uploads_prefix
    }

    pub fn manifest_url(&self, asset_id: &str) -> String {
        format!("{}/{asset_id}/{MANIFEST_NAME}", self.media_prefix)
    }

    pub fn key_url(&self, asset_id: &str) -> String {
        format!("{}/key/{asset_id}", self.media_prefix)
    }

    pub fn upload_url(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.uploads_prefix)
    }

    /// True when `url` already references a rendition rather than a raw upload.
    pub fn is_rendition_url(&self, url: &str) -> bool {
        url.contains(&format!("{}/", self.media_prefix))
            || url.ends_with(&format!(".{MANIFEST_EXTENSION}"))
    }
}

impl Default for MediaRoutes {
    fn default() -> Self {
        Self::new("/media", "/uploads")
    }
}

pub fn validate_asset_id(asset_id: &str) -> MediaResult<()> {
    let valid = !asset_id.is_empty()
        && asset_id.len() <= MAX_ASSET_ID_LEN
        && !asset_id.starts_with('.')
        && asset_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(MediaError::InvalidAssetId(asset_id.to_string()))
    }
}

/// Accepts only a single plain path component that is not hidden.
pub fn validate_file_name(name: &str) -> MediaResult<()> {
    let mut components = Path::new(name).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if single_normal
        && !name.starts_with('.')
        && !name.contains(|c: char| c == '/' || c == '\\')
        && !name.chars().any(char::is_control)
    {
        Ok(())
    } else {
        Err(MediaError::InvalidFileName(name.to_string()))
    }
}
