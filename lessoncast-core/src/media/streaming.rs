use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, warn};

use super::access::{AccessError, KeyAccess, KeyToken};
use super::error::{MediaError, MediaResult};
use super::keys::KeyManager;
use super::layout::{validate_asset_id, validate_file_name, MediaLayout, MediaRoutes, SEGMENT_EXTENSION};
use super::manifest::{map_key_uris, HlsPlaylist};

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
pub const KEY_CONTENT_TYPE: &str = "application/octet-stream";
pub const NO_CACHE: &str = "no-cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub cache_control: Option<&'static str>,
}

#[derive(Debug)]
pub enum KeyFetch {
    Served(MediaPayload),
    NotFound,
    Denied(AccessError),
}

/// Read side of the pipeline. Every lookup is a plain filesystem read; a
/// missing or unaddressable resource is `None`, never an error.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
    layout: MediaLayout,
    routes: MediaRoutes,
    keys: KeyManager,
    access: Option<Arc<KeyAccess>>,
}

impl MediaLibrary {
    pub fn new(layout: MediaLayout, routes: MediaRoutes, access: Option<Arc<KeyAccess>>) -> Self {
        Self {
            keys: KeyManager::new(layout.clone()),
            layout,
            routes,
            access,
        }
    }

    pub fn layout(&self) -> &MediaLayout {
        &self.layout
    }

    pub fn tokens_enabled(&self) -> bool {
        self.access.is_some()
    }

    pub async fn get_manifest(&self, asset_id: &str) -> MediaResult<Option<MediaPayload>> {
        let Ok(path) = self.layout.manifest_path(asset_id) else {
            return Ok(None);
        };
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        let bytes = match &self.access {
            Some(access) => self.sign_manifest(access, asset_id, bytes)?,
            None => bytes,
        };
        Ok(Some(MediaPayload {
            bytes,
            content_type: MANIFEST_CONTENT_TYPE,
            cache_control: Some(NO_CACHE),
        }))
    }

    pub async fn fetch_key(&self, asset_id: &str, token: Option<&KeyToken>) -> MediaResult<KeyFetch> {
        if validate_asset_id(asset_id).is_err() {
            return Ok(KeyFetch::NotFound);
        }
        if let Some(access) = &self.access {
            let checked = match token {
                Some(token) => access.validate(asset_id, token),
                None => Err(AccessError::Missing),
            };
            if let Err(err) = checked {
                debug!(asset_id, error = %err, "key request denied");
                return Ok(KeyFetch::Denied(err));
            }
        }
        Ok(match self.keys.load_key(asset_id).await? {
            Some(bytes) => KeyFetch::Served(MediaPayload {
                bytes,
                content_type: KEY_CONTENT_TYPE,
                cache_control: Some(NO_CACHE),
            }),
            None => KeyFetch::NotFound,
        })
    }

    /// Serves a segment only when the asset's published manifest lists it.
    pub async fn get_segment(
        &self,
        asset_id: &str,
        segment_name: &str,
    ) -> MediaResult<Option<MediaPayload>> {
        if validate_file_name(segment_name).is_err() {
            return Ok(None);
        }
        let (Ok(manifest_path), Ok(segment_path)) = (
            self.layout.manifest_path(asset_id),
            self.layout.segment_path(asset_id, segment_name),
        ) else {
            return Ok(None);
        };
        let Some(manifest) = read_optional(&manifest_path).await? else {
            return Ok(None);
        };
        let listed = HlsPlaylist::parse(&String::from_utf8_lossy(&manifest))
            .map(|playlist| playlist.references_segment(segment_name))
            .unwrap_or(false);
        if !listed {
            return Ok(None);
        }
        let Some(bytes) = read_optional(&segment_path).await? else {
            warn!(asset_id, segment = segment_name, "manifest references a missing segment");
            return Ok(None);
        };
        let content_type = match Path::new(segment_name).extension() {
            Some(ext) if ext == SEGMENT_EXTENSION => SEGMENT_CONTENT_TYPE,
            _ => KEY_CONTENT_TYPE,
        };
        Ok(Some(MediaPayload {
            bytes,
            content_type,
            cache_control: None,
        }))
    }

    /// Adds a fresh token to the key route in the served copy; the file on
    /// disk keeps the plain route.
    fn sign_manifest(&self, access: &KeyAccess, asset_id: &str, bytes: Vec<u8>) -> MediaResult<Vec<u8>> {
        let contents = String::from_utf8_lossy(&bytes);
        let route = self.routes.key_url(asset_id);
        let signed_route = access.signed_key_url(&self.routes, asset_id)?;
        let signed = map_key_uris(&contents, |uri| {
            if uri == route {
                signed_route.clone()
            } else {
                uri.to_string()
            }
        });
        Ok(signed.into_bytes())
    }
}

async fn read_optional(path: &Path) -> MediaResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(MediaError::Io {
            source,
            path: path.to_path_buf(),
        }),
    }
}
