use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use hex::encode as hex_encode;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{MediaError, MediaResult};
use super::layout::MediaLayout;

pub const KEY_LEN: usize = 16;

/// Descriptor of an asset's key as consumed by the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRef {
    pub asset_id: String,
    /// Reference string the encoder embeds into the manifest.
    pub key_uri: String,
    pub key_path: PathBuf,
    pub key_info_path: PathBuf,
}

impl KeyRef {
    pub fn key_info_contents(&self) -> String {
        format!("{}\n{}\n", self.key_uri, self.key_path.display())
    }
}

/// Creates and looks up per-asset AES-128 keys. The key file is the source of
/// truth: once written it is never replaced.
#[derive(Debug, Clone)]
pub struct KeyManager {
    layout: MediaLayout,
}

impl KeyManager {
    pub fn new(layout: MediaLayout) -> Self {
        Self { layout }
    }

    pub fn key_ref(&self, asset_id: &str) -> MediaResult<KeyRef> {
        Ok(KeyRef {
            asset_id: asset_id.to_string(),
            key_uri: format!("{asset_id}.key"),
            key_path: self.layout.key_path(asset_id)?,
            key_info_path: self.layout.key_info_path(asset_id)?,
        })
    }

    /// Returns the asset's key descriptor, generating the key on first use.
    /// Repeat calls leave both files untouched.
    pub async fn ensure_key(&self, asset_id: &str) -> MediaResult<KeyRef> {
        let key_ref = self.key_ref(asset_id)?;
        let keys_dir = self.layout.keys_dir();
        fs::create_dir_all(&keys_dir)
            .await
            .map_err(MediaError::key_io(&keys_dir))?;

        if self.create_key_exclusive(&key_ref.key_path).await? {
            let fingerprint = self.fingerprint(asset_id).await?;
            info!(asset_id, %fingerprint, "generated asset key");
        } else {
            debug!(asset_id, "reusing existing asset key");
        }
        self.ensure_key_info(&key_ref).await?;
        Ok(key_ref)
    }

    /// Raw key bytes, or `None` when the asset has no key.
    pub async fn load_key(&self, asset_id: &str) -> MediaResult<Option<Vec<u8>>> {
        let path = self.layout.key_path(asset_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(MediaError::KeyIo { source, path }),
        }
    }

    /// Short digest of the key for logs; never the key itself.
    pub async fn fingerprint(&self, asset_id: &str) -> MediaResult<String> {
        let key = self.load_key(asset_id).await?.unwrap_or_default();
        let digest = hex_encode(Sha256::digest(&key));
        Ok(digest[..16].to_string())
    }

    /// Writes fresh key material to a private temp file and hard-links it into
    /// place. The link fails if the key already exists, so concurrent callers
    /// can never observe or produce a partially written key.
    async fn create_key_exclusive(&self, key_path: &Path) -> MediaResult<bool> {
        if fs::metadata(key_path).await.is_ok() {
            return Ok(false);
        }
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);

        let temp_path = key_path.with_extension(format!("key.{}.tmp", Uuid::new_v4().simple()));
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(MediaError::key_io(&temp_path))?;
        file.write_all(&key)
            .await
            .map_err(MediaError::key_io(&temp_path))?;
        file.sync_all()
            .await
            .map_err(MediaError::key_io(&temp_path))?;
        drop(file);

        let linked = fs::hard_link(&temp_path, key_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(MediaError::KeyIo {
                source,
                path: key_path.to_path_buf(),
            }),
        }
    }

    async fn ensure_key_info(&self, key_ref: &KeyRef) -> MediaResult<()> {
        let expected = key_ref.key_info_contents();
        match fs::read_to_string(&key_ref.key_info_path).await {
            Ok(current) if current == expected => return Ok(()),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(MediaError::KeyIo {
                    source,
                    path: key_ref.key_info_path.clone(),
                })
            }
        }
        let temp_path = key_ref
            .key_info_path
            .with_extension(format!("keyinfo.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&temp_path, expected.as_bytes())
            .await
            .map_err(MediaError::key_io(&temp_path))?;
        fs::rename(&temp_path, &key_ref.key_info_path)
            .await
            .map_err(MediaError::key_io(&key_ref.key_info_path))?;
        Ok(())
    }
}
