use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::info;

use crate::config::LessoncastConfig;

use super::layout::MediaRoutes;

const SECRET_LEN: usize = 32;

/// Longest accepted token lifetime: one week.
pub const MAX_TOKEN_TTL_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("token secret at {0} is empty")]
    EmptySecret(PathBuf),
    #[error("hmac error")]
    Hmac,
    #[error("key token missing")]
    Missing,
    #[error("key token expired")]
    Expired,
    #[error("invalid key token signature")]
    InvalidSignature,
    #[error("token ttl of {0} minutes is outside 1..={max}", max = MAX_TOKEN_TTL_MINUTES)]
    InvalidTtl(u64),
    #[error("token expiry is out of range")]
    ExpiryOutOfRange,
}

type HmacSha256 = Hmac<Sha256>;

/// A signed grant to fetch one asset's key until `expires` (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyToken {
    pub expires: i64,
    pub token: String,
}

impl KeyToken {
    pub fn query(&self) -> String {
        format!("expires={}&token={}", self.expires, self.token)
    }
}

/// Issues and checks HMAC-SHA256 key tokens bound to an asset id.
pub struct KeyAccess {
    secret: Vec<u8>,
    ttl: chrono::Duration,
}

impl std::fmt::Debug for KeyAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyAccess").field("ttl", &self.ttl).finish()
    }
}

impl KeyAccess {
    pub fn new(secret: Vec<u8>, ttl_minutes: u64) -> Result<Self, AccessError> {
        if ttl_minutes == 0 || ttl_minutes > MAX_TOKEN_TTL_MINUTES {
            return Err(AccessError::InvalidTtl(ttl_minutes));
        }
        let ttl = i64::try_from(ttl_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .ok_or(AccessError::InvalidTtl(ttl_minutes))?;
        Ok(Self { secret, ttl })
    }

    /// `None` when key tokens are disabled.
    pub fn from_config(config: &LessoncastConfig) -> Result<Option<Self>, AccessError> {
        if !config.security.key_tokens_enabled {
            return Ok(None);
        }
        Self::load_or_create(
            &config.token_secret_path(),
            config.security.token_ttl_minutes,
        )
        .map(Some)
    }

    /// Reads the secret at `path`, generating one on first start.
    pub fn load_or_create(path: &Path, ttl_minutes: u64) -> Result<Self, AccessError> {
        let io = |source| AccessError::Io {
            source,
            path: path.to_path_buf(),
        };
        let secret = match fs::read(path) {
            Ok(secret) => secret,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(io)?;
                }
                let mut secret = vec![0u8; SECRET_LEN];
                OsRng.fill_bytes(&mut secret);
                match OpenOptions::new().write(true).create_new(true).open(path) {
                    Ok(mut file) => {
                        file.write_all(&secret).map_err(io)?;
                        file.sync_all().map_err(io)?;
                        info!(path = %path.display(), "generated key token secret");
                        secret
                    }
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => fs::read(path).map_err(io)?,
                    Err(err) => return Err(io(err)),
                }
            }
            Err(err) => return Err(io(err)),
        };
        if secret.is_empty() {
            return Err(AccessError::EmptySecret(path.to_path_buf()));
        }
        Self::new(secret, ttl_minutes)
    }

    pub fn issue(&self, asset_id: &str) -> Result<KeyToken, AccessError> {
        self.issue_at(asset_id, Utc::now())
    }

    pub fn issue_at(&self, asset_id: &str, now: DateTime<Utc>) -> Result<KeyToken, AccessError> {
        let expires = now
            .checked_add_signed(self.ttl)
            .ok_or(AccessError::ExpiryOutOfRange)?
            .timestamp();
        let signature = self.mac(asset_id, expires)?.finalize().into_bytes();
        Ok(KeyToken {
            expires,
            token: URL_SAFE_NO_PAD.encode(signature),
        })
    }

    pub fn validate(&self, asset_id: &str, token: &KeyToken) -> Result<(), AccessError> {
        self.validate_at(asset_id, token, Utc::now())
    }

    pub fn validate_at(
        &self,
        asset_id: &str,
        token: &KeyToken,
        now: DateTime<Utc>,
    ) -> Result<(), AccessError> {
        if token.expires < now.timestamp() {
            return Err(AccessError::Expired);
        }
        let signature = URL_SAFE_NO_PAD
            .decode(token.token.as_bytes())
            .map_err(|_| AccessError::InvalidSignature)?;
        self.mac(asset_id, token.expires)?
            .verify_slice(&signature)
            .map_err(|_| AccessError::InvalidSignature)
    }

    /// Key route for `asset_id` carrying a freshly issued token.
    pub fn signed_key_url(&self, routes: &MediaRoutes, asset_id: &str) -> Result<String, AccessError> {
        let token = self.issue(asset_id)?;
        Ok(format!("{}?{}", routes.key_url(asset_id), token.query()))
    }

    fn mac(&self, asset_id: &str, expires: i64) -> Result<HmacSha256, AccessError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| AccessError::Hmac)?;
        mac.update(asset_id.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn access() -> KeyAccess {
        KeyAccess::new(b"0123456789abcdef".to_vec(), 60).unwrap()
    }

    #[test]
    fn issued_tokens_validate_for_their_asset_only() {
        let access = access();
        let token = access.issue("abc").unwrap();
        access.validate("abc", &token).unwrap();
        assert!(matches!(
            access.validate("abd", &token),
            Err(AccessError::InvalidSignature)
        ));

        let mut forged = token.clone();
        forged.expires += 3600;
        assert!(matches!(
            access.validate("abc", &forged),
            Err(AccessError::InvalidSignature)
        ));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let access = access();
        let issued_at = Utc::now() - chrono::Duration::hours(2);
        let token = access.issue_at("abc", issued_at).unwrap();
        assert!(matches!(
            access.validate("abc", &token),
            Err(AccessError::Expired)
        ));
    }

    #[test]
    fn secret_is_created_once_and_reused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys/token.secret");
        let first = KeyAccess::load_or_create(&path, 60).unwrap();
        let second = KeyAccess::load_or_create(&path, 60).unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), SECRET_LEN);
        let token = first.issue("abc").unwrap();
        second.validate("abc", &token).unwrap();
    }

    #[test]
    fn signed_url_targets_the_key_route() {
        let url = access()
            .signed_key_url(&MediaRoutes::default(), "abc")
            .unwrap();
        assert!(url.starts_with("/media/key/abc?expires="));
        assert!(url.contains("&token="));
    }

    #[test]
    fn out_of_range_ttls_are_rejected() {
        for ttl in [0, MAX_TOKEN_TTL_MINUTES + 1, 1_000_000_000_000, u64::MAX] {
            assert!(matches!(
                KeyAccess::new(b"s".to_vec(), ttl),
                Err(AccessError::InvalidTtl(value)) if value == ttl
            ));
        }
        let longest = KeyAccess::new(b"s".to_vec(), MAX_TOKEN_TTL_MINUTES).unwrap();
        let now = Utc::now();
        let token = longest.issue_at("abc", now).unwrap();
        assert_eq!(token.expires, now.timestamp() + 7 * 24 * 3600);
    }

    #[test]
    fn expiry_past_the_calendar_is_an_error() {
        let access = access();
        assert!(matches!(
            access.issue_at("abc", DateTime::<Utc>::MAX_UTC),
            Err(AccessError::ExpiryOutOfRange)
        ));
    }
}
