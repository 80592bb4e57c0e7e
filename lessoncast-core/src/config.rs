use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::media::access::MAX_TOKEN_TTL_MINUTES;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LessoncastConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    #[serde(default)]
    pub encoder: EncoderSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sweep: SweepSection,
    #[serde(default)]
    pub security: SecuritySection,
}

impl LessoncastConfig {
    /// Resolves `candidate` against the data root unless it is already absolute.
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.data_dir).join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.database)
    }

    pub fn token_secret_path(&self) -> PathBuf {
        self.resolve_path(&self.security.token_secret_path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.encoder.segment_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "encoder.segment_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.encoder.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "encoder.timeout_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if !self.server.media_prefix.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "server.media_prefix",
                reason: format!("{} is not an absolute route", self.server.media_prefix),
            });
        }
        let ttl = self.security.token_ttl_minutes;
        if self.security.key_tokens_enabled && (ttl == 0 || ttl > MAX_TOKEN_TTL_MINUTES) {
            return Err(ConfigError::Invalid {
                field: "security.token_ttl_minutes",
                reason: format!(
                    "{ttl} is outside 1..={MAX_TOKEN_TTL_MINUTES} when key tokens are enabled"
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub data_dir: String,
    #[serde(default = "default_database")]
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    pub ffmpeg_path: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub segment_seconds: u32,
    pub timeout_seconds: u64,
    pub log_level: String,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".into(),
            video_codec: "libx264".into(),
            audio_codec: "aac".into(),
            segment_seconds: 10,
            timeout_seconds: 3600,
            log_level: "error".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub bind_address: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    pub media_prefix: String,
    pub uploads_prefix: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:5000".into(),
            allowed_origins: Vec::new(),
            media_prefix: "/media".into(),
            uploads_prefix: "/uploads".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepSection {
    pub enabled: bool,
    pub delay_seconds: u64,
    pub interval_seconds: Option<u64>,
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_seconds: 2,
            interval_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecuritySection {
    pub key_tokens_enabled: bool,
    pub token_secret_path: String,
    pub token_ttl_minutes: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            key_tokens_enabled: false,
            token_secret_path: "keys/token.secret".into(),
            token_ttl_minutes: 60,
        }
    }
}

fn default_database() -> String {
    "lessons.sqlite".into()
}

pub fn load_lessoncast_config<P: AsRef<Path>>(path: P) -> Result<LessoncastConfig> {
    let config: LessoncastConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
