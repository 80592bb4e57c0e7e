use std::ffi::OsString;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::EncoderSection;

use super::error::{MediaError, MediaResult};
use super::keys::KeyRef;
use super::layout::{MediaLayout, SEGMENT_PATTERN};

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub ffmpeg: PathBuf,
    pub video_codec: String,
    pub audio_codec: String,
    pub segment_seconds: u32,
    pub timeout: Duration,
    pub log_level: String,
}

impl From<&EncoderSection> for EncoderSettings {
    fn from(section: &EncoderSection) -> Self {
        Self {
            ffmpeg: PathBuf::from(&section.ffmpeg_path),
            video_codec: section.video_codec.clone(),
            audio_codec: section.audio_codec.clone(),
            segment_seconds: section.segment_seconds,
            timeout: Duration::from_secs(section.timeout_seconds),
            log_level: section.log_level.clone(),
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self::from(&EncoderSection::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOutcome {
    /// The published manifest when `fresh` is false, otherwise the staging
    /// manifest that still needs its key URI rewritten before publishing.
    pub manifest_path: PathBuf,
    pub fresh: bool,
}

/// Turns a raw upload into AES-128 encrypted HLS segments with ffmpeg.
#[derive(Clone)]
pub struct SegmentEncoder {
    layout: MediaLayout,
    settings: EncoderSettings,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for SegmentEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentEncoder")
            .field("layout", &self.layout)
            .field("settings", &self.settings)
            .finish()
    }
}

impl SegmentEncoder {
    pub fn new(
        layout: MediaLayout,
        settings: EncoderSettings,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            layout,
            settings,
            executor,
        }
    }

    /// Encodes `source` for `key.asset_id`. Skipped entirely when the asset
    /// already has a published manifest.
    pub async fn encode(&self, source: &Path, key: &KeyRef) -> MediaResult<EncodeOutcome> {
        let asset_id = key.asset_id.as_str();
        let published = self.layout.manifest_path(asset_id)?;
        if fs::metadata(&published).await.is_ok() {
            debug!(asset_id, "manifest already published, skipping encode");
            return Ok(EncodeOutcome {
                manifest_path: published,
                fresh: false,
            });
        }
        match fs::metadata(source).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(MediaError::SourceUnreadable {
                    path: source.to_path_buf(),
                })
            }
        }

        let asset_dir = self.layout.asset_dir(asset_id)?;
        fs::create_dir_all(&asset_dir)
            .await
            .map_err(MediaError::io(&asset_dir))?;
        let staging = self.layout.staging_manifest_path(asset_id)?;
        remove_if_present(&staging).await?;
        remove_if_present(&self.layout.rewrite_marker_path(asset_id)?).await?;

        let args = self.build_args(source, key, &asset_dir, &staging);
        let mut command = Command::new(&self.settings.ffmpeg);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(asset_id, source = %source.display(), "encoding asset to encrypted HLS");
        let started = std::time::Instant::now();
        let output = match timeout(self.settings.timeout, self.executor.run(&mut command)).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(MediaError::Spawn {
                    program: self.settings.ffmpeg.display().to_string(),
                    source,
                })
            }
            Err(_) => {
                warn!(asset_id, timeout = ?self.settings.timeout, "encoder overran its deadline");
                return Err(MediaError::Timeout {
                    seconds: self.settings.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(MediaError::EncodingFailed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if fs::metadata(&staging).await.is_err() {
            return Err(MediaError::EncodingFailed {
                status: output.status.code(),
                stderr: format!(
                    "encoder exited cleanly but produced no manifest at {}",
                    staging.display()
                ),
            });
        }
        info!(asset_id, elapsed = ?started.elapsed(), "encode finished");
        Ok(EncodeOutcome {
            manifest_path: staging,
            fresh: true,
        })
    }

    /// Moves a rewritten staging manifest into its published location.
    pub async fn publish(&self, asset_id: &str) -> MediaResult<PathBuf> {
        let staging = self.layout.staging_manifest_path(asset_id)?;
        let published = self.layout.manifest_path(asset_id)?;
        fs::rename(&staging, &published)
            .await
            .map_err(MediaError::io(&published))?;
        Ok(published)
    }

    fn build_args(
        &self,
        source: &Path,
        key: &KeyRef,
        asset_dir: &Path,
        staging: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        for arg in ["-y", "-hide_banner", "-nostdin", "-loglevel"] {
            args.push(arg.into());
        }
        args.push(self.settings.log_level.clone().into());
        args.push("-i".into());
        args.push(source.as_os_str().to_os_string());
        args.push("-c:v".into());
        args.push(self.settings.video_codec.clone().into());
        args.push("-c:a".into());
        args.push(self.settings.audio_codec.clone().into());
        args.push("-f".into());
        args.push("hls".into());
        args.push("-hls_time".into());
        args.push(self.settings.segment_seconds.to_string().into());
        args.push("-hls_key_info_file".into());
        args.push(key.key_info_path.as_os_str().to_os_string());
        args.push("-hls_playlist_type".into());
        args.push("vod".into());
        args.push("-hls_segment_filename".into());
        args.push(asset_dir.join(SEGMENT_PATTERN).into_os_string());
        args.push(staging.as_os_str().to_os_string());
        args
    }
}

async fn remove_if_present(path: &Path) -> MediaResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(MediaError::Io {
            source,
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    use crate::media::keys::KeyManager;

    struct StubExecutor {
        calls: AtomicUsize,
        status: i32,
        write_manifest: bool,
        delay: Duration,
    }

    impl StubExecutor {
        fn new(status: i32, write_manifest: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                status,
                write_manifest,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait::async_trait]
    impl CommandExecutor for StubExecutor {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let args: Vec<OsString> = command
                .as_std()
                .get_args()
                .map(|arg| arg.to_os_string())
                .collect();
            if self.write_manifest {
                let output = PathBuf::from(args.last().unwrap());
                std::fs::write(output, "#EXTM3U\n#EXT-X-ENDLIST\n")?;
            }
            Ok(Output {
                status: ExitStatus::from_raw(self.status << 8),
                stdout: Vec::new(),
                stderr: b"Invalid data found when processing input\n".to_vec(),
            })
        }
    }

    async fn setup(executor: Arc<StubExecutor>) -> (tempfile::TempDir, SegmentEncoder, KeyRef, PathBuf) {
        let dir = tempdir().unwrap();
        let layout = MediaLayout::new(dir.path());
        layout.ensure_directories().await.unwrap();
        let source = layout.upload_path("video.mp4").unwrap();
        std::fs::write(&source, b"raw").unwrap();
        let key = KeyManager::new(layout.clone()).ensure_key("abc").await.unwrap();
        let encoder = SegmentEncoder::new(layout, EncoderSettings::default(), Some(executor));
        (dir, encoder, key, source)
    }

    #[tokio::test]
    async fn command_line_requests_encrypted_vod_hls() {
        let executor = Arc::new(StubExecutor::new(0, true));
        let (_dir, encoder, key, source) = setup(executor.clone()).await;
        let outcome = encoder.encode(&source, &key).await.unwrap();
        assert!(outcome.fresh);
        assert!(outcome.manifest_path.ends_with("hls/abc/index.m3u8.part"));

        let asset_dir = outcome.manifest_path.parent().unwrap().to_path_buf();
        let args = encoder.build_args(&source, &key, &asset_dir, &outcome.manifest_path);
        let joined: Vec<String> = args
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        let position = |flag: &str| joined.iter().position(|arg| arg == flag).unwrap();
        assert_eq!(joined[position("-hls_time") + 1], "10");
        assert_eq!(joined[position("-c:v") + 1], "libx264");
        assert_eq!(joined[position("-c:a") + 1], "aac");
        assert_eq!(joined[position("-hls_playlist_type") + 1], "vod");
        assert!(joined[position("-hls_key_info_file") + 1].ends_with("keys/abc.keyinfo"));
        assert!(joined[position("-hls_segment_filename") + 1].ends_with("hls/abc/segment_%03d.ts"));
    }

    #[tokio::test]
    async fn published_manifest_skips_encoding() {
        let executor = Arc::new(StubExecutor::new(0, true));
        let (_dir, encoder, key, source) = setup(executor.clone()).await;
        encoder.encode(&source, &key).await.unwrap();
        encoder.publish("abc").await.unwrap();

        let again = encoder.encode(&source, &key).await.unwrap();
        assert!(!again.fresh);
        assert!(again.manifest_path.ends_with("hls/abc/index.m3u8"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_zero_exit_carries_diagnostics() {
        let executor = Arc::new(StubExecutor::new(1, false));
        let (_dir, encoder, key, source) = setup(executor).await;
        match encoder.encode(&source, &key).await {
            Err(MediaError::EncodingFailed { status, stderr }) => {
                assert_eq!(status, Some(1));
                assert!(stderr.contains("Invalid data"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_exit_without_manifest_is_a_failure() {
        let executor = Arc::new(StubExecutor::new(0, false));
        let (_dir, encoder, key, source) = setup(executor).await;
        let err = encoder.encode(&source, &key).await.unwrap_err();
        assert!(matches!(err, MediaError::EncodingFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_encoder_times_out() {
        let mut stub = StubExecutor::new(0, true);
        stub.delay = Duration::from_secs(30);
        let (_dir, mut encoder, key, source) = setup(Arc::new(stub)).await;
        encoder.settings.timeout = Duration::from_secs(5);
        let err = encoder.encode(&source, &key).await.unwrap_err();
        assert!(matches!(err, MediaError::Timeout { seconds: 5 }));
        assert!(err.is_encoding_failure());
    }

    #[tokio::test]
    async fn missing_source_is_reported_before_spawning() {
        let executor = Arc::new(StubExecutor::new(0, true));
        let (_dir, encoder, key, source) = setup(executor.clone()).await;
        std::fs::remove_file(&source).unwrap();
        let err = encoder.encode(&source, &key).await.unwrap_err();
        assert!(matches!(err, MediaError::SourceUnreadable { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }
}
