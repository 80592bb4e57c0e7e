use std::io::ErrorKind;
use std::path::Path;

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{MediaError, MediaResult};
use super::layout::{MediaRoutes, REWRITE_MARKER_NAME};

/// Parsed view of a media playlist, enough to answer which segments and
/// keys it references.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsPlaylist {
    pub version: u32,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub segments: Vec<HlsSegment>,
    pub key_uris: Vec<String>,
    pub ended: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HlsSegment {
    pub duration: f64,
    pub uri: String,
}

impl HlsPlaylist {
    pub fn parse(contents: &str) -> Result<Self, String> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err("missing #EXTM3U header".into());
        }
        let mut version = 3u32;
        let mut target_duration = 10.0f64;
        let mut media_sequence = 0u64;
        let mut segments = Vec::new();
        let mut key_uris = Vec::new();
        let mut ended = false;
        let mut pending_duration: Option<f64> = None;
        for line in contents.lines().map(str::trim) {
            if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
                version = value.parse().map_err(|_| "invalid EXT-X-VERSION")?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                target_duration = value
                    .parse()
                    .map_err(|_| "invalid EXT-X-TARGETDURATION")?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                media_sequence = value
                    .parse()
                    .map_err(|_| "invalid EXT-X-MEDIA-SEQUENCE")?;
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value
                    .split(',')
                    .next()
                    .unwrap_or_default()
                    .parse()
                    .map_err(|_| "invalid EXTINF duration")?;
                pending_duration = Some(duration);
            } else if line.starts_with("#EXT-X-KEY:") {
                if let Some(uri) = key_uri_span(line).map(|(start, end)| &line[start..end]) {
                    key_uris.push(uri.to_string());
                }
            } else if line == "#EXT-X-ENDLIST" {
                ended = true;
            } else if line.starts_with('#') || line.is_empty() {
                continue;
            } else if let Some(duration) = pending_duration.take() {
                segments.push(HlsSegment {
                    duration,
                    uri: line.to_string(),
                });
            }
        }
        Ok(Self {
            version,
            target_duration,
            media_sequence,
            segments,
            key_uris,
            ended,
        })
    }

    /// True when `name` is one of the playlist's segment entries, compared by
    /// final path component.
    pub fn references_segment(&self, name: &str) -> bool {
        self.segments
            .iter()
            .any(|segment| segment.uri.rsplit('/').next() == Some(name))
    }
}

/// Byte range of the quoted `URI` attribute value on a key line.
fn key_uri_span(line: &str) -> Option<(usize, usize)> {
    let start = line.find("URI=\"")? + "URI=\"".len();
    let len = line[start..].find('"')?;
    Some((start, start + len))
}

/// Replaces the URI of every `#EXT-X-KEY` line with `replace(current)`,
/// leaving all other lines untouched.
pub fn map_key_uris(contents: &str, replace: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(contents.len() + 64);
    for line in contents.split_inclusive('\n') {
        match key_uri_span(line).filter(|_| line.starts_with("#EXT-X-KEY:")) {
            Some((start, end)) => {
                out.push_str(&line[..start]);
                out.push_str(&replace(&line[start..end]));
                out.push_str(&line[end..]);
            }
            None => out.push_str(line),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    Rewritten,
    AlreadyRewritten,
}

/// Points the encoder's bare key filename at the service's key route.
#[derive(Debug, Clone, Default)]
pub struct ManifestRewriter {
    routes: MediaRoutes,
}

impl ManifestRewriter {
    pub fn new(routes: MediaRoutes) -> Self {
        Self { routes }
    }

    /// Guarded by a marker file next to the manifest; once it exists the
    /// manifest is left alone.
    pub async fn rewrite_key_uri(
        &self,
        manifest_path: &Path,
        asset_id: &str,
    ) -> MediaResult<RewriteOutcome> {
        let marker = manifest_path
            .parent()
            .map(|dir| dir.join(REWRITE_MARKER_NAME))
            .ok_or_else(|| MediaError::KeyReferenceMissing {
                path: manifest_path.to_path_buf(),
                asset_id: asset_id.to_string(),
            })?;
        if fs::metadata(&marker).await.is_ok() {
            debug!(asset_id, "key uri already rewritten");
            return Ok(RewriteOutcome::AlreadyRewritten);
        }

        let contents = match fs::read_to_string(manifest_path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(MediaError::KeyReferenceMissing {
                    path: manifest_path.to_path_buf(),
                    asset_id: asset_id.to_string(),
                })
            }
            Err(source) => {
                return Err(MediaError::Io {
                    source,
                    path: manifest_path.to_path_buf(),
                })
            }
        };

        let bare = format!("{asset_id}.key");
        let routed = self.routes.key_url(asset_id);
        let playlist = HlsPlaylist::parse(&contents).map_err(|_| MediaError::KeyReferenceMissing {
            path: manifest_path.to_path_buf(),
            asset_id: asset_id.to_string(),
        })?;

        let outcome = if playlist.key_uris.iter().any(|uri| uri == &bare) {
            let rewritten = map_key_uris(&contents, |uri| {
                if uri == bare {
                    routed.clone()
                } else {
                    uri.to_string()
                }
            });
            let temp = manifest_path.with_extension(format!("rewrite.{}.tmp", Uuid::new_v4().simple()));
            fs::write(&temp, rewritten.as_bytes())
                .await
                .map_err(MediaError::io(&temp))?;
            fs::rename(&temp, manifest_path)
                .await
                .map_err(MediaError::io(manifest_path))?;
            info!(asset_id, key_uri = %routed, "rewrote manifest key uri");
            RewriteOutcome::Rewritten
        } else if !playlist.key_uris.is_empty() && playlist.key_uris.iter().all(|uri| uri == &routed) {
            RewriteOutcome::AlreadyRewritten
        } else {
            return Err(MediaError::KeyReferenceMissing {
                path: manifest_path.to_path_buf(),
                asset_id: asset_id.to_string(),
            });
        };

        fs::write(&marker, b"")
            .await
            .map_err(MediaError::io(&marker))?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ENCODED: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-PLAYLIST-TYPE:VOD\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"abc.key\",IV=0x00000000000000000000000000000000\n\
#EXTINF:10.000000,\n\
segment_000.ts\n\
#EXTINF:4.200000,\n\
segment_001.ts\n\
#EXT-X-ENDLIST\n";

    #[test]
    fn parses_segments_and_keys() {
        let playlist = HlsPlaylist::parse(ENCODED).unwrap();
        assert_eq!(playlist.segments.len(), 2);
        assert_eq!(playlist.segments[1].uri, "segment_001.ts");
        assert!((playlist.segments[1].duration - 4.2).abs() < f64::EPSILON);
        assert_eq!(playlist.key_uris, vec!["abc.key".to_string()]);
        assert!(playlist.ended);
        assert!(playlist.references_segment("segment_000.ts"));
        assert!(!playlist.references_segment("segment_002.ts"));
        assert!(HlsPlaylist::parse("segment_000.ts\n").is_err());
    }

    #[tokio::test]
    async fn rewrites_bare_key_reference_once() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("index.m3u8.part");
        std::fs::write(&manifest, ENCODED).unwrap();
        let rewriter = ManifestRewriter::new(MediaRoutes::default());

        let first = rewriter.rewrite_key_uri(&manifest, "abc").await.unwrap();
        assert_eq!(first, RewriteOutcome::Rewritten);
        let contents = std::fs::read_to_string(&manifest).unwrap();
        assert!(contents.contains("URI=\"/media/key/abc\""));
        assert!(!contents.contains("URI=\"abc.key\""));
        assert_eq!(contents.matches("URI=").count(), 1);
        assert!(contents.contains("IV=0x00000000000000000000000000000000"));

        let second = rewriter.rewrite_key_uri(&manifest, "abc").await.unwrap();
        assert_eq!(second, RewriteOutcome::AlreadyRewritten);
        assert_eq!(std::fs::read_to_string(&manifest).unwrap(), contents);
    }

    #[tokio::test]
    async fn manifest_without_key_reference_is_rejected() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("index.m3u8.part");
        std::fs::write(&manifest, "#EXTM3U\n#EXTINF:10.0,\nsegment_000.ts\n").unwrap();
        let rewriter = ManifestRewriter::default();
        let err = rewriter.rewrite_key_uri(&manifest, "abc").await.unwrap_err();
        assert!(matches!(err, MediaError::KeyReferenceMissing { .. }));
        assert!(!dir.path().join(REWRITE_MARKER_NAME).exists());
    }

    #[test]
    fn key_uris_can_be_mapped_without_touching_segments() {
        let signed = map_key_uris(ENCODED, |uri| format!("{uri}?token=t"));
        assert!(signed.contains("URI=\"abc.key?token=t\""));
        assert!(signed.contains("segment_000.ts\n"));
        assert_eq!(signed.len(), ENCODED.len() + "?token=t".len());
    }
}
