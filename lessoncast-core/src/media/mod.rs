//! Encrypted HLS distribution for lesson videos.
//!
//! Conversion runs key provisioning, segment encoding and the manifest key
//! rewrite in that order, then publishes the manifest. The streaming side
//! only ever reads published files.

pub mod access;
pub mod asset;
pub mod coordinator;
pub mod encoder;
pub mod error;
pub mod keys;
pub mod layout;
pub mod manifest;
pub mod streaming;

pub use access::{AccessError, KeyAccess, KeyToken};
pub use asset::{generate_asset_id, VideoAsset};
pub use coordinator::{ConversionCoordinator, ConversionError, ConversionOutcome, LessonConverter};
pub use encoder::{CommandExecutor, EncodeOutcome, EncoderSettings, SegmentEncoder, SystemCommandExecutor};
pub use error::{MediaError, MediaResult};
pub use keys::{KeyManager, KeyRef, KEY_LEN};
pub use layout::{MediaLayout, MediaRoutes, MANIFEST_NAME, SEGMENT_PATTERN};
pub use manifest::{HlsPlaylist, HlsSegment, ManifestRewriter, RewriteOutcome};
pub use streaming::{KeyFetch, MediaLibrary, MediaPayload};
