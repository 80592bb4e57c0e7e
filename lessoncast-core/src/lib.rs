pub mod config;
pub mod error;
pub mod lesson;
pub mod media;
pub mod sqlite;
pub mod sweep;

pub use config::{load_lessoncast_config, LessoncastConfig};
pub use error::{ConfigError, Result};
pub use lesson::{
    Lesson, LessonError, LessonResult, LessonVideoReference, RenditionState, SqliteLessonStore,
    SqliteLessonStoreBuilder,
};
pub use media::{
    ConversionCoordinator, ConversionError, ConversionOutcome, KeyAccess, LessonConverter,
    MediaError, MediaLayout, MediaLibrary, MediaResult, MediaRoutes,
};
pub use sweep::{MigrationSweep, SweepReport};
