use std::sync::Arc;

use thiserror::Error;

use lessoncast_core::media::{AccessError, CommandExecutor};
use lessoncast_core::{
    ConversionCoordinator, KeyAccess, LessonError, LessoncastConfig, MediaError, MediaLayout,
    MediaLibrary, MediaRoutes, MigrationSweep, SqliteLessonStore,
};

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Lesson(#[from] LessonError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Shared application state available to all handlers via `State<AppState>`.
///
/// Cheap to clone; everything inside is either `Arc`-backed or a handful of
/// paths.
#[derive(Clone, Debug)]
pub struct AppState {
    pub coordinator: ConversionCoordinator,
    pub library: MediaLibrary,
}

impl AppState {
    pub fn new(coordinator: ConversionCoordinator, library: MediaLibrary) -> Self {
        Self {
            coordinator,
            library,
        }
    }

    /// Prepares the data root and lesson database described by `config`.
    pub async fn from_config(
        config: &LessoncastConfig,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Result<Self, StateError> {
        let layout = MediaLayout::from_config(config);
        layout.ensure_directories().await?;
        let store = SqliteLessonStore::new(config.database_path())?;
        store.initialize()?;
        let access = KeyAccess::from_config(config)?.map(Arc::new);
        let library = MediaLibrary::new(layout, MediaRoutes::from_config(config), access);
        let coordinator = ConversionCoordinator::from_config(config, store, executor);
        Ok(Self::new(coordinator, library))
    }

    /// Background sweep driving the handlers' own coordinator.
    pub fn migration_sweep(&self) -> MigrationSweep {
        MigrationSweep::for_coordinator(&self.coordinator)
    }

    pub fn routes(&self) -> &MediaRoutes {
        self.coordinator.routes()
    }

    pub fn layout(&self) -> &MediaLayout {
        self.coordinator.layout()
    }
}
