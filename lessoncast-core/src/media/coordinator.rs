use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LessoncastConfig;
use crate::lesson::{Lesson, LessonError, LessonVideoReference, RenditionState, SqliteLessonStore};

use super::asset::{generate_asset_id, VideoAsset};
use super::encoder::{CommandExecutor, EncoderSettings, SegmentEncoder};
use super::error::MediaError;
use super::keys::KeyManager;
use super::layout::{validate_asset_id, MediaLayout, MediaRoutes};
use super::manifest::ManifestRewriter;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("source video for lesson {lesson_id} not found at {path}")]
    SourceMissing { lesson_id: String, path: PathBuf },
    #[error("lesson {lesson_id} not found")]
    LessonNotFound { lesson_id: String },
    #[error(transparent)]
    Store(#[from] LessonError),
    #[error(transparent)]
    Media(Arc<MediaError>),
}

impl From<MediaError> for ConversionError {
    fn from(err: MediaError) -> Self {
        ConversionError::Media(Arc::new(err))
    }
}

/// What a conversion request produced for one lesson.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutcome {
    pub lesson_id: String,
    pub reference: LessonVideoReference,
    pub state: RenditionState,
    /// False when the lesson fell back to its raw upload.
    pub encrypted: bool,
    /// True when this request ran the encoder rather than finding a rendition.
    pub encoded: bool,
    pub failure: Option<String>,
}

/// Anything that can bring a lesson's video up to date. The sweep drives
/// conversions through this seam.
#[async_trait::async_trait]
pub trait LessonConverter: Send + Sync {
    async fn convert(&self, lesson: &Lesson) -> Result<ConversionOutcome, ConversionError>;
}

#[derive(Debug, Clone)]
struct Rendered {
    manifest_path: PathBuf,
    fresh: bool,
}

type InFlight = Shared<BoxFuture<'static, Result<Rendered, Arc<MediaError>>>>;

struct Pipeline {
    keys: KeyManager,
    encoder: SegmentEncoder,
    rewriter: ManifestRewriter,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl Pipeline {
    async fn render(&self, asset_id: &str, source: &Path) -> Result<Rendered, MediaError> {
        let key = self.keys.ensure_key(asset_id).await?;
        let encoded = self.encoder.encode(source, &key).await?;
        if !encoded.fresh {
            return Ok(Rendered {
                manifest_path: encoded.manifest_path,
                fresh: false,
            });
        }
        self.rewriter
            .rewrite_key_uri(&encoded.manifest_path, asset_id)
            .await?;
        let manifest_path = self.encoder.publish(asset_id).await?;
        Ok(Rendered {
            manifest_path,
            fresh: true,
        })
    }
}

/// Decides whether a lesson needs a rendition and drives the pipeline when it
/// does. At most one encode runs per asset id; concurrent callers for the same
/// asset share its result.
#[derive(Clone)]
pub struct ConversionCoordinator {
    store: SqliteLessonStore,
    layout: MediaLayout,
    routes: MediaRoutes,
    pipeline: Arc<Pipeline>,
}

impl std::fmt::Debug for ConversionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionCoordinator")
            .field("store", &self.store)
            .field("layout", &self.layout)
            .field("routes", &self.routes)
            .finish()
    }
}

impl ConversionCoordinator {
    pub fn new(
        store: SqliteLessonStore,
        layout: MediaLayout,
        routes: MediaRoutes,
        settings: EncoderSettings,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Self {
        let pipeline = Pipeline {
            keys: KeyManager::new(layout.clone()),
            encoder: SegmentEncoder::new(layout.clone(), settings, executor),
            rewriter: ManifestRewriter::new(routes.clone()),
            in_flight: Mutex::new(HashMap::new()),
        };
        Self {
            store,
            layout,
            routes,
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn from_config(
        config: &LessoncastConfig,
        store: SqliteLessonStore,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Self {
        Self::new(
            store,
            MediaLayout::from_config(config),
            MediaRoutes::from_config(config),
            EncoderSettings::from(&config.encoder),
            executor,
        )
    }

    pub fn store(&self) -> &SqliteLessonStore {
        &self.store
    }

    pub fn layout(&self) -> &MediaLayout {
        &self.layout
    }

    pub fn routes(&self) -> &MediaRoutes {
        &self.routes
    }

    /// Stores a new lesson and converts its upload. Encoder trouble never
    /// fails the creation; the lesson keeps its raw upload URL instead.
    pub async fn ingest_lesson(&self, lesson: Lesson) -> Result<ConversionOutcome, ConversionError> {
        let stored = self.store.insert_lesson(&lesson)?;
        info!(lesson_id = %stored.lesson_id, "lesson created");
        self.convert_if_needed(&stored).await
    }

    pub async fn convert_lesson_by_id(
        &self,
        lesson_id: &str,
    ) -> Result<ConversionOutcome, ConversionError> {
        let lesson = self
            .store
            .fetch_by_id(lesson_id)?
            .ok_or_else(|| ConversionError::LessonNotFound {
                lesson_id: lesson_id.to_string(),
            })?;
        self.convert_if_needed(&lesson).await
    }

    pub async fn convert_if_needed(
        &self,
        lesson: &Lesson,
    ) -> Result<ConversionOutcome, ConversionError> {
        let lesson_id = lesson.lesson_id.as_str();
        let source_missing = |path: PathBuf| ConversionError::SourceMissing {
            lesson_id: lesson_id.to_string(),
            path,
        };
        let source_file = lesson
            .source_file_name()
            .ok_or_else(|| source_missing(self.layout.uploads_dir()))?;
        if self.layout.upload_path(&source_file).is_err() {
            return Err(source_missing(self.layout.uploads_dir().join(&source_file)));
        }

        let asset_id = self.resolve_asset_id(lesson)?;
        let mut current = lesson.clone();
        current.video_id = Some(asset_id.clone());
        let asset = VideoAsset::for_lesson(&current, &source_file, &self.layout)?;

        if self.layout.is_converted(&asset.asset_id) {
            debug!(lesson_id, asset_id = %asset.asset_id, "rendition already present");
            let reference = self.rendition_reference(&asset.asset_id);
            if lesson.video_reference() != reference
                || lesson.rendition_state != RenditionState::Converted
            {
                self.store
                    .update_video_reference(lesson_id, &reference, RenditionState::Converted)?;
            }
            return Ok(ConversionOutcome {
                lesson_id: lesson_id.to_string(),
                reference,
                state: RenditionState::Converted,
                encrypted: true,
                encoded: false,
                failure: None,
            });
        }

        if !asset.source_path.is_file() {
            warn!(lesson_id, path = %asset.source_path.display(), "source video missing");
            return Err(source_missing(asset.source_path));
        }

        self.store
            .set_rendition_state(lesson_id, RenditionState::Converting)?;
        match self.render(&asset.asset_id, asset.source_path.clone()).await {
            Ok(rendered) => {
                let reference = self.rendition_reference(&asset.asset_id);
                self.store
                    .update_video_reference(lesson_id, &reference, RenditionState::Converted)?;
                info!(
                    lesson_id,
                    asset_id = %asset.asset_id,
                    manifest = %rendered.manifest_path.display(),
                    fresh = rendered.fresh,
                    "lesson video converted"
                );
                Ok(ConversionOutcome {
                    lesson_id: lesson_id.to_string(),
                    reference,
                    state: RenditionState::Converted,
                    encrypted: true,
                    encoded: rendered.fresh,
                    failure: None,
                })
            }
            Err(err) if falls_back(&err) => {
                warn!(
                    lesson_id,
                    asset_id = %asset.asset_id,
                    error = %err,
                    "conversion failed, serving raw upload"
                );
                let reference = LessonVideoReference {
                    video_url: self.routes.upload_url(&source_file),
                    video_id: Some(asset.asset_id.clone()),
                };
                self.store
                    .update_video_reference(lesson_id, &reference, RenditionState::Failed)?;
                Ok(ConversionOutcome {
                    lesson_id: lesson_id.to_string(),
                    reference,
                    state: RenditionState::Failed,
                    encrypted: false,
                    encoded: false,
                    failure: Some(err.to_string()),
                })
            }
            Err(err) => {
                if let Err(store_err) = self
                    .store
                    .set_rendition_state(lesson_id, RenditionState::Failed)
                {
                    warn!(lesson_id, error = %store_err, "could not record failed conversion");
                }
                Err(ConversionError::Media(err))
            }
        }
    }

    fn rendition_reference(&self, asset_id: &str) -> LessonVideoReference {
        LessonVideoReference {
            video_url: self.routes.manifest_url(asset_id),
            video_id: Some(asset_id.to_string()),
        }
    }

    /// The lesson's asset id, assigned once and persisted before any work so
    /// retries and concurrent requests land on the same key and directory.
    fn resolve_asset_id(&self, lesson: &Lesson) -> Result<String, ConversionError> {
        match lesson.video_id.as_deref() {
            Some(existing) if validate_asset_id(existing).is_ok() => Ok(existing.to_string()),
            Some(invalid) => {
                let candidate = generate_asset_id(&lesson.lesson_id);
                warn!(lesson_id = %lesson.lesson_id, invalid, "replacing unusable asset id");
                let assigned = match self
                    .store
                    .replace_video_id(&lesson.lesson_id, invalid, &candidate)?
                {
                    Some(current) => current,
                    None => self.store.assign_video_id(&lesson.lesson_id, &candidate)?,
                };
                validate_asset_id(&assigned)?;
                Ok(assigned)
            }
            None => {
                let candidate = generate_asset_id(&lesson.lesson_id);
                let assigned = self.store.assign_video_id(&lesson.lesson_id, &candidate)?;
                validate_asset_id(&assigned)?;
                Ok(assigned)
            }
        }
    }

    /// Joins the in-flight encode for `asset_id`, starting one if none runs.
    async fn render(&self, asset_id: &str, source: PathBuf) -> Result<Rendered, Arc<MediaError>> {
        let shared = {
            let mut in_flight = self
                .pipeline
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match in_flight.get(asset_id) {
                Some(existing) => {
                    debug!(asset_id, "joining in-flight conversion");
                    existing.clone()
                }
                None => {
                    let pipeline = self.pipeline.clone();
                    let id = asset_id.to_string();
                    // The task's own removal waits on this lock, so it can only
                    // happen after the entry below is inserted.
                    let handle = tokio::spawn(async move {
                        let result = pipeline.render(&id, &source).await.map_err(Arc::new);
                        pipeline
                            .in_flight
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .remove(&id);
                        result
                    });
                    let shared = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(join) => Err(Arc::new(MediaError::Interrupted(join.to_string()))),
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(asset_id.to_string(), shared.clone());
                    shared
                }
            }
        };
        shared.await
    }
}

#[async_trait::async_trait]
impl LessonConverter for ConversionCoordinator {
    async fn convert(&self, lesson: &Lesson) -> Result<ConversionOutcome, ConversionError> {
        self.convert_if_needed(lesson).await
    }
}

/// Transcoder and key faults degrade to the raw upload; anything else is a
/// fault of this service and propagates.
fn falls_back(err: &MediaError) -> bool {
    err.is_encoding_failure()
        || matches!(
            err,
            MediaError::KeyIo { .. }
                | MediaError::KeyReferenceMissing { .. }
                | MediaError::SourceUnreadable { .. }
                | MediaError::Interrupted(_)
        )
}
