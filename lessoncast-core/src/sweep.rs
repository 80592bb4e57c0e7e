use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::lesson::{LessonResult, SqliteLessonStore};
use crate::media::{ConversionCoordinator, LessonConverter, MediaLayout, MediaRoutes};

/// Tally of one pass over the lesson records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub converted: usize,
    pub fallback: usize,
    pub skipped_missing_source: usize,
    pub failed: usize,
}

/// Converts lessons still pointing at raw uploads, one at a time.
#[derive(Clone)]
pub struct MigrationSweep {
    store: SqliteLessonStore,
    layout: MediaLayout,
    routes: MediaRoutes,
    converter: Arc<dyn LessonConverter>,
}

impl MigrationSweep {
    pub fn new(
        store: SqliteLessonStore,
        layout: MediaLayout,
        routes: MediaRoutes,
        converter: Arc<dyn LessonConverter>,
    ) -> Self {
        Self {
            store,
            layout,
            routes,
            converter,
        }
    }

    /// Sweeps through `coordinator` itself, so the sweep and every other
    /// caller of that coordinator share one in-flight registry.
    pub fn for_coordinator(coordinator: &ConversionCoordinator) -> Self {
        Self::new(
            coordinator.store().clone(),
            coordinator.layout().clone(),
            coordinator.routes().clone(),
            Arc::new(coordinator.clone()),
        )
    }

    /// A failing lesson is logged and counted; it never stops the pass.
    pub async fn run_once(&self) -> LessonResult<SweepReport> {
        let pending = self
            .store
            .list_pending_migration(self.routes.media_prefix())?;
        let mut report = SweepReport::default();
        tracing::info!(target: "migration_sweep", pending = pending.len(), "starting sweep");

        for lesson in pending {
            report.examined += 1;
            let source = lesson
                .source_file_name()
                .and_then(|name| self.layout.upload_path(&name).ok())
                .filter(|path| path.is_file());
            if source.is_none() {
                tracing::debug!(
                    target: "migration_sweep",
                    lesson_id = %lesson.lesson_id,
                    video_url = %lesson.video_url,
                    "source video missing, skipping"
                );
                report.skipped_missing_source += 1;
                continue;
            }

            match self.converter.convert(&lesson).await {
                Ok(outcome) if outcome.encrypted => report.converted += 1,
                Ok(_) => report.fallback += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        target: "migration_sweep",
                        lesson_id = %lesson.lesson_id,
                        error = %err,
                        "lesson conversion failed"
                    );
                }
            }
        }

        tracing::info!(
            target: "migration_sweep",
            examined = report.examined,
            converted = report.converted,
            fallback = report.fallback,
            skipped = report.skipped_missing_source,
            failed = report.failed,
            "sweep finished"
        );
        Ok(report)
    }

    /// Runs the sweep after `delay`, then every `every` when given.
    pub fn spawn(self, delay: Duration, every: Option<Duration>) -> JoinHandle<()> {
        tokio::spawn(async move {
            sleep(delay).await;
            self.run_logged().await;
            let Some(every) = every.filter(|every| !every.is_zero()) else {
                return;
            };
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_logged().await;
            }
        })
    }

    async fn run_logged(&self) {
        if let Err(err) = self.run_once().await {
            tracing::error!(target: "migration_sweep", error = %err, "sweep aborted");
        }
    }
}
