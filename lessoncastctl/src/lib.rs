use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use lessoncast_core::media::AccessError;
use lessoncast_core::{
    load_lessoncast_config, ConversionCoordinator, ConversionError, ConversionOutcome, KeyAccess,
    Lesson, LessonError, LessoncastConfig, MediaError, MediaLayout, MediaRoutes, MigrationSweep,
    RenditionState, SqliteLessonStore, SweepReport,
};
use lessoncast_server::{create_router, AppState, StateError};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] lessoncast_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lesson store error: {0}")]
    Lesson(#[from] LessonError),
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("key token error: {0}")]
    Access(#[from] AccessError),
    #[error("startup error: {0}")]
    State(#[from] StateError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "lessoncast command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to lessoncast.toml
    #[arg(long, default_value = "configs/lessoncast.toml")]
    pub config: PathBuf,
    /// Data root override (replaces paths.data_dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Lesson database override (replaces paths.database)
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the HTTP service and the migration sweep
    Serve(ServeArgs),
    /// Lesson records
    #[command(subcommand)]
    Lesson(LessonCommands),
    /// Converts one lesson's video if it has no rendition yet
    Convert(ConvertArgs),
    /// Runs the migration sweep once in the foreground
    Sweep,
    /// Shows node info and lesson counts by rendition state
    Status,
    /// Issues a signed key URL for an asset
    KeyToken(KeyTokenArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Bind address override (replaces server.bind_address)
    #[arg(long)]
    pub bind: Option<String>,
    /// Skips the background migration sweep
    #[arg(long, default_value_t = false)]
    pub no_sweep: bool,
}

#[derive(Subcommand, Debug)]
pub enum LessonCommands {
    /// Registers a lesson from a local video file and converts it
    Add(LessonAddArgs),
    /// Lists lessons, newest first
    List(LessonListArgs),
}

#[derive(Args, Debug)]
pub struct LessonAddArgs {
    #[arg(long)]
    pub title: String,
    #[arg(long)]
    pub subject: String,
    #[arg(long)]
    pub teacher: String,
    #[arg(long, default_value = "")]
    pub description: String,
    /// Raw video to copy into the uploads directory
    #[arg(long)]
    pub video: PathBuf,
}

#[derive(Args, Debug)]
pub struct LessonListArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    pub lesson_id: String,
}

#[derive(Args, Debug)]
pub struct KeyTokenArgs {
    pub asset_id: String,
}

pub fn run(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_async(cli))
}

async fn run_async(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Serve(args) => context.serve(args).await?,
        Commands::Lesson(LessonCommands::Add(args)) => {
            let outcome = context.lesson_add(args).await?;
            render(&outcome, cli.format)?;
        }
        Commands::Lesson(LessonCommands::List(args)) => {
            let lessons = context.lesson_list(args)?;
            render(&lessons, cli.format)?;
        }
        Commands::Convert(args) => {
            let outcome = context.coordinator().convert_lesson_by_id(&args.lesson_id).await?;
            render(&outcome, cli.format)?;
        }
        Commands::Sweep => {
            let report = context.sweep().run_once().await?;
            render(&report, cli.format)?;
        }
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::KeyToken(args) => {
            let token = context.key_token(&args.asset_id)?;
            render(&token, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: LessoncastConfig,
    store: SqliteLessonStore,
    layout: MediaLayout,
    routes: MediaRoutes,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_lessoncast_config(&cli.config)?;
        if let Some(data_dir) = &cli.data_dir {
            config.paths.data_dir = data_dir.to_string_lossy().to_string();
        }
        if let Some(database) = &cli.database {
            config.paths.database = database.to_string_lossy().to_string();
        }
        Self::from_config(config)
    }

    fn from_config(config: LessoncastConfig) -> Result<Self> {
        let store = SqliteLessonStore::new(config.database_path())?;
        store.initialize()?;
        Ok(Self {
            layout: MediaLayout::from_config(&config),
            routes: MediaRoutes::from_config(&config),
            store,
            config,
        })
    }

    fn coordinator(&self) -> ConversionCoordinator {
        ConversionCoordinator::from_config(&self.config, self.store.clone(), None)
    }

    fn sweep(&self) -> MigrationSweep {
        MigrationSweep::for_coordinator(&self.coordinator())
    }

    async fn serve(&self, args: &ServeArgs) -> Result<()> {
        let state = AppState::from_config(&self.config, None).await?;

        if self.config.sweep.enabled && !args.no_sweep {
            state.migration_sweep().spawn(
                Duration::from_secs(self.config.sweep.delay_seconds),
                self.config.sweep.interval_seconds.map(Duration::from_secs),
            );
        }
        let router = create_router(state, &self.config.server.allowed_origins);

        let bind = args
            .bind
            .clone()
            .unwrap_or_else(|| self.config.server.bind_address.clone());
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        info!(
            bind = %bind,
            node = %self.config.system.node_name,
            data_dir = %self.layout.root().display(),
            "lessoncast listening"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        info!("lessoncast stopped");
        Ok(())
    }

    async fn lesson_add(&self, args: &LessonAddArgs) -> Result<ConversionOutcome> {
        if !args.video.is_file() {
            return Err(AppError::MissingResource(format!(
                "video file not found at {}",
                args.video.display()
            )));
        }
        self.layout.ensure_directories().await?;
        let file_name = upload_file_name(&args.video);
        let destination = self.layout.upload_path(&file_name)?;
        tokio::fs::copy(&args.video, &destination).await?;

        let mut lesson = Lesson::new(Lesson::generate_id(), &args.subject, &args.teacher, &args.title)
            .with_upload(file_name, self.routes.uploads_prefix());
        lesson.description = args.description.clone();
        Ok(self.coordinator().ingest_lesson(lesson).await?)
    }

    fn lesson_list(&self, args: &LessonListArgs) -> Result<LessonList> {
        Ok(LessonList {
            rows: self.store.list(args.limit)?,
        })
    }

    fn gather_status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            node: NodeStatus {
                node_name: self.config.system.node_name.clone(),
                environment: self.config.system.environment.clone(),
            },
            data_dir: self.layout.root().to_path_buf(),
            database: self.store.path().to_path_buf(),
            key_tokens_enabled: self.config.security.key_tokens_enabled,
            rendition_counts: self.store.count_by_state()?,
        })
    }

    fn key_token(&self, asset_id: &str) -> Result<KeyTokenReport> {
        let access = KeyAccess::from_config(&self.config)?.ok_or_else(|| {
            AppError::MissingResource("key tokens are disabled (security.key_tokens_enabled)".into())
        })?;
        if !self.layout.key_path(asset_id)?.is_file() {
            return Err(AppError::MissingResource(format!("no key for asset {asset_id}")));
        }
        Ok(KeyTokenReport {
            asset_id: asset_id.to_string(),
            url: access.signed_key_url(&self.routes, asset_id)?,
            ttl_minutes: self.config.security.token_ttl_minutes,
        })
    }
}

/// `video-<millis>-<random>.<ext>`, keeping the source extension.
fn upload_file_name(source: &Path) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let stem = format!(
        "video-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    );
    match source.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.chars().all(|c| c.is_ascii_alphanumeric()) => format!("{stem}.{ext}"),
        _ => stem,
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

#[derive(Debug, Serialize)]
pub struct LessonList {
    pub rows: Vec<Lesson>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub node: NodeStatus,
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub key_tokens_enabled: bool,
    pub rendition_counts: HashMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Serialize)]
pub struct KeyTokenReport {
    pub asset_id: String,
    pub url: String,
    pub ttl_minutes: u64,
}

impl DisplayFallback for ConversionOutcome {
    fn display(&self) -> String {
        let mut line = format!(
            "{} | {} | {}",
            self.lesson_id, self.state, self.reference.video_url
        );
        if let Some(asset_id) = &self.reference.video_id {
            line.push_str(&format!(" | asset={asset_id}"));
        }
        if !self.encrypted {
            line.push_str(" | unencrypted fallback");
        }
        if let Some(failure) = &self.failure {
            line.push_str(&format!("\n  reason: {failure}"));
        }
        line
    }
}

impl DisplayFallback for LessonList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No lessons found".to_string();
        }
        let mut lines = Vec::new();
        for lesson in &self.rows {
            lines.push(format!(
                "{} | {} | subject={} | state={} | views={} | {}",
                lesson.lesson_id,
                lesson.title,
                lesson.subject_id,
                lesson.rendition_state,
                lesson.views_count,
                if lesson.video_url.is_empty() {
                    "-"
                } else {
                    lesson.video_url.as_str()
                }
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SweepReport {
    fn display(&self) -> String {
        format!(
            "Examined {} lesson(s): {} converted, {} fell back, {} missing source, {} failed",
            self.examined, self.converted, self.fallback, self.skipped_missing_source, self.failed
        )
    }
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!(
                "Node: {} (env: {})",
                self.node.node_name, self.node.environment
            ),
            format!("Data root: {}", self.data_dir.display()),
            format!("Database: {}", self.database.display()),
            format!(
                "Key tokens: {}",
                if self.key_tokens_enabled { "enabled" } else { "disabled" }
            ),
        ];
        if self.rendition_counts.is_empty() {
            lines.push("Lessons: none".to_string());
        } else {
            lines.push("Lessons:".to_string());
            for state in [
                RenditionState::Unconverted,
                RenditionState::Converting,
                RenditionState::Converted,
                RenditionState::Failed,
            ] {
                if let Some(count) = self.rendition_counts.get(state.as_str()) {
                    lines.push(format!("  - {state}: {count}"));
                }
            }
        }
        lines.join("\n")
    }
}

impl DisplayFallback for KeyTokenReport {
    fn display(&self) -> String {
        format!("{} (valid for {} min)", self.url, self.ttl_minutes)
    }
}
