use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;

use lessoncast_core::media::{
    CommandExecutor, EncoderSettings, HlsPlaylist, KeyFetch, MediaLibrary, MANIFEST_NAME,
};
use lessoncast_core::{
    ConversionCoordinator, ConversionError, Lesson, MediaLayout, MediaRoutes, MigrationSweep,
    RenditionState, SqliteLessonStore,
};

/// Stands in for ffmpeg: writes two segments and a staging playlist whose key
/// line carries the reference from the key info file.
#[derive(Default)]
struct FakeFfmpeg {
    calls: AtomicUsize,
    fail: bool,
    delay: Duration,
}

impl FakeFfmpeg {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CommandExecutor for FakeFfmpeg {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Ok(Output {
                status: ExitStatus::from_raw(1 << 8),
                stdout: Vec::new(),
                stderr: b"moov atom not found\n".to_vec(),
            });
        }
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let value = |flag: &str| {
            let index = args.iter().position(|arg| arg == flag).unwrap();
            args[index + 1].clone()
        };
        let key_info = std::fs::read_to_string(value("-hls_key_info_file"))?;
        let key_uri = key_info.lines().next().unwrap().to_string();
        let pattern = PathBuf::from(value("-hls_segment_filename"));
        let asset_dir = pattern.parent().unwrap();

        let mut playlist = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-PLAYLIST-TYPE:VOD\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"{key_uri}\",IV=0x00000000000000000000000000000000\n"
        );
        for index in 0..2 {
            let name = format!("segment_{index:03}.ts");
            std::fs::write(asset_dir.join(&name), format!("encrypted-{index}"))?;
            playlist.push_str(&format!("#EXTINF:10.000000,\n{name}\n"));
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        std::fs::write(args.last().unwrap(), playlist)?;
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

struct Harness {
    _dir: TempDir,
    store: SqliteLessonStore,
    layout: MediaLayout,
    routes: MediaRoutes,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = MediaLayout::new(dir.path().join("data"));
        std::fs::create_dir_all(layout.uploads_dir()).unwrap();
        let store = SqliteLessonStore::new(layout.root().join("lessons.sqlite")).unwrap();
        store.initialize().unwrap();
        Self {
            _dir: dir,
            store,
            layout,
            routes: MediaRoutes::default(),
        }
    }

    fn coordinator(&self, executor: Arc<FakeFfmpeg>) -> ConversionCoordinator {
        ConversionCoordinator::new(
            self.store.clone(),
            self.layout.clone(),
            self.routes.clone(),
            EncoderSettings::default(),
            Some(executor),
        )
    }

    fn seed_lesson(&self, lesson_id: &str, file: &str) -> Lesson {
        std::fs::write(self.layout.upload_path(file).unwrap(), b"raw video bytes").unwrap();
        let lesson = Lesson::new(lesson_id, "subject-1", "teacher-1", "Lesson").with_upload(file, "/uploads");
        self.store.insert_lesson(&lesson).unwrap()
    }
}

#[tokio::test]
async fn converted_lesson_is_rewritten_published_and_servable() {
    let harness = Harness::new();
    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let coordinator = harness.coordinator(ffmpeg.clone());
    let lesson = harness.seed_lesson("l1", "clip.mp4");

    let outcome = coordinator.convert_if_needed(&lesson).await.unwrap();
    assert!(outcome.encrypted);
    assert!(outcome.encoded);
    assert_eq!(outcome.state, RenditionState::Converted);
    let asset_id = outcome.reference.video_id.clone().unwrap();
    assert!(asset_id.starts_with("lesson-l1-"));
    assert_eq!(
        outcome.reference.video_url,
        format!("/media/{asset_id}/{MANIFEST_NAME}")
    );
    assert_eq!(ffmpeg.calls(), 1);

    let manifest = std::fs::read_to_string(harness.layout.manifest_path(&asset_id).unwrap()).unwrap();
    assert!(manifest.contains(&format!("URI=\"/media/key/{asset_id}\"")));
    assert!(!manifest.contains(&format!("URI=\"{asset_id}.key\"")));
    assert!(!harness.layout.staging_manifest_path(&asset_id).unwrap().exists());
    assert!(harness.layout.rewrite_marker_path(&asset_id).unwrap().exists());

    let stored = harness.store.fetch_by_id("l1").unwrap().unwrap();
    assert_eq!(stored.rendition_state, RenditionState::Converted);
    assert_eq!(stored.video_reference(), outcome.reference);

    let library = MediaLibrary::new(harness.layout.clone(), harness.routes.clone(), None);
    assert!(library.get_manifest(&asset_id).await.unwrap().is_some());
    let segment = library
        .get_segment(&asset_id, "segment_001.ts")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(segment.bytes, b"encrypted-1");
    match library.fetch_key(&asset_id, None).await.unwrap() {
        KeyFetch::Served(payload) => assert_eq!(payload.bytes.len(), 16),
        other => panic!("unexpected key fetch: {other:?}"),
    }
}

#[tokio::test]
async fn second_conversion_reuses_rendition_without_encoding() {
    let harness = Harness::new();
    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let coordinator = harness.coordinator(ffmpeg.clone());
    let stale_snapshot = harness.seed_lesson("l1", "clip.mp4");

    let first = coordinator.convert_if_needed(&stale_snapshot).await.unwrap();
    let second = coordinator.convert_if_needed(&stale_snapshot).await.unwrap();
    let third = coordinator.convert_lesson_by_id("l1").await.unwrap();

    assert_eq!(first.reference, second.reference);
    assert_eq!(first.reference, third.reference);
    assert!(!second.encoded);
    assert!(!third.encoded);
    assert_eq!(ffmpeg.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_conversions_share_one_encode() {
    let harness = Harness::new();
    let ffmpeg = Arc::new(FakeFfmpeg::slow(Duration::from_millis(300)));
    let coordinator = harness.coordinator(ffmpeg.clone());
    let lesson = harness.seed_lesson("l1", "clip.mp4");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        let lesson = lesson.clone();
        handles.push(tokio::spawn(async move {
            coordinator.convert_if_needed(&lesson).await.unwrap()
        }));
    }
    let mut urls = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(outcome.encrypted);
        urls.push(outcome.reference.video_url);
    }

    assert_eq!(ffmpeg.calls(), 1);
    assert!(urls.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn encoder_failure_falls_back_to_raw_upload_and_retries_later() {
    let harness = Harness::new();
    let broken = Arc::new(FakeFfmpeg::failing());
    let lesson = harness.seed_lesson("l1", "clip.mp4");

    let outcome = harness
        .coordinator(broken.clone())
        .convert_if_needed(&lesson)
        .await
        .unwrap();
    assert!(!outcome.encrypted);
    assert_eq!(outcome.reference.video_url, "/uploads/clip.mp4");
    assert_eq!(outcome.state, RenditionState::Failed);
    assert!(outcome.failure.unwrap().contains("moov atom not found"));
    let asset_id = outcome.reference.video_id.unwrap();
    let key_before = std::fs::read(harness.layout.key_path(&asset_id).unwrap()).unwrap();

    let stored = harness.store.fetch_by_id("l1").unwrap().unwrap();
    assert_eq!(stored.rendition_state, RenditionState::Failed);
    assert_eq!(stored.video_url, "/uploads/clip.mp4");

    let working = Arc::new(FakeFfmpeg::default());
    let retried = harness
        .coordinator(working.clone())
        .convert_lesson_by_id("l1")
        .await
        .unwrap();
    assert!(retried.encrypted);
    assert_eq!(retried.reference.video_id.as_deref(), Some(asset_id.as_str()));
    assert_eq!(
        std::fs::read(harness.layout.key_path(&asset_id).unwrap()).unwrap(),
        key_before
    );
    assert_eq!(working.calls(), 1);
}

#[tokio::test]
async fn ingest_always_creates_the_lesson() {
    let harness = Harness::new();
    std::fs::write(harness.layout.upload_path("new.mp4").unwrap(), b"raw").unwrap();
    let lesson = Lesson::new(Lesson::generate_id(), "s", "t", "New").with_upload("new.mp4", "/uploads");
    let lesson_id = lesson.lesson_id.clone();

    let outcome = harness
        .coordinator(Arc::new(FakeFfmpeg::failing()))
        .ingest_lesson(lesson)
        .await
        .unwrap();
    assert!(!outcome.encrypted);
    assert!(harness.store.fetch_by_id(&lesson_id).unwrap().is_some());
}

#[tokio::test]
async fn missing_source_and_unknown_lesson_are_errors() {
    let harness = Harness::new();
    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let coordinator = harness.coordinator(ffmpeg.clone());
    let lesson = harness.seed_lesson("l1", "clip.mp4");
    std::fs::remove_file(harness.layout.upload_path("clip.mp4").unwrap()).unwrap();

    assert!(matches!(
        coordinator.convert_if_needed(&lesson).await,
        Err(ConversionError::SourceMissing { .. })
    ));
    assert!(matches!(
        coordinator.convert_lesson_by_id("nope").await,
        Err(ConversionError::LessonNotFound { .. })
    ));
    assert_eq!(ffmpeg.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_and_on_demand_conversion_share_one_encode() {
    let harness = Harness::new();
    let ffmpeg = Arc::new(FakeFfmpeg::slow(Duration::from_millis(300)));
    let coordinator = harness.coordinator(ffmpeg.clone());
    harness.seed_lesson("l1", "clip.mp4");
    let sweep = MigrationSweep::for_coordinator(&coordinator);

    let (on_demand, report) = tokio::join!(coordinator.convert_lesson_by_id("l1"), sweep.run_once());
    let on_demand = on_demand.unwrap();
    let report = report.unwrap();

    assert_eq!(ffmpeg.calls(), 1);
    assert!(on_demand.encrypted);
    assert_eq!(report.failed, 0);
    assert_eq!(report.fallback, 0);
    let stored = harness.store.fetch_by_id("l1").unwrap().unwrap();
    assert_eq!(stored.rendition_state, RenditionState::Converted);
    assert_eq!(stored.video_reference(), on_demand.reference);
}

#[tokio::test]
async fn published_manifest_has_one_key_and_contiguous_segments() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(Arc::new(FakeFfmpeg::default()));
    let lesson = harness.seed_lesson("l1", "clip.mp4");
    let asset_id = coordinator
        .convert_if_needed(&lesson)
        .await
        .unwrap()
        .reference
        .video_id
        .unwrap();

    let contents = std::fs::read_to_string(harness.layout.manifest_path(&asset_id).unwrap()).unwrap();
    let playlist = HlsPlaylist::parse(&contents).unwrap();
    assert_eq!(playlist.key_uris, vec![format!("/media/key/{asset_id}")]);
    assert_eq!(contents.matches("#EXT-X-KEY:").count(), 1);
    let names: Vec<String> = playlist.segments.iter().map(|segment| segment.uri.clone()).collect();
    let expected: Vec<String> = (0..names.len()).map(|index| format!("segment_{index:03}.ts")).collect();
    assert!(!names.is_empty());
    assert_eq!(names, expected);
    assert!(playlist.ended);
}

#[tokio::test]
async fn leftovers_from_an_interrupted_encode_are_redone() {
    let harness = Harness::new();
    let ffmpeg = Arc::new(FakeFfmpeg::default());
    let coordinator = harness.coordinator(ffmpeg.clone());
    std::fs::write(harness.layout.upload_path("clip.mp4").unwrap(), b"raw video bytes").unwrap();
    let mut lesson = Lesson::new("l1", "s", "t", "Lesson").with_upload("clip.mp4", "/uploads");
    lesson.video_id = Some("lesson-l1-stale".into());
    let lesson = harness.store.insert_lesson(&lesson).unwrap();

    let asset_dir = harness.layout.asset_dir("lesson-l1-stale").unwrap();
    std::fs::create_dir_all(&asset_dir).unwrap();
    let staging = harness.layout.staging_manifest_path("lesson-l1-stale").unwrap();
    std::fs::write(
        &staging,
        "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"lesson-l1-stale.key\"\n#EXTINF:10.0,\nsegment_000.ts\n",
    )
    .unwrap();
    let marker = harness.layout.rewrite_marker_path("lesson-l1-stale").unwrap();
    std::fs::write(&marker, b"").unwrap();

    let outcome = coordinator.convert_if_needed(&lesson).await.unwrap();
    assert!(outcome.encrypted);
    assert!(outcome.encoded);
    assert_eq!(outcome.reference.video_id.as_deref(), Some("lesson-l1-stale"));
    assert_eq!(ffmpeg.calls(), 1);

    let manifest =
        std::fs::read_to_string(harness.layout.manifest_path("lesson-l1-stale").unwrap()).unwrap();
    assert!(manifest.contains("URI=\"/media/key/lesson-l1-stale\""));
    assert!(!manifest.contains("URI=\"lesson-l1-stale.key\""));
    assert!(manifest.contains("segment_001.ts"));
    assert!(!staging.exists());
    assert!(marker.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unusable_asset_id_is_replaced_by_a_single_id() {
    let harness = Harness::new();
    let ffmpeg = Arc::new(FakeFfmpeg::slow(Duration::from_millis(200)));
    let coordinator = harness.coordinator(ffmpeg.clone());
    std::fs::write(harness.layout.upload_path("clip.mp4").unwrap(), b"raw video bytes").unwrap();
    let mut lesson = Lesson::new("l1", "s", "t", "Lesson").with_upload("clip.mp4", "/uploads");
    lesson.video_id = Some("../escape".into());
    let lesson = harness.store.insert_lesson(&lesson).unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let coordinator = coordinator.clone();
        let lesson = lesson.clone();
        handles.push(tokio::spawn(async move {
            coordinator.convert_if_needed(&lesson).await.unwrap()
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().reference.video_id.unwrap());
    }

    assert!(ids[0].starts_with("lesson-l1-"));
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(ffmpeg.calls(), 1);
}
