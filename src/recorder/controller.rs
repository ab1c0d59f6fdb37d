//! Recorder controller
//!
//! Owns the session lifecycle: prepares the output, wires the tick source to
//! the frame source and the encode queue, and tears everything down again on
//! stop or after a fatal writer error.

use super::state::{
    QualityPreset, RecorderConfig, RecordingEvent, RecordingSession, StateCell, StopOutcome,
    WriterState,
};
use crate::capture::compositor::FrameCompositor;
use crate::capture::frame_source::{CaptureOutcome, FrameSource, OutputGeometry};
use crate::capture::ticker::{IntervalTickSource, TickCallback, TickSource, DEFAULT_FRAME_RATE};
use crate::capture::traits::{DisplayInfo, OverlayDrawer, OverlayText, ScreenSnapshot};
use crate::library::MediaLibrary;
use crate::pipeline::ffmpeg::FfmpegWriterFactory;
use crate::pipeline::queue::{EncodeQueue, FatalHook, QueueContext, QueueSender};
use crate::pipeline::types::{
    PipelineStats, PixelFormat, RecordingOutput, StatsSnapshot, WriterSettings,
};
use crate::pipeline::writer::VideoWriterFactory;
use crate::utils::error::{
    FailureEvent, FailureObserver, FailureReporter, RecorderError, RecorderResult,
};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};

/// Completion callback for [`RecorderController::stop`]
pub type StopCallback = Box<dyn FnOnce(StopOutcome) + Send>;

/// Platform capabilities the controller is built from
pub struct RecorderDeps {
    /// Display being recorded
    pub display: DisplayInfo,
    /// Source of on-screen pixels
    pub snapshot: Arc<dyn ScreenSnapshot>,
    /// Capture cadence
    pub tick_source: Box<dyn TickSource>,
    /// Builds one writer per session
    pub writer_factory: Arc<dyn VideoWriterFactory>,
    /// Optional destination for finished recordings
    pub library: Option<Arc<dyn MediaLibrary>>,
}

impl RecorderDeps {
    /// Interval ticks at the configured (or display) rate feeding an FFmpeg
    /// writer
    pub fn ffmpeg(
        display: DisplayInfo,
        snapshot: Arc<dyn ScreenSnapshot>,
        config: &RecorderConfig,
        runtime: Handle,
    ) -> Self {
        let frame_rate = config
            .frame_rate
            .or(display.refresh_rate)
            .unwrap_or(DEFAULT_FRAME_RATE);

        Self {
            display,
            snapshot,
            tick_source: Box::new(IntervalTickSource::new(frame_rate, runtime)),
            writer_factory: Arc::new(FfmpegWriterFactory::default()),
            library: None,
        }
    }

    pub fn with_library(mut self, library: Arc<dyn MediaLibrary>) -> Self {
        self.library = Some(library);
        self
    }
}

struct ActiveSession {
    session: RecordingSession,
    frame_source: Arc<FrameSource>,
    queue: EncodeQueue,
    sender: QueueSender,
    stats: Arc<PipelineStats>,
}

#[derive(Default)]
struct SessionSlot {
    active: Option<ActiveSession>,
    /// A stop is draining the previous session
    finishing: bool,
    /// Callbacks waiting for the stop in progress
    waiters: Vec<StopCallback>,
}

struct ControllerInner {
    runtime: Handle,
    display: DisplayInfo,
    snapshot: Arc<dyn ScreenSnapshot>,
    writer_factory: Arc<dyn VideoWriterFactory>,
    library: Option<Arc<dyn MediaLibrary>>,
    tick_source: Mutex<Box<dyn TickSource>>,
    config: RwLock<RecorderConfig>,
    session: Mutex<SessionSlot>,
    state: Arc<StateCell>,
    compositor: FrameCompositor,
    reporter: FailureReporter,
    stats: Mutex<Arc<PipelineStats>>,
    last_output: Mutex<Option<RecordingOutput>>,
}

/// Drives screen recording sessions
#[derive(Clone)]
pub struct RecorderController {
    inner: Arc<ControllerInner>,
}

impl RecorderController {
    /// Create a controller on the current tokio runtime
    pub fn new(deps: RecorderDeps, config: RecorderConfig) -> RecorderResult<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            RecorderError::Configuration(
                "RecorderController must be created inside a tokio runtime".to_string(),
            )
        })?;
        Self::with_runtime(deps, config, runtime)
    }

    pub fn with_runtime(
        deps: RecorderDeps,
        config: RecorderConfig,
        runtime: Handle,
    ) -> RecorderResult<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(ControllerInner {
                runtime,
                display: deps.display,
                snapshot: deps.snapshot,
                writer_factory: deps.writer_factory,
                library: deps.library,
                tick_source: Mutex::new(deps.tick_source),
                config: RwLock::new(config),
                session: Mutex::new(SessionSlot::default()),
                state: Arc::new(StateCell::new()),
                compositor: FrameCompositor::new(),
                reporter: FailureReporter::new(),
                stats: Mutex::new(Arc::new(PipelineStats::default())),
                last_output: Mutex::new(None),
            }),
        })
    }

    /// Start recording with the configured quality
    pub fn start(&self) -> RecorderResult<()> {
        let quality = self.inner.config.read().quality;
        self.start_with_quality(quality)
    }

    /// Start recording with an explicit quality preset
    pub fn start_with_quality(&self, quality: QualityPreset) -> RecorderResult<()> {
        ControllerInner::start_session(&self.inner, quality)
    }

    /// Stop recording. `on_complete` runs exactly once on a blocking worker
    /// of the runtime, after the output has been finalized (or discarded).
    /// When nothing is recording it receives [`StopOutcome::NotRecording`].
    pub fn stop<F>(&self, on_complete: F)
    where
        F: FnOnce(StopOutcome) + Send + 'static,
    {
        ControllerInner::stop_session(&self.inner, Some(Box::new(on_complete)));
    }

    /// Stop recording and wait for the outcome
    pub async fn stop_and_wait(&self) -> StopOutcome {
        let (tx, rx) = oneshot::channel();
        self.stop(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(StopOutcome::NotRecording)
    }

    /// Delete the configured output file.
    ///
    /// Refused while a session owns the file. A missing file is not an error.
    pub fn remove_output_file(&self) -> RecorderResult<()> {
        if self.is_recording() {
            let error = RecorderError::FileRemoval(
                "Cannot remove the output file while recording".to_string(),
            );
            self.report(&error);
            return Err(error);
        }

        let path = self.inner.config.read().output_path.clone();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("Removed output file {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                let error = RecorderError::FileRemoval(format!("{:?}: {}", path, e));
                self.report(&error);
                Err(error)
            }
        }
    }

    /// Save the last finished recording to the media library.
    /// `on_complete` receives the library location.
    pub fn save_to_library<F>(&self, on_complete: F)
    where
        F: FnOnce(RecorderResult<PathBuf>) + Send + 'static,
    {
        let library = self.inner.library.clone();
        let output = self.inner.last_output.lock().clone();
        let reporter = self.inner.reporter.clone();

        self.inner.runtime.spawn(async move {
            let result = match (library, output) {
                (None, _) => Err(RecorderError::Configuration(
                    "No media library configured".to_string(),
                )),
                (_, None) => Err(RecorderError::Configuration(
                    "No finished recording to save".to_string(),
                )),
                (Some(library), Some(output)) => {
                    persist(library.as_ref(), &output.output_path, &reporter).await
                }
            };
            on_complete(result);
        });
    }

    /// True from a successful start until the matching stop completes
    pub fn is_recording(&self) -> bool {
        let slot = self.inner.session.lock();
        slot.active.is_some() || slot.finishing
    }

    pub fn state(&self) -> WriterState {
        self.inner.state.get()
    }

    /// The running session, if any
    pub fn session(&self) -> Option<RecordingSession> {
        let slot = self.inner.session.lock();
        slot.active.as_ref().map(|active| RecordingSession {
            state: self.inner.state.get(),
            ..active.session.clone()
        })
    }

    /// Counters for the current (or most recent) session
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.lock().snapshot()
    }

    /// Summary of the most recent finished recording
    pub fn last_output(&self) -> Option<RecordingOutput> {
        self.inner.last_output.lock().clone()
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.inner.state.subscribe()
    }

    pub fn config(&self) -> RecorderConfig {
        self.inner.config.read().clone()
    }

    pub fn set_output_path(&self, path: impl Into<PathBuf>) -> RecorderResult<()> {
        let path = path.into();
        self.update_config(move |config| config.output_path = path)
    }

    pub fn set_quality(&self, quality: QualityPreset) -> RecorderResult<()> {
        self.update_config(move |config| config.quality = quality)
    }

    pub fn set_save_to_library(&self, enabled: bool) -> RecorderResult<()> {
        self.update_config(move |config| config.save_to_library = enabled)
    }

    /// Hook drawn on top of every frame; takes effect on the next frame
    pub fn set_overlay_drawer(&self, drawer: Option<Arc<dyn OverlayDrawer>>) {
        self.inner.compositor.set_drawer(drawer);
    }

    /// Text label drawn into every frame below the drawing hook
    pub fn set_overlay_text(&self, text: Option<Arc<dyn OverlayText>>) {
        self.inner.compositor.set_text(text);
    }

    pub fn set_failure_observer(&self, observer: Option<Arc<dyn FailureObserver>>) {
        self.inner.reporter.set_observer(observer);
    }

    fn update_config<F>(&self, apply: F) -> RecorderResult<()>
    where
        F: FnOnce(&mut RecorderConfig),
    {
        let slot = self.inner.session.lock();
        if slot.active.is_some() || slot.finishing {
            return Err(RecorderError::AlreadyRecording);
        }

        let mut config = self.inner.config.write();
        let mut next = config.clone();
        apply(&mut next);
        next.validate()?;
        *config = next;
        Ok(())
    }

    fn report(&self, error: &RecorderError) {
        self.inner.reporter.report(FailureEvent::from_error(error));
    }
}

impl ControllerInner {
    fn start_session(self: &Arc<Self>, quality: QualityPreset) -> RecorderResult<()> {
        let mut slot = self.session.lock();
        if slot.active.is_some() || slot.finishing {
            return Err(RecorderError::AlreadyRecording);
        }
        self.state
            .transition(|state| !state.is_active(), WriterState::Configuring)
            .map_err(|_| RecorderError::AlreadyRecording)?;

        let active = match self.configure(quality) {
            Ok(active) => active,
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
                self.state.set(WriterState::Idle);
                return Err(e);
            }
        };

        let callback = self.tick_callback(&active);
        if let Err(e) = self.tick_source.lock().start(callback) {
            tracing::error!("Failed to start tick source: {}", e);
            self.state.set(WriterState::Idle);
            self.runtime.spawn_blocking(move || {
                active.frame_source.close();
                let _ = active.queue.finish(true);
            });
            return Err(e);
        }

        self.state.set(WriterState::Writing);
        let session = RecordingSession {
            state: WriterState::Writing,
            ..active.session.clone()
        };
        tracing::info!(
            "Recording started: {} ({}x{}, {:?})",
            session.id,
            session.width,
            session.height,
            session.quality
        );
        self.state.emit(RecordingEvent::Started(session));
        slot.active = Some(active);
        Ok(())
    }

    /// Build everything a session needs, in the Configuring state
    fn configure(self: &Arc<Self>, quality: QualityPreset) -> RecorderResult<ActiveSession> {
        let config = self.config.read().clone();
        let geometry = OutputGeometry::for_display(&self.display, quality);
        let frame_rate = self.tick_source.lock().frame_rate();

        tracing::info!("Starting recording to: {:?}", config.output_path);
        prepare_output(&config.output_path)?;

        let settings = WriterSettings {
            output_path: config.output_path.clone(),
            width: geometry.width,
            height: geometry.height,
            frame_rate,
            bitrate: quality.bitrate(geometry.width, geometry.height),
            pixel_format: PixelFormat::Bgra,
        };
        let mut writer = self.writer_factory.create(&settings)?;
        writer
            .start_session()
            .map_err(|e| RecorderError::Configuration(format!("Failed to start writer: {}", e)))?;

        let stats = Arc::new(PipelineStats::default());
        *self.stats.lock() = Arc::clone(&stats);

        let (queue, sender) = EncodeQueue::spawn(
            writer,
            QueueContext {
                state: Arc::clone(&self.state),
                reporter: self.reporter.clone(),
                stats: Arc::clone(&stats),
                finish_timeout: config.finish_timeout(),
                on_fatal: Some(self.fatal_hook()),
            },
        )?;

        let frame_source = Arc::new(FrameSource::new(
            Arc::clone(&self.snapshot),
            self.compositor.clone(),
            geometry,
            config.pool_capacity,
            config.acquire_timeout(),
            Arc::clone(&stats),
        ));

        Ok(ActiveSession {
            session: RecordingSession::new(
                config.output_path,
                quality,
                geometry.width,
                geometry.height,
            ),
            frame_source,
            queue,
            sender,
            stats,
        })
    }

    /// Capture failures and backpressure are reported once per streak; the
    /// next captured frame ends the streak
    fn tick_callback(&self, active: &ActiveSession) -> TickCallback {
        let frame_source = Arc::clone(&active.frame_source);
        let sender = active.sender.clone();
        let reporter = self.reporter.clone();
        let capture_failing = AtomicBool::new(false);
        let starved = AtomicBool::new(false);

        Arc::new(move |tick| {
            let outcome = frame_source.capture(tick, |frame| {
                if !sender.append(frame) {
                    tracing::debug!("Encode queue closed, frame dropped");
                }
            });
            match outcome {
                CaptureOutcome::Captured { .. } => {
                    capture_failing.store(false, Ordering::Relaxed);
                    starved.store(false, Ordering::Relaxed);
                }
                CaptureOutcome::Failed(e) => {
                    if !capture_failing.swap(true, Ordering::Relaxed) {
                        reporter.report(FailureEvent::from_error(&RecorderError::from(e)));
                    }
                }
                CaptureOutcome::Backpressure => {
                    if !starved.swap(true, Ordering::Relaxed) {
                        reporter.report(FailureEvent::from_error(&RecorderError::Backpressure));
                    }
                }
                CaptureOutcome::Coalesced | CaptureOutcome::Closed => {}
            }
        })
    }

    /// Stops the session from the encode worker after a fatal writer error
    fn fatal_hook(self: &Arc<Self>) -> FatalHook {
        let inner: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                tracing::warn!("Stopping recording after fatal writer error");
                ControllerInner::stop_session(&inner, None);
            }
        })
    }

    fn stop_session(self: &Arc<Self>, on_complete: Option<StopCallback>) {
        let active = {
            let mut slot = self.session.lock();
            match slot.active.take() {
                Some(active) => {
                    slot.finishing = true;
                    slot.waiters.extend(on_complete);
                    active
                }
                None if slot.finishing => {
                    // Join the stop already in progress
                    slot.waiters.extend(on_complete);
                    return;
                }
                None => {
                    if let Some(callback) = on_complete {
                        self.runtime
                            .spawn_blocking(move || callback(StopOutcome::NotRecording));
                    }
                    return;
                }
            }
        };

        tracing::info!("Stopping recording");
        self.tick_source.lock().stop();
        // A failed session stays Failed until it is torn down
        let _ = self
            .state
            .transition(|state| state == WriterState::Writing, WriterState::Finishing);

        let inner = Arc::clone(self);
        self.runtime.spawn_blocking(move || inner.complete_stop(active));
    }

    fn complete_stop(&self, active: ActiveSession) {
        let outcome = self.finish_session(active);

        let waiters = {
            let mut slot = self.session.lock();
            slot.finishing = false;
            self.state.set(WriterState::Idle);
            std::mem::take(&mut slot.waiters)
        };

        match &outcome {
            StopOutcome::Finished(output) => tracing::info!(
                "Recording stopped. {} frames, {} dropped, duration: {}ms",
                output.frames_written,
                output.frames_dropped,
                output.duration_ms
            ),
            StopOutcome::Failed(reason) => tracing::warn!("Recording failed: {}", reason),
            StopOutcome::NotRecording => {}
        }

        self.state.emit(RecordingEvent::Stopped(outcome.clone()));
        for waiter in waiters {
            waiter(outcome.clone());
        }
    }

    /// Drain and finalize; runs on a blocking worker
    fn finish_session(&self, active: ActiveSession) -> StopOutcome {
        let ActiveSession {
            session,
            frame_source,
            queue,
            stats,
            ..
        } = active;

        frame_source.close();
        let result = queue.finish(false);
        let counters = stats.snapshot();

        let written = match result {
            Ok(written) => written,
            Err(e) => return StopOutcome::Failed(e.to_string()),
        };

        let output = RecordingOutput {
            session_id: session.id,
            output_path: session.output_path.clone(),
            frames_written: counters.frames_written,
            frames_encoded: written.frames_encoded,
            frames_dropped: counters.frames_dropped(),
            ticks_coalesced: counters.coalesced,
            duration_ms: session.elapsed_ms().max(0) as u64,
            bytes: written.bytes,
        };
        *self.last_output.lock() = Some(output.clone());

        let save = self.config.read().save_to_library;
        if let (true, Some(library)) = (save, self.library.as_ref()) {
            // Failures are reported; the recording itself is still good
            let _ = self.runtime.block_on(persist(
                library.as_ref(),
                &output.output_path,
                &self.reporter,
            ));
        }

        StopOutcome::Finished(output)
    }
}

async fn persist(
    library: &dyn MediaLibrary,
    path: &Path,
    reporter: &FailureReporter,
) -> RecorderResult<PathBuf> {
    library.save_video(path).await.map_err(|e| {
        let error = RecorderError::ExternalPersistence(format!("{:#}", e));
        reporter.report(FailureEvent::from_error(&error));
        error
    })
}

/// Create the parent directory and clear out any previous file
fn prepare_output(path: &Path) -> RecorderResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            RecorderError::Configuration(format!(
                "Cannot create output directory {:?}: {}",
                parent, e
            ))
        })?;
    }

    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed stale output {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RecorderError::Configuration(format!(
            "Cannot replace output file {:?}: {}",
            path, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::bitmap::{BitmapContext, Color};
    use crate::library::DirectoryLibrary;
    use crate::testing::{
        DeniedSnapshot, FailAt, ManualTickSource, MemoryWriterFactory, SolidSnapshot,
    };
    use crate::utils::error::ErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        controller: RecorderController,
        ticks: ManualTickSource,
        factory: MemoryWriterFactory,
        failures: Arc<Mutex<Vec<FailureEvent>>>,
        dir: TempDir,
    }

    impl Fixture {
        fn new(factory: MemoryWriterFactory) -> Self {
            Self::with_library(factory, None, false)
        }

        fn with_library(
            factory: MemoryWriterFactory,
            library: Option<Arc<dyn MediaLibrary>>,
            save_to_library: bool,
        ) -> Self {
            let snapshot = Arc::new(SolidSnapshot::new(Color::rgb(20, 40, 60)));
            Self::build(factory, snapshot, library, save_to_library)
        }

        fn with_snapshot(snapshot: Arc<dyn ScreenSnapshot>) -> Self {
            Self::build(MemoryWriterFactory::new(), snapshot, None, false)
        }

        fn build(
            factory: MemoryWriterFactory,
            snapshot: Arc<dyn ScreenSnapshot>,
            library: Option<Arc<dyn MediaLibrary>>,
            save_to_library: bool,
        ) -> Self {
            let dir = tempdir().unwrap();
            let ticks = ManualTickSource::new();
            let config = RecorderConfig {
                output_path: dir.path().join("out").join("capture.mp4"),
                save_to_library,
                pool_capacity: 16,
                acquire_timeout_ms: 1_000,
                ..RecorderConfig::default()
            };

            let deps = RecorderDeps {
                display: DisplayInfo::new(64, 48, 1.0),
                snapshot,
                tick_source: Box::new(ticks.clone()),
                writer_factory: Arc::new(factory.clone()),
                library,
            };
            let controller = RecorderController::new(deps, config).unwrap();

            let failures = Arc::new(Mutex::new(Vec::new()));
            let sink = failures.clone();
            controller.set_failure_observer(Some(Arc::new(move |event: &FailureEvent| {
                sink.lock().push(event.clone());
            })));

            Self {
                controller,
                ticks,
                factory,
                failures,
                dir,
            }
        }

        fn fire_at(&self, start: Instant, offsets_ms: &[u64]) {
            for ms in offsets_ms {
                self.ticks.fire(start + Duration::from_millis(*ms));
            }
        }

        fn written_pts(&self) -> Vec<u64> {
            self.factory
                .last_log()
                .map(|log| log.lock().frames.iter().map(|d| d.as_millis() as u64).collect())
                .unwrap_or_default()
        }

        fn failure_kinds(&self) -> Vec<ErrorKind> {
            self.failures.lock().iter().map(|e| e.kind).collect()
        }
    }

    struct FailingLibrary;

    #[async_trait]
    impl MediaLibrary for FailingLibrary {
        async fn save_video(&self, _path: &Path) -> anyhow::Result<PathBuf> {
            anyhow::bail!("library is read-only")
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_while_recording_is_rejected() {
        let fx = Fixture::new(MemoryWriterFactory::new());
        fx.controller.start().unwrap();

        let result = fx.controller.start();
        assert!(matches!(result, Err(RecorderError::AlreadyRecording)));
        assert_eq!(fx.controller.state(), WriterState::Writing);
        assert_eq!(fx.factory.created(), 1);

        fx.controller.stop_and_wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_rejected_while_finishing() {
        let (factory, gate) = MemoryWriterFactory::gated();
        let fx = Fixture::new(factory);
        fx.controller.start().unwrap();
        fx.fire_at(Instant::now(), &[0, 16]);

        let (tx, rx) = oneshot::channel();
        fx.controller.stop(move |outcome| {
            let _ = tx.send(outcome);
        });

        // The writer is held in its completion wait
        assert_eq!(fx.controller.state(), WriterState::Finishing);
        assert!(fx.controller.is_recording());
        let result = fx.controller.start();
        assert!(matches!(result, Err(RecorderError::AlreadyRecording)));
        assert_eq!(fx.factory.created(), 1);

        gate.open();
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("stop should complete once the writer finishes")
            .unwrap();

        assert_eq!(outcome.output().unwrap().frames_written, 2);
        assert_eq!(fx.controller.state(), WriterState::Idle);
        assert!(!fx.controller.is_recording());

        fx.controller.start().unwrap();
        fx.controller.stop_and_wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_when_idle_completes_once() {
        let fx = Fixture::new(MemoryWriterFactory::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = calls.clone();
        fx.controller.stop(move |outcome| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(outcome);
        });

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, StopOutcome::NotRecording));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.controller.state(), WriterState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ticks_become_frames_with_increasing_pts() {
        let fx = Fixture::new(MemoryWriterFactory::new());
        fx.controller.start().unwrap();
        assert!(fx.controller.is_recording());

        fx.fire_at(Instant::now(), &[0, 16, 33, 50, 66]);
        let outcome = fx.controller.stop_and_wait().await;

        let output = outcome.output().expect("recording should finish");
        assert_eq!(output.frames_written, 5);
        assert_eq!(output.frames_dropped, 0);
        assert_eq!(fx.written_pts(), vec![0, 16, 33, 50, 66]);
        assert!(output.output_path.exists());

        assert_eq!(fx.controller.state(), WriterState::Idle);
        assert!(!fx.controller.is_recording());
        assert!(!fx.ticks.is_started());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writer_configured_from_display_and_quality() {
        let fx = Fixture::new(MemoryWriterFactory::new());
        fx.controller.start_with_quality(QualityPreset::Medium).unwrap();
        fx.controller.stop_and_wait().await;

        let settings = fx.factory.last_settings().unwrap();
        assert_eq!((settings.width, settings.height), (48, 36));
        assert_eq!(settings.bitrate, QualityPreset::Medium.bitrate(48, 36));
        assert_eq!(settings.frame_rate, 60);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_tick_time_is_dropped() {
        let fx = Fixture::new(MemoryWriterFactory::new());
        fx.controller.start().unwrap();

        fx.fire_at(Instant::now(), &[0, 16, 16, 33]);
        fx.controller.stop_and_wait().await;

        assert_eq!(fx.written_pts(), vec![0, 16, 33]);
        assert_eq!(fx.controller.stats().out_of_order, 1);
        assert!(fx.failures.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transient_failure_drops_one_frame() {
        let fx = Fixture::new(MemoryWriterFactory::failing(FailAt::Transient(2)));
        fx.controller.start().unwrap();

        fx.fire_at(Instant::now(), &[0, 16, 33, 50, 66]);
        let outcome = fx.controller.stop_and_wait().await;

        assert_eq!(outcome.output().unwrap().frames_written, 4);
        assert_eq!(fx.written_pts(), vec![0, 16, 50, 66]);
        assert_eq!(fx.failure_kinds(), vec![ErrorKind::FrameWrite]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fatal_failure_stops_session() {
        let fx = Fixture::new(MemoryWriterFactory::failing(FailAt::Fatal(1)));
        let mut events = fx.controller.subscribe();
        fx.controller.start().unwrap();

        fx.fire_at(Instant::now(), &[0, 16, 33, 50]);

        let mut states = Vec::new();
        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(RecordingEvent::StateChanged(state)) => states.push(state),
                    Ok(RecordingEvent::Stopped(outcome)) => return outcome,
                    Ok(_) => {}
                    Err(e) => panic!("event stream closed: {}", e),
                }
            }
        })
        .await
        .expect("induced stop should complete");

        assert!(matches!(outcome, StopOutcome::Failed(_)));
        let failed = states.iter().position(|s| *s == WriterState::Failed);
        let idle = states.iter().rposition(|s| *s == WriterState::Idle);
        assert!(failed.is_some() && idle > failed);

        // Exactly one stop notification
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, RecordingEvent::Stopped(_)));
        }

        assert_eq!(fx.written_pts(), vec![0]);
        assert!(fx.failure_kinds().contains(&ErrorKind::WriterFatal));
        assert_eq!(fx.controller.state(), WriterState::Idle);
        assert!(!fx.controller.is_recording());

        // A new session can start afterwards
        fx.controller.start().unwrap();
        fx.controller.stop_and_wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capture_failures_reported_once_per_streak() {
        // Renders 1, 2 and 4 are denied: two separate failure streaks
        let fx = Fixture::with_snapshot(Arc::new(DeniedSnapshot::on_calls([1, 2, 4])));
        fx.controller.start().unwrap();

        fx.fire_at(Instant::now(), &[0, 16, 33, 50, 66, 83]);
        let outcome = fx.controller.stop_and_wait().await;

        assert_eq!(fx.failure_kinds(), vec![ErrorKind::Capture, ErrorKind::Capture]);
        assert!(fx.failures.lock()[0].context.contains("Permission denied"));
        assert_eq!(fx.controller.stats().capture_failures, 3);
        assert_eq!(outcome.output().unwrap().frames_written, 3);
        assert_eq!(fx.written_pts(), vec![0, 50, 83]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_output_file_while_recording() {
        let fx = Fixture::new(MemoryWriterFactory::new());
        fx.controller.start().unwrap();

        let result = fx.controller.remove_output_file();
        assert!(matches!(result, Err(RecorderError::FileRemoval(_))));
        assert_eq!(fx.failure_kinds(), vec![ErrorKind::FileRemoval]);
        assert_eq!(fx.controller.state(), WriterState::Writing);

        fx.fire_at(Instant::now(), &[0]);
        let output = fx.controller.stop_and_wait().await;
        let path = output.output().unwrap().output_path.clone();
        assert!(path.exists());

        fx.controller.remove_output_file().unwrap();
        assert!(!path.exists());
        // Removing a missing file is fine
        fx.controller.remove_output_file().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_start_leaves_idle() {
        let fx = Fixture::new(MemoryWriterFactory::rejecting());

        let result = fx.controller.start();
        assert!(matches!(result, Err(RecorderError::Configuration(_))));
        assert_eq!(fx.controller.state(), WriterState::Idle);
        assert!(!fx.controller.is_recording());
        assert!(!fx.ticks.is_started());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_output_is_replaced() {
        let fx = Fixture::new(MemoryWriterFactory::new());
        let path = fx.controller.config().output_path;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"old recording").unwrap();

        fx.controller.start().unwrap();
        fx.controller.stop_and_wait().await;

        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_settings_locked_while_recording() {
        let fx = Fixture::new(MemoryWriterFactory::new());
        fx.controller.start().unwrap();

        assert!(matches!(
            fx.controller.set_quality(QualityPreset::High),
            Err(RecorderError::AlreadyRecording)
        ));
        assert!(matches!(
            fx.controller.set_output_path(fx.dir.path().join("other.mp4")),
            Err(RecorderError::AlreadyRecording)
        ));

        fx.controller.stop_and_wait().await;
        fx.controller.set_quality(QualityPreset::High).unwrap();
        assert_eq!(fx.controller.config().quality, QualityPreset::High);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlay_hook_runs_per_frame() {
        let fx = Fixture::new(MemoryWriterFactory::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        fx.controller
            .set_overlay_drawer(Some(Arc::new(move |ctx: &mut BitmapContext<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.fill_rect(0, 0, 4, 4, Color::WHITE);
            })));
        fx.controller
            .set_overlay_text(Some(Arc::new(|| Some("00:01".to_string()))));

        fx.controller.start().unwrap();
        fx.fire_at(Instant::now(), &[0, 16, 33]);
        fx.controller.stop_and_wait().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finished_recording_saved_to_library() {
        let library_dir = tempdir().unwrap();
        let library = Arc::new(DirectoryLibrary::new(library_dir.path()));
        let fx = Fixture::with_library(MemoryWriterFactory::new(), Some(library), true);

        fx.controller.start().unwrap();
        fx.fire_at(Instant::now(), &[0, 16]);
        let outcome = fx.controller.stop_and_wait().await;

        assert!(outcome.output().is_some());
        let saved = std::fs::read_dir(library_dir.path()).unwrap().count();
        assert_eq!(saved, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_library_failure_is_reported() {
        let fx = Fixture::with_library(
            MemoryWriterFactory::new(),
            Some(Arc::new(FailingLibrary)),
            true,
        );

        fx.controller.start().unwrap();
        let outcome = fx.controller.stop_and_wait().await;

        assert!(outcome.output().is_some());
        assert_eq!(fx.failure_kinds(), vec![ErrorKind::ExternalPersistence]);

        let (tx, rx) = oneshot::channel();
        fx.controller.save_to_library(move |result| {
            let _ = tx.send(result);
        });
        assert!(matches!(
            rx.await.unwrap(),
            Err(RecorderError::ExternalPersistence(_))
        ));
        assert_eq!(fx.failure_kinds().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_save_without_recording_fails() {
        let library_dir = tempdir().unwrap();
        let library = Arc::new(DirectoryLibrary::new(library_dir.path()));
        let fx = Fixture::with_library(MemoryWriterFactory::new(), Some(library), false);

        let (tx, rx) = oneshot::channel();
        fx.controller.save_to_library(move |result| {
            let _ = tx.send(result);
        });
        assert!(matches!(
            rx.await.unwrap(),
            Err(RecorderError::Configuration(_))
        ));
    }
}
