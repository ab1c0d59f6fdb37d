//! In-memory stand-ins for the platform capabilities, used by unit tests

use crate::capture::bitmap::{BitmapContext, Color};
use crate::capture::ticker::{TickCallback, TickSource};
use crate::capture::traits::{CaptureError, ScreenSnapshot};
use crate::pipeline::types::{WriteError, WriteResult, WriterOutput, WriterSettings};
use crate::pipeline::writer::{VideoWriter, VideoWriterFactory};
use crate::utils::error::{RecorderError, RecorderResult};
use parking_lot::{Condvar, Mutex};
use std::io::Write;
use std::path::PathBuf;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot that paints the whole frame one color
pub struct SolidSnapshot {
    color: Color,
}

impl SolidSnapshot {
    pub fn new(color: Color) -> Self {
        Self { color }
    }
}

impl ScreenSnapshot for SolidSnapshot {
    fn render(&self, context: &mut BitmapContext<'_>, _scale: f64) -> Result<(), CaptureError> {
        context.clear(self.color);
        Ok(())
    }
}

/// Snapshot that is denied access on chosen render calls, counted from zero,
/// and paints black otherwise
pub struct DeniedSnapshot {
    denied: HashSet<usize>,
    renders: AtomicUsize,
}

impl DeniedSnapshot {
    pub fn on_calls(calls: impl IntoIterator<Item = usize>) -> Self {
        Self {
            denied: calls.into_iter().collect(),
            renders: AtomicUsize::new(0),
        }
    }
}

impl ScreenSnapshot for DeniedSnapshot {
    fn render(&self, context: &mut BitmapContext<'_>, _scale: f64) -> Result<(), CaptureError> {
        let call = self.renders.fetch_add(1, Ordering::SeqCst);
        if self.denied.contains(&call) {
            return Err(CaptureError::PermissionDenied("screen recording".to_string()));
        }
        context.clear(Color::BLACK);
        Ok(())
    }
}

/// Tick source driven by the test through [`ManualTickSource::fire`]
#[derive(Clone, Default)]
pub struct ManualTickSource {
    callback: Arc<Mutex<Option<TickCallback>>>,
}

impl ManualTickSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one tick synchronously. Returns false when not started.
    pub fn fire(&self, at: Instant) -> bool {
        let callback = self.callback.lock().clone();
        match callback {
            Some(callback) => {
                callback(at);
                true
            }
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.callback.lock().is_some()
    }
}

impl TickSource for ManualTickSource {
    fn start(&mut self, on_tick: TickCallback) -> RecorderResult<()> {
        *self.callback.lock() = Some(on_tick);
        Ok(())
    }

    fn stop(&mut self) {
        *self.callback.lock() = None;
    }

    fn frame_rate(&self) -> u32 {
        60
    }
}

/// Latch that holds writer completion until the test opens it
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (open, opened) = &*self.inner;
        *open.lock() = true;
        opened.notify_all();
    }

    /// Block until opened; gives up after `limit` so a failing test cannot hang
    pub fn wait(&self, limit: Duration) {
        let (open, opened) = &*self.inner;
        let mut open = open.lock();
        if !*open {
            opened.wait_while_for(&mut open, |open| !*open, limit);
        }
    }
}

/// Which append call should fail, counted from zero
#[derive(Debug, Clone, Copy)]
pub enum FailAt {
    Transient(usize),
    Fatal(usize),
}

/// Everything a [`MemoryWriter`] was asked to do
#[derive(Debug, Default)]
pub struct WriterLog {
    pub started: bool,
    pub frames: Vec<Duration>,
    pub input_finished: bool,
    pub closed: bool,
    pub cancelled: bool,
}

/// Writer that records calls and, given a path, writes a placeholder file
pub struct MemoryWriter {
    frame_size: usize,
    path: Option<PathBuf>,
    fail: Option<FailAt>,
    gate: Option<Gate>,
    attempts: usize,
    log: Arc<Mutex<WriterLog>>,
}

impl MemoryWriter {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            frame_size: width as usize * height as usize * 4,
            path: None,
            fail: None,
            gate: None,
            attempts: 0,
            log: Arc::new(Mutex::new(WriterLog::default())),
        }
    }

    pub fn failing(mut self, fail: FailAt) -> Self {
        self.fail = Some(fail);
        self
    }

    /// Hold `wait_for_completion` until `gate` opens
    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn writing_to(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn log(&self) -> Arc<Mutex<WriterLog>> {
        self.log.clone()
    }
}

impl VideoWriter for MemoryWriter {
    fn start_session(&mut self) -> WriteResult<()> {
        if let Some(path) = &self.path {
            std::fs::write(path, b"")
                .map_err(|e| WriteError::Fatal(format!("create {:?}: {}", path, e)))?;
        }
        self.log.lock().started = true;
        Ok(())
    }

    fn append(&mut self, pixels: &[u8], pts: Duration) -> WriteResult<()> {
        let attempt = self.attempts;
        self.attempts += 1;

        match self.fail {
            Some(FailAt::Transient(n)) if n == attempt => {
                return Err(WriteError::Transient(format!("frame {} rejected", attempt)));
            }
            Some(FailAt::Fatal(n)) if n == attempt => {
                return Err(WriteError::Fatal("disk full".to_string()));
            }
            _ => {}
        }
        if pixels.len() != self.frame_size {
            return Err(WriteError::Transient("frame size mismatch".to_string()));
        }

        if let Some(path) = &self.path {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(|e| WriteError::Fatal(e.to_string()))?;
            writeln!(file, "{}", pts.as_millis()).map_err(|e| WriteError::Fatal(e.to_string()))?;
        }
        self.log.lock().frames.push(pts);
        Ok(())
    }

    fn mark_input_finished(&mut self) -> WriteResult<()> {
        self.log.lock().input_finished = true;
        Ok(())
    }

    fn wait_for_completion(&mut self, timeout: Duration) -> WriteResult<()> {
        if let Some(gate) = &self.gate {
            gate.wait(timeout);
        }
        Ok(())
    }

    fn close(&mut self) -> WriteResult<WriterOutput> {
        let mut log = self.log.lock();
        log.closed = true;

        let bytes = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(WriterOutput {
            path: self.path.clone().unwrap_or_default(),
            frames_written: log.frames.len() as u64,
            frames_encoded: log.frames.len() as u64,
            bytes,
        })
    }

    fn cancel(&mut self) {
        self.log.lock().cancelled = true;
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Factory handing out [`MemoryWriter`]s that write to the session path
#[derive(Clone, Default)]
pub struct MemoryWriterFactory {
    fail: Option<FailAt>,
    gate: Option<Gate>,
    reject: bool,
    logs: Arc<Mutex<Vec<Arc<Mutex<WriterLog>>>>>,
    settings: Arc<Mutex<Vec<WriterSettings>>>,
}

impl MemoryWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(fail: FailAt) -> Self {
        Self {
            fail: Some(fail),
            ..Self::default()
        }
    }

    /// Factory whose writers block in `wait_for_completion` until the
    /// returned gate opens
    pub fn gated() -> (Self, Gate) {
        let gate = Gate::default();
        let factory = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (factory, gate)
    }

    /// Factory whose `create` always fails
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    /// Log of the most recently created writer
    pub fn last_log(&self) -> Option<Arc<Mutex<WriterLog>>> {
        self.logs.lock().last().cloned()
    }

    pub fn last_settings(&self) -> Option<WriterSettings> {
        self.settings.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.logs.lock().len()
    }
}

impl VideoWriterFactory for MemoryWriterFactory {
    fn create(&self, settings: &WriterSettings) -> RecorderResult<Box<dyn VideoWriter>> {
        if self.reject {
            return Err(RecorderError::Configuration("writer unavailable".to_string()));
        }

        let mut writer = MemoryWriter::new(settings.width, settings.height)
            .writing_to(settings.output_path.clone());
        if let Some(fail) = self.fail {
            writer = writer.failing(fail);
        }
        if let Some(gate) = &self.gate {
            writer = writer.gated(gate.clone());
        }

        self.logs.lock().push(writer.log());
        self.settings.lock().push(settings.clone());
        Ok(Box::new(writer))
    }
}
