//! FFmpeg-backed video writer
//!
//! Raw BGRA frames are piped into an `ffmpeg` child process which encodes
//! H.264 into a fragmented MP4. Fragmented output stays playable up to the
//! last complete fragment even if finalization never happens.

use super::types::{WriteError, WriteResult, WriterOutput, WriterSettings};
use super::writer::{VideoWriter, VideoWriterFactory};
use crate::utils::error::{RecorderError, RecorderResult};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

/// How often the completion wait polls the child process
const COMPLETION_POLL: Duration = Duration::from_millis(20);

/// Build the FFmpeg command line for a session
pub fn build_args(settings: &WriterSettings) -> Vec<String> {
    let bitrate = settings.bitrate.max(1);
    vec![
        "-y".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-nostats".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pixel_format".to_string(),
        settings.pixel_format.ffmpeg_name().to_string(),
        "-video_size".to_string(),
        format!("{}x{}", settings.width, settings.height),
        "-framerate".to_string(),
        settings.frame_rate.to_string(),
        "-i".to_string(),
        "-".to_string(), // stdin for video frames
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-b:v".to_string(),
        bitrate.to_string(),
        "-maxrate".to_string(),
        bitrate.to_string(),
        "-bufsize".to_string(),
        (bitrate * 2).to_string(),
        "-g".to_string(),
        (settings.frame_rate * 2).to_string(),
        "-movflags".to_string(),
        "+frag_keyframe+empty_moov+default_base_moof".to_string(),
        "-f".to_string(),
        "mp4".to_string(),
        settings.output_path.to_string_lossy().to_string(),
    ]
}

/// Constant-frame-rate slot a presentation time falls into
pub fn frame_slot(pts: Duration, frame_rate: u32) -> u64 {
    (pts.as_secs_f64() * frame_rate as f64).round() as u64
}

/// How many times a frame landing in `slot` must be written to keep the
/// output at constant frame rate. Zero means the slot was already filled.
fn repeats_for_slot(slot: u64, next_slot: u64, first: bool, max_gap: u64) -> u64 {
    if first {
        return 1;
    }
    if slot < next_slot {
        return 0;
    }
    (slot - next_slot + 1).min(max_gap.max(1))
}

fn classify_io(error: std::io::Error) -> WriteError {
    match error.kind() {
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
            WriteError::Transient(format!("Encoder input busy: {}", error))
        }
        std::io::ErrorKind::BrokenPipe => {
            WriteError::Fatal("Encoder process exited unexpectedly".to_string())
        }
        _ => WriteError::Fatal(format!("Failed to write frame: {}", error)),
    }
}

/// Video writer that pipes frames into FFmpeg
pub struct FfmpegWriter {
    binary: PathBuf,
    settings: WriterSettings,
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    frames_written: u64,
    slots_written: u64,
    next_slot: u64,
}

impl FfmpegWriter {
    pub fn new(binary: PathBuf, settings: WriterSettings) -> Self {
        Self {
            binary,
            settings,
            process: None,
            stdin: None,
            frames_written: 0,
            slots_written: 0,
            next_slot: 0,
        }
    }

    /// Raw frames written to the encoder, including gap fill
    pub fn slots_written(&self) -> u64 {
        self.slots_written
    }

    fn stderr_tail(process: &mut Child) -> String {
        let mut stderr = String::new();
        if let Some(mut pipe) = process.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        stderr.trim().to_string()
    }
}

impl VideoWriter for FfmpegWriter {
    fn start_session(&mut self) -> WriteResult<()> {
        let args = build_args(&self.settings);
        tracing::info!("Starting FFmpeg writer: {:?}", args);

        let mut process = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WriteError::Fatal(format!("Failed to start FFmpeg encoder: {}", e)))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| WriteError::Fatal("Failed to capture FFmpeg stdin".to_string()))?;

        self.process = Some(process);
        self.stdin = Some(stdin);

        tracing::info!(
            "FFmpeg writer started: {}x{} @ {}fps, {} bps, output: {:?}",
            self.settings.width,
            self.settings.height,
            self.settings.frame_rate,
            self.settings.bitrate,
            self.settings.output_path
        );
        Ok(())
    }

    fn append(&mut self, pixels: &[u8], pts: Duration) -> WriteResult<()> {
        let expected = self.settings.frame_size();
        if pixels.len() != expected {
            return Err(WriteError::Transient(format!(
                "Frame size mismatch: got {} bytes, expected {}",
                pixels.len(),
                expected
            )));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WriteError::Fatal("Encoder input is closed".to_string()))?;

        let slot = frame_slot(pts, self.settings.frame_rate);
        let repeats = repeats_for_slot(
            slot,
            self.next_slot,
            self.slots_written == 0,
            self.settings.frame_rate as u64,
        );

        if repeats == 0 {
            return Err(WriteError::Transient(format!(
                "Frame at {:?} shares slot {} with the previous frame",
                pts, slot
            )));
        }

        for _ in 0..repeats {
            stdin.write_all(pixels).map_err(classify_io)?;
            self.slots_written += 1;
        }
        self.next_slot = slot.max(self.next_slot) + 1;
        self.frames_written += 1;
        Ok(())
    }

    fn mark_input_finished(&mut self) -> WriteResult<()> {
        // Closing stdin signals EOF to FFmpeg
        drop(self.stdin.take());
        Ok(())
    }

    fn wait_for_completion(&mut self, timeout: Duration) -> WriteResult<()> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| WriteError::Fatal("Encoder was never started".to_string()))?;

        let started = Instant::now();
        loop {
            match process.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    let stderr = Self::stderr_tail(process);
                    return Err(WriteError::Fatal(format!(
                        "FFmpeg exited with status {}: {}",
                        status, stderr
                    )));
                }
                Ok(None) if started.elapsed() > timeout => {
                    let _ = process.kill();
                    let _ = process.wait();
                    return Err(WriteError::Fatal(format!(
                        "FFmpeg did not finish within {:?}",
                        timeout
                    )));
                }
                Ok(None) => std::thread::sleep(COMPLETION_POLL),
                Err(e) => {
                    return Err(WriteError::Fatal(format!("Failed to wait for FFmpeg: {}", e)));
                }
            }
        }
    }

    fn close(&mut self) -> WriteResult<WriterOutput> {
        self.process = None;

        let path = self.settings.output_path.clone();
        let bytes = std::fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| WriteError::Fatal(format!("Output container missing {:?}: {}", path, e)))?;

        tracing::info!(
            "FFmpeg writer finished: {} frames ({} encoded), {} bytes, output: {:?}",
            self.frames_written,
            self.slots_written,
            bytes,
            path
        );

        Ok(WriterOutput {
            path,
            frames_written: self.frames_written,
            frames_encoded: self.slots_written,
            bytes,
        })
    }

    fn cancel(&mut self) {
        drop(self.stdin.take());
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }

        match std::fs::remove_file(&self.settings.output_path) {
            Ok(()) => tracing::info!("Removed partial output {:?}", self.settings.output_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove partial output {:?}: {}",
                self.settings.output_path,
                e
            ),
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

/// Creates [`FfmpegWriter`]s, checking that the binary is runnable first
#[derive(Debug, Clone)]
pub struct FfmpegWriterFactory {
    binary: PathBuf,
}

impl FfmpegWriterFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

impl Default for FfmpegWriterFactory {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl VideoWriterFactory for FfmpegWriterFactory {
    fn create(&self, settings: &WriterSettings) -> RecorderResult<Box<dyn VideoWriter>> {
        if !self.is_available() {
            return Err(RecorderError::Configuration(format!(
                "FFmpeg not found at {:?}. Please install FFmpeg and add it to PATH.",
                self.binary
            )));
        }
        if settings.width == 0 || settings.height == 0 || settings.frame_rate == 0 {
            return Err(RecorderError::Configuration(format!(
                "Invalid writer geometry {}x{} @ {}fps",
                settings.width, settings.height, settings.frame_rate
            )));
        }

        Ok(Box::new(FfmpegWriter::new(self.binary.clone(), settings.clone())))
    }
}
