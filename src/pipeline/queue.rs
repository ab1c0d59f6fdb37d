//! Encode queue
//!
//! A single worker thread owns the video writer. Frames are appended in
//! submission order, presentation times must strictly increase, and writer
//! failures are classified here: a transient failure costs one frame, a
//! fatal one fails the session and discards everything after it.

use super::types::{Frame, PipelineStats, WriteError, WriteResult, WriterOutput};
use super::writer::VideoWriter;
use crate::recorder::state::{RecordingEvent, StateCell, WriterState};
use crate::utils::error::{FailureEvent, FailureReporter, RecorderError, RecorderResult};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

enum Command {
    Append(Frame),
    Finish {
        cancel: bool,
        reply: oneshot::Sender<WriteResult<WriterOutput>>,
    },
}

/// Called once, from the worker thread, after the first fatal writer error
pub type FatalHook = Box<dyn FnOnce() + Send>;

/// What the worker needs besides the writer
pub struct QueueContext {
    pub state: Arc<StateCell>,
    pub reporter: FailureReporter,
    pub stats: Arc<PipelineStats>,
    pub finish_timeout: Duration,
    pub on_fatal: Option<FatalHook>,
}

/// Cheap handle used by the capture path to submit frames
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Command>,
    stats: Arc<PipelineStats>,
}

impl QueueSender {
    /// Submit a frame without blocking. Returns false once the worker has
    /// shut down; the frame is dropped and its buffer returned to the pool.
    pub fn append(&self, frame: Frame) -> bool {
        if self.tx.send(Command::Append(frame)).is_err() {
            return false;
        }
        PipelineStats::bump(&self.stats.frames_enqueued);
        true
    }
}

/// Owner of the encode worker thread
pub struct EncodeQueue {
    tx: mpsc::UnboundedSender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl EncodeQueue {
    /// Start the worker thread. The writer must already have started its
    /// session.
    pub fn spawn(
        writer: Box<dyn VideoWriter>,
        context: QueueContext,
    ) -> RecorderResult<(Self, QueueSender)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = QueueSender {
            tx: tx.clone(),
            stats: Arc::clone(&context.stats),
        };

        let worker = EncodeWorker {
            writer,
            context,
            last_pts: None,
            failure: None,
        };
        let handle = std::thread::Builder::new()
            .name("encode-queue".to_string())
            .spawn(move || worker.run(rx))?;

        Ok((
            Self {
                tx,
                worker: Some(handle),
            },
            sender,
        ))
    }

    /// Drain everything submitted so far, then finalize the writer (or
    /// cancel it when `cancel` is set). Blocks until the worker exits.
    pub fn finish(mut self, cancel: bool) -> WriteResult<WriterOutput> {
        let (reply, response) = oneshot::channel();
        let sent = self.tx.send(Command::Finish { cancel, reply });

        let result = match sent {
            Ok(()) => response
                .blocking_recv()
                .unwrap_or_else(|_| Err(WriteError::Fatal("Encode worker stopped".to_string()))),
            Err(_) => Err(WriteError::Fatal("Encode worker stopped".to_string())),
        };

        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("Encode worker panicked");
            }
        }
        result
    }
}

struct EncodeWorker {
    writer: Box<dyn VideoWriter>,
    context: QueueContext,
    last_pts: Option<Duration>,
    /// Set by the first fatal error; later frames are discarded
    failure: Option<String>,
}

impl EncodeWorker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!("Encode worker started");

        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Append(frame) => self.append(frame),
                Command::Finish { cancel, reply } => {
                    let result = self.finalize(cancel);
                    let _ = reply.send(result);
                    tracing::debug!("Encode worker finished");
                    return;
                }
            }
        }

        // Every sender went away without a finish request
        tracing::warn!("Encode queue abandoned, cancelling writer");
        self.writer.cancel();
    }

    fn append(&mut self, frame: Frame) {
        let stats = &self.context.stats;

        if self.failure.is_some() {
            PipelineStats::bump(&stats.discarded);
            return;
        }

        if self.last_pts.is_some_and(|last| frame.pts <= last) {
            PipelineStats::bump(&stats.out_of_order);
            tracing::debug!(
                "Dropping frame {} at {:?}, not after {:?}",
                frame.index,
                frame.pts,
                self.last_pts
            );
            return;
        }
        self.last_pts = Some(frame.pts);

        match self.writer.append(frame.pixels(), frame.pts) {
            Ok(()) => {
                PipelineStats::bump(&stats.frames_written);
            }
            Err(WriteError::Transient(message)) => {
                PipelineStats::bump(&stats.write_failures);
                let error = RecorderError::FrameWrite(message);
                self.context
                    .reporter
                    .report(FailureEvent::from_error(&error).with_frame(frame.index));
            }
            Err(WriteError::Fatal(message)) => {
                PipelineStats::bump(&stats.write_failures);
                self.fail(message, Some(frame.index));
            }
        }
    }

    fn fail(&mut self, message: String, frame_index: Option<u64>) {
        tracing::error!("Writer failed: {}", message);
        self.context.state.set(WriterState::Failed);

        let mut event = FailureEvent::from_error(&RecorderError::WriterFatal(message.clone()));
        if let Some(index) = frame_index {
            event = event.with_frame(index);
        }
        self.context.reporter.report(event);
        self.context
            .state
            .emit(RecordingEvent::Error(message.clone()));
        self.failure = Some(message);

        if let Some(on_fatal) = self.context.on_fatal.take() {
            on_fatal();
        }
    }

    fn finalize(&mut self, cancel: bool) -> WriteResult<WriterOutput> {
        if let Some(message) = self.failure.clone() {
            self.writer.cancel();
            return Err(WriteError::Fatal(message));
        }
        if cancel {
            self.writer.cancel();
            return Err(WriteError::Fatal("Recording cancelled".to_string()));
        }

        let timeout = self.context.finish_timeout;
        let result = self
            .writer
            .mark_input_finished()
            .and_then(|()| self.writer.wait_for_completion(timeout))
            .and_then(|()| self.writer.close());

        match result {
            Ok(output) => {
                self.context.state.set(WriterState::Finished);
                Ok(output)
            }
            Err(e) => {
                let message = format!("Failed to finalize output: {}", e);
                self.writer.cancel();
                // Finalization failures never trigger the induced stop; the
                // stop is already in progress
                self.context.on_fatal = None;
                self.fail(message.clone(), None);
                Err(WriteError::Fatal(message))
            }
        }
    }
}
