// In-memory collaborators for tests and the `simulate` command.
//
// Streams follow a script of frames, errors and ends; detection is a
// closure over the frame; clips are raw frame bytes written to disk;
// alerts are captured in memory.

use crate::config::StreamConfig;
use crate::detector::Detector;
use crate::notifier::NotifyTransport;
use crate::reader::{StreamReader, StreamSource};
use crate::recorder::{ClipEncoder, ClipWriter};
use async_trait::async_trait;
use bytes::Bytes;
use common::{ClipError, DetectError, Detection, Frame, NotifyError, StreamError};
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub const SYNTHETIC_WIDTH: u32 = 8;
pub const SYNTHETIC_HEIGHT: u32 = 6;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A small BGR24 frame whose pixels carry the low byte of its sequence number.
pub fn synthetic_frame(sequence: u64, captured_at: f64) -> Frame {
    let len = Frame::expected_len(SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT);
    Frame::new(
        sequence,
        captured_at,
        SYNTHETIC_WIDTH,
        SYNTHETIC_HEIGHT,
        Bytes::from(vec![(sequence & 0xff) as u8; len]),
    )
}

// ============================================================================
// Scripted stream source
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Deliver a frame captured at the given time (seconds)
    Frame(f64),
    /// Fail one read
    Error,
    /// End of stream
    End,
    /// Block until the reader is dropped or the caller gives up
    Hold,
    /// Sleep before the next step
    Pause(Duration),
}

impl ScriptStep {
    /// Frames at `start, start + step, ...` up to and including `end`.
    pub fn frames(start: f64, end: f64, step: f64) -> Vec<ScriptStep> {
        let mut steps = Vec::new();
        let mut i = 0u64;
        loop {
            let t = start + i as f64 * step;
            if t > end + 1e-9 {
                break;
            }
            steps.push(ScriptStep::Frame(t));
            i += 1;
        }
        steps
    }
}

/// Per-stream counters shared between a source and its readers.
#[derive(Debug, Default)]
pub struct ScriptStats {
    pub opens: AtomicU32,
    pub reads: AtomicU32,
    pub reconnects: AtomicU32,
    pub released: AtomicBool,
}

impl ScriptStats {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct ScriptedStreamSource {
    scripts: DashMap<String, Vec<ScriptStep>>,
    fail_open: DashSet<String>,
    reconnect_results: DashMap<String, Vec<bool>>,
    stats: DashMap<String, Arc<ScriptStats>>,
}

impl ScriptedStreamSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, stream_id: &str, steps: Vec<ScriptStep>) -> Self {
        self.scripts.insert(stream_id.to_string(), steps);
        self
    }

    pub fn failing_open(self, stream_id: &str) -> Self {
        self.fail_open.insert(stream_id.to_string());
        self
    }

    /// Outcomes of successive reconnects; once exhausted reconnects succeed.
    pub fn with_reconnect_results(self, stream_id: &str, results: Vec<bool>) -> Self {
        self.reconnect_results.insert(stream_id.to_string(), results);
        self
    }

    pub fn stats(&self, stream_id: &str) -> Arc<ScriptStats> {
        self.stats
            .entry(stream_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

#[async_trait]
impl StreamSource for ScriptedStreamSource {
    async fn open(&self, config: &StreamConfig) -> Result<Box<dyn StreamReader>, StreamError> {
        let stats = self.stats(&config.id);
        stats.opens.fetch_add(1, Ordering::SeqCst);

        if self.fail_open.contains(&config.id) {
            return Err(StreamError::OpenFailed {
                source_desc: config.source.clone(),
                reason: "scripted open failure".to_string(),
            });
        }

        let steps = self
            .scripts
            .get(&config.id)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        let reconnect_results = self
            .reconnect_results
            .get(&config.id)
            .map(|r| r.value().clone())
            .unwrap_or_default();

        Ok(Box::new(ScriptedReader {
            steps: steps.into(),
            reconnect_results: reconnect_results.into(),
            sequence: 0,
            stats,
        }))
    }
}

pub struct ScriptedReader {
    steps: VecDeque<ScriptStep>,
    reconnect_results: VecDeque<bool>,
    sequence: u64,
    stats: Arc<ScriptStats>,
}

#[async_trait]
impl StreamReader for ScriptedReader {
    async fn read(&mut self) -> Result<Option<Frame>, StreamError> {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);

        loop {
            match self.steps.pop_front() {
                Some(ScriptStep::Frame(t)) => {
                    let frame = synthetic_frame(self.sequence, t);
                    self.sequence += 1;
                    return Ok(Some(frame));
                }
                Some(ScriptStep::Error) => {
                    return Err(StreamError::ReadFailed {
                        reason: "scripted read failure".to_string(),
                    })
                }
                Some(ScriptStep::Pause(duration)) => tokio::time::sleep(duration).await,
                Some(ScriptStep::Hold) => {
                    self.steps.push_front(ScriptStep::Hold);
                    std::future::pending::<()>().await;
                }
                Some(ScriptStep::End) | None => return Ok(None),
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), StreamError> {
        self.stats.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.reconnect_results.pop_front().unwrap_or(true) {
            Ok(())
        } else {
            Err(StreamError::ReconnectFailed {
                reason: "scripted reconnect failure".to_string(),
            })
        }
    }

    async fn release(&mut self) {
        self.stats.released.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Closure detector
// ============================================================================

type DetectFn = dyn Fn(&Frame) -> Result<Detection, DetectError> + Send + Sync;

pub struct FnDetector {
    detect: Box<DetectFn>,
    calls: AtomicUsize,
    call_times: Mutex<Vec<f64>>,
}

impl FnDetector {
    pub fn new<F>(detect: F) -> Self
    where
        F: Fn(&Frame) -> Result<Detection, DetectError> + Send + Sync + 'static,
    {
        Self {
            detect: Box::new(detect),
            calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    /// Present whenever `predicate(captured_at)` holds.
    pub fn by_time<P>(predicate: P) -> Self
    where
        P: Fn(f64) -> bool + Send + Sync + 'static,
    {
        Self::new(move |frame| {
            Ok(if predicate(frame.captured_at) {
                Detection::present(None, Some(1.0))
            } else {
                Detection::absent()
            })
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Capture times of the frames passed to `detect`, in call order.
    pub fn call_times(&self) -> Vec<f64> {
        lock(&self.call_times).clone()
    }
}

#[async_trait]
impl Detector for FnDetector {
    async fn detect(&self, frame: &Frame) -> Result<Detection, DetectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.call_times).push(frame.captured_at);
        (self.detect)(frame)
    }
}

// ============================================================================
// In-memory clip encoder
// ============================================================================

/// Writes the raw frame bytes to the clip path.
#[derive(Default)]
pub struct MemoryClipEncoder {
    fail: AtomicBool,
    written: Arc<Mutex<Vec<u64>>>,
    opened_fps: Mutex<Vec<u32>>,
}

impl MemoryClipEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `open` calls fail as if no codec were installed.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn written_sequences(&self) -> Vec<u64> {
        lock(&self.written).clone()
    }

    pub fn opened_fps(&self) -> Vec<u32> {
        lock(&self.opened_fps).clone()
    }
}

#[async_trait]
impl ClipEncoder for MemoryClipEncoder {
    async fn open(
        &self,
        path: &Path,
        _width: u32,
        _height: u32,
        fps: u32,
    ) -> Result<Box<dyn ClipWriter>, ClipError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClipError::CodecUnavailable {
                reason: "scripted encoder failure".to_string(),
            });
        }

        lock(&self.opened_fps).push(fps);
        let file = tokio::fs::File::create(path).await?;
        Ok(Box::new(MemoryClipWriter {
            file,
            written: self.written.clone(),
        }))
    }
}

struct MemoryClipWriter {
    file: tokio::fs::File,
    written: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl ClipWriter for MemoryClipWriter {
    async fn write_frames(&mut self, frames: &[Frame]) -> Result<(), ClipError> {
        for frame in frames {
            self.file.write_all(&frame.data).await?;
            lock(&self.written).push(frame.sequence);
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), ClipError> {
        self.file.flush().await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

// ============================================================================
// Recording transport
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub text: String,
    pub attachment: Option<PathBuf>,
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotifyTransport for RecordingTransport {
    async fn send(&self, text: &str, attachment: Option<&Path>) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Transport {
                reason: "scripted delivery failure".to_string(),
            });
        }

        lock(&self.sent).push(SentMessage {
            text: text.to_string(),
            attachment: attachment.map(Path::to_path_buf),
        });
        Ok(())
    }
}
