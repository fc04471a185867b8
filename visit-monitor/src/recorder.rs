// Clip recorder
//
// Frames of a visit are streamed into a clip writer chunk by chunk, so a
// long visit never has to be materialised in memory twice. The container is
// written at a fixed output frame rate independent of the capture rate.

use crate::config::RecordingConfig;
use async_trait::async_trait;
use common::{visit_timestamp, Clip, ClipError, Frame};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Encoding sink: opens a writer for one clip file.
#[async_trait]
pub trait ClipEncoder: Send + Sync {
    async fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn ClipWriter>, ClipError>;
}

/// An open clip file accepting frames in capture order.
#[async_trait]
pub trait ClipWriter: Send {
    async fn write_frames(&mut self, frames: &[Frame]) -> Result<(), ClipError>;

    /// Flush and close the container.
    async fn finish(self: Box<Self>) -> Result<(), ClipError>;

    /// Stop writing; the caller removes the partial file.
    async fn abort(self: Box<Self>);
}

/// ffmpeg-backed encoder reading raw BGR24 frames on stdin
pub struct FfmpegClipEncoder {
    codec: String,
}

impl FfmpegClipEncoder {
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
        }
    }

    pub fn build_args(&self, path: &Path, width: u32, height: u32, fps: u32) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            // 输入：原始BGR24帧，按输出帧率重新计时
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "bgr24".into(),
            "-s".into(),
            format!("{}x{}", width, height),
            "-r".into(),
            fps.to_string(),
            "-i".into(),
            "-".into(),
            "-an".into(),
            "-c:v".into(),
            self.codec.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            path.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl ClipEncoder for FfmpegClipEncoder {
    async fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn ClipWriter>, ClipError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(self.build_args(path, width, height, fps))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Starting clip encoder: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ClipError::CodecUnavailable {
                    reason: "ffmpeg not found in PATH".to_string(),
                }
            } else {
                ClipError::WriteFailed {
                    reason: format!("Failed to start ffmpeg: {}", e),
                }
            }
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ClipError::WriteFailed {
            reason: "Failed to get ffmpeg stdin".to_string(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let clip = path.display().to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("ffmpeg ({}): {}", clip, line);
                }
            });
        }

        Ok(Box::new(FfmpegClipWriter {
            child,
            stdin: Some(stdin),
            frame_len: Frame::expected_len(width, height),
        }))
    }
}

struct FfmpegClipWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    frame_len: usize,
}

#[async_trait]
impl ClipWriter for FfmpegClipWriter {
    async fn write_frames(&mut self, frames: &[Frame]) -> Result<(), ClipError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| ClipError::WriteFailed {
            reason: "encoder input already closed".to_string(),
        })?;

        for frame in frames {
            if frame.data.len() != self.frame_len {
                return Err(ClipError::FrameSizeMismatch {
                    expected: self.frame_len,
                    actual: frame.data.len(),
                });
            }
            stdin
                .write_all(&frame.data)
                .await
                .map_err(|e| ClipError::WriteFailed {
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), ClipError> {
        // 关闭stdin，ffmpeg写完容器尾部后退出
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }

        let status = self.child.wait().await?;
        if !status.success() {
            return Err(ClipError::WriteFailed {
                reason: format!("ffmpeg exited with {}", status),
            });
        }
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        self.stdin = None;
        if let Err(e) = self.child.kill().await {
            debug!("Clip encoder already stopped: {}", e);
        }
    }
}

/// Names clip files and opens recording sessions.
#[derive(Clone)]
pub struct ClipRecorder {
    encoder: Arc<dyn ClipEncoder>,
    output_dir: PathBuf,
    extension: String,
    output_fps: u32,
}

impl ClipRecorder {
    pub fn new(encoder: Arc<dyn ClipEncoder>, config: &RecordingConfig) -> Self {
        Self {
            encoder,
            output_dir: config.output_dir.clone(),
            extension: config.extension.trim_start_matches('.').to_string(),
            output_fps: config.output_fps,
        }
    }

    /// `<output_dir>/<stream_id>/<YYYYmmdd_HHMMSS>.<ext>`; a visit starting in
    /// the same second as an existing clip gets a `-N` suffix.
    pub async fn clip_path(&self, stream_id: &str, start_time: f64) -> Result<PathBuf, ClipError> {
        let dir = self.output_dir.join(stream_id);
        tokio::fs::create_dir_all(&dir).await?;

        let stem = visit_timestamp(start_time);
        let mut path = dir.join(format!("{}.{}", stem, self.extension));
        let mut suffix = 1;
        while tokio::fs::try_exists(&path).await? {
            path = dir.join(format!("{}-{}.{}", stem, suffix, self.extension));
            suffix += 1;
        }
        Ok(path)
    }

    /// Begin recording a visit. The file is created when the first frames arrive.
    pub fn start(&self, stream_id: impl Into<String>, visit_id: Uuid, start_time: f64) -> ClipSession {
        ClipSession {
            recorder: self.clone(),
            stream_id: stream_id.into(),
            visit_id,
            start_time,
            path: None,
            writer: None,
            frames_written: 0,
        }
    }
}

/// One visit's clip being written.
pub struct ClipSession {
    recorder: ClipRecorder,
    stream_id: String,
    visit_id: Uuid,
    start_time: f64,
    path: Option<PathBuf>,
    writer: Option<Box<dyn ClipWriter>>,
    frames_written: usize,
}

impl ClipSession {
    pub fn visit_id(&self) -> Uuid {
        self.visit_id
    }

    /// Stream a chunk of frames into the clip. The chunk is consumed.
    pub async fn append(&mut self, frames: Vec<Frame>) -> Result<(), ClipError> {
        let Some(first) = frames.first() else {
            return Ok(());
        };

        if self.writer.is_none() {
            let path = self
                .recorder
                .clip_path(&self.stream_id, self.start_time)
                .await?;
            let writer = self
                .recorder
                .encoder
                .open(&path, first.width, first.height, self.recorder.output_fps)
                .await?;
            debug!(stream_id = %self.stream_id, visit_id = %self.visit_id, "Recording to {:?}", path);
            self.path = Some(path);
            self.writer = Some(writer);
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.write_frames(&frames).await?;
        }
        self.frames_written += frames.len();
        Ok(())
    }

    /// Close the clip and report where it landed.
    pub async fn finish(mut self) -> Result<Clip, ClipError> {
        let (Some(writer), Some(path)) = (self.writer.take(), self.path.take()) else {
            return Err(ClipError::EmptyVisit);
        };

        if let Err(e) = writer.finish().await {
            remove_partial(&path).await;
            return Err(e);
        }

        let size_bytes = tokio::fs::metadata(&path).await?.len();
        info!(
            stream_id = %self.stream_id,
            visit_id = %self.visit_id,
            "✓ Clip saved: {:?} ({} frames, {} bytes)",
            path,
            self.frames_written,
            size_bytes
        );

        Ok(Clip {
            path,
            size_bytes,
            frame_count: self.frames_written,
        })
    }

    /// Drop the session and remove any partial file.
    pub async fn abort(mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort().await;
        }
        if let Some(path) = self.path.take() {
            remove_partial(&path).await;
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove partial clip {:?}: {}", path, e);
        }
    }
}
