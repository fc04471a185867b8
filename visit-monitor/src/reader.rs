// 视频流读取模块
//
// 通过ffmpeg子进程把摄像头/RTSP/文件源解码为BGR24原始帧，逐帧读取。

use crate::config::StreamConfig;
use async_trait::async_trait;
use bytes::Bytes;
use common::{now_secs, Frame, StreamError};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// 视频源工厂：按配置打开一路视频流
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(&self, config: &StreamConfig) -> Result<Box<dyn StreamReader>, StreamError>;
}

/// 单路视频流读取器
///
/// - `Ok(Some(frame))`: 成功读取一帧
/// - `Ok(None)`: 流已结束
/// - `Err(error)`: 暂时性读取错误
#[async_trait]
pub trait StreamReader: Send {
    async fn read(&mut self) -> Result<Option<Frame>, StreamError>;

    /// 释放旧句柄并重新打开视频源
    async fn reconnect(&mut self) -> Result<(), StreamError>;

    /// 释放句柄
    async fn release(&mut self);
}

/// 基于ffmpeg的视频源
pub struct FfmpegStreamSource {
    ffmpeg_path: String,
    open_timeout: Duration,
}

impl FfmpegStreamSource {
    pub fn new(open_timeout: Duration) -> Self {
        Self::with_path(open_timeout, "ffmpeg")
    }

    pub fn with_path(open_timeout: Duration, ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            open_timeout,
        }
    }
}

#[async_trait]
impl StreamSource for FfmpegStreamSource {
    async fn open(&self, config: &StreamConfig) -> Result<Box<dyn StreamReader>, StreamError> {
        let mut reader =
            FfmpegStreamReader::new(config.clone(), self.ffmpeg_path.clone(), self.open_timeout);
        reader.start().await?;

        info!(
            stream_id = %config.id,
            "✓ Stream opened: {} ({}x{})",
            config.source,
            config.width,
            config.height
        );
        Ok(Box::new(reader))
    }
}

/// ffmpeg子进程读取器
pub struct FfmpegStreamReader {
    config: StreamConfig,
    ffmpeg_path: String,
    open_timeout: Duration,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    pending: Option<Frame>,
    sequence: u64,
    frame_len: usize,
}

impl FfmpegStreamReader {
    pub fn new(config: StreamConfig, ffmpeg_path: impl Into<String>, open_timeout: Duration) -> Self {
        let frame_len = Frame::expected_len(config.width, config.height);
        Self {
            config,
            ffmpeg_path: ffmpeg_path.into(),
            open_timeout,
            child: None,
            stdout: None,
            pending: None,
            sequence: 0,
            frame_len,
        }
    }

    /// 构建ffmpeg参数
    ///
    /// 纯数字视频源视为本地采集设备序号（v4l2），RTSP源强制TCP传输。
    pub fn build_args(config: &StreamConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            // 关闭输入缓冲，重连后从最新画面开始
            "-fflags".into(),
            "nobuffer".into(),
            "-flags".into(),
            "low_delay".into(),
        ];

        let source = config.source.trim();
        if !source.is_empty() && source.chars().all(|c| c.is_ascii_digit()) {
            args.extend(["-f".into(), "v4l2".into(), "-i".into(), format!("/dev/video{}", source)]);
        } else if source.starts_with("rtsp://") {
            args.extend([
                "-rtsp_transport".into(),
                "tcp".into(),
                "-i".into(),
                source.to_string(),
            ]);
        } else {
            args.extend(["-i".into(), source.to_string()]);
        }

        args.extend(["-an".into(), "-vf".into(), format!("scale={}:{}", config.width, config.height)]);
        if let Some(fps) = config.capture_fps {
            args.extend(["-r".into(), fps.to_string()]);
        }
        args.extend([
            "-pix_fmt".into(),
            "bgr24".into(),
            "-f".into(),
            "rawvideo".into(),
            "-".into(),
        ]);
        args
    }

    /// 本地采集设备与网络流没有“正常结束”，ffmpeg退出一律视为断线
    pub fn is_live_source(source: &str) -> bool {
        let source = source.trim();
        (!source.is_empty() && source.chars().all(|c| c.is_ascii_digit()))
            || source.starts_with("rtsp://")
            || source.starts_with("rtmp://")
    }

    /// 启动ffmpeg并在超时内读取首帧，首帧留待下一次 `read()` 返回
    async fn start(&mut self) -> Result<(), StreamError> {
        self.spawn()?;

        let first = match tokio::time::timeout(self.open_timeout, self.read_raw()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                self.release().await;
                return Err(StreamError::OpenFailed {
                    source_desc: self.config.source.clone(),
                    reason: "stream ended before the first frame".to_string(),
                });
            }
            Ok(Err(e)) => {
                self.release().await;
                return Err(StreamError::OpenFailed {
                    source_desc: self.config.source.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.release().await;
                return Err(StreamError::OpenTimeout {
                    duration: self.open_timeout,
                });
            }
        };

        self.pending = Some(first);
        Ok(())
    }

    fn spawn(&mut self) -> Result<(), StreamError> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(Self::build_args(&self.config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(stream_id = %self.config.id, "Starting ffmpeg: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| StreamError::OpenFailed {
            source_desc: self.config.source.clone(),
            reason: format!("Failed to start ffmpeg: {}", e),
        })?;

        self.stdout = child.stdout.take();

        // 转发ffmpeg错误输出
        if let Some(stderr) = child.stderr.take() {
            let stream_id = self.config.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(stream_id = %stream_id, "ffmpeg: {}", line);
                }
            });
        }

        self.child = Some(child);
        Ok(())
    }

    async fn read_raw(&mut self) -> Result<Option<Frame>, StreamError> {
        let stdout = self.stdout.as_mut().ok_or(StreamError::NotConnected)?;

        let mut buffer = vec![0u8; self.frame_len];
        let mut filled = 0;
        while filled < self.frame_len {
            let n = stdout.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return self.classify_eof().await;
        }

        if filled < self.frame_len {
            return Err(StreamError::ReadFailed {
                reason: format!("truncated frame: {} of {} bytes", filled, self.frame_len),
            });
        }

        let frame = Frame::new(
            self.sequence,
            now_secs(),
            self.config.width,
            self.config.height,
            Bytes::from(buffer),
        );
        self.sequence += 1;
        Ok(Some(frame))
    }

    /// 文件源的ffmpeg正常退出视为流结束，其余情况为读取错误
    async fn classify_eof(&mut self) -> Result<Option<Frame>, StreamError> {
        let live = Self::is_live_source(&self.config.source);
        let Some(child) = self.child.as_mut() else {
            return Err(StreamError::NotConnected);
        };

        match child.wait().await {
            Ok(status) if status.success() && !live => {
                self.stdout = None;
                Ok(None)
            }
            Ok(status) => {
                self.stdout = None;
                Err(StreamError::ReadFailed {
                    reason: format!("ffmpeg exited with {}", status),
                })
            }
            Err(e) => Err(StreamError::Io(e)),
        }
    }
}

#[async_trait]
impl StreamReader for FfmpegStreamReader {
    async fn read(&mut self) -> Result<Option<Frame>, StreamError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.read_raw().await
    }

    async fn reconnect(&mut self) -> Result<(), StreamError> {
        self.release().await;
        self.start().await.map_err(|e| StreamError::ReconnectFailed {
            reason: e.to_string(),
        })?;
        info!(stream_id = %self.config.id, "✓ Stream reopened: {}", self.config.source);
        Ok(())
    }

    async fn release(&mut self) {
        self.stdout = None;
        self.pending = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(stream_id = %self.config.id, "ffmpeg already stopped: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(source: &str) -> StreamConfig {
        StreamConfig {
            id: "cam".to_string(),
            source: source.to_string(),
            width: 320,
            height: 240,
            capture_fps: Some(15),
        }
    }

    #[test]
    fn test_device_index_uses_v4l2() {
        let args = FfmpegStreamReader::build_args(&config("0"));
        let joined = args.join(" ");
        assert!(joined.contains("-f v4l2 -i /dev/video0"));
        assert!(joined.contains("scale=320:240"));
        assert!(joined.contains("-r 15"));
        assert!(joined.ends_with("-pix_fmt bgr24 -f rawvideo -"));
    }

    #[test]
    fn test_rtsp_uses_tcp() {
        let args = FfmpegStreamReader::build_args(&config("rtsp://10.0.0.5/live"));
        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp -i rtsp://10.0.0.5/live"));
        assert!(joined.contains("-fflags nobuffer"));
    }

    #[test]
    fn test_file_source_passthrough() {
        let args = FfmpegStreamReader::build_args(&config("/srv/litterbox.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/srv/litterbox.mp4"));
        assert!(!args.iter().any(|a| a == "v4l2"));
    }

    #[test]
    fn test_live_sources() {
        assert!(FfmpegStreamReader::is_live_source("0"));
        assert!(FfmpegStreamReader::is_live_source("rtsp://10.0.0.5/live"));
        assert!(!FfmpegStreamReader::is_live_source("/srv/litterbox.mp4"));
        assert!(!FfmpegStreamReader::is_live_source(""));
    }

    fn tiny(source: &str) -> StreamConfig {
        StreamConfig {
            id: "cam".to_string(),
            source: source.to_string(),
            width: 2,
            height: 2,
            capture_fps: None,
        }
    }

    #[tokio::test]
    async fn test_read_without_process_is_not_connected() {
        let mut reader = FfmpegStreamReader::new(config("0"), "ffmpeg", Duration::from_secs(1));
        let result = reader.read().await;
        assert!(matches!(result, Err(StreamError::NotConnected)));
    }

    #[tokio::test]
    async fn test_open_fails_when_ffmpeg_exits() {
        let source = FfmpegStreamSource::with_path(Duration::from_secs(5), "false");
        let result = source.open(&tiny("rtsp://10.0.0.5/live")).await;
        assert!(matches!(result, Err(StreamError::OpenFailed { .. })));
    }

    #[tokio::test]
    async fn test_reconnect_fails_when_source_does_not_reopen() {
        let mut reader = FfmpegStreamReader::new(tiny("rtsp://10.0.0.5/live"), "false", Duration::from_secs(5));

        let result = reader.reconnect().await;
        assert!(matches!(result, Err(StreamError::ReconnectFailed { .. })));
        // 失败后句柄已释放
        assert!(matches!(reader.read().await, Err(StreamError::NotConnected)));
    }

    #[tokio::test]
    async fn test_reconnect_succeeds_once_a_frame_arrives() {
        // echo忽略参数含义，输出的字节足够组成一帧2x2画面
        let mut reader = FfmpegStreamReader::new(tiny("rtsp://10.0.0.5/live"), "echo", Duration::from_secs(5));

        reader.reconnect().await.unwrap();
        let frame = reader.read().await.unwrap().expect("first frame");
        assert_eq!(frame.sequence, 0);
        assert_eq!(frame.data.len(), Frame::expected_len(2, 2));
        reader.release().await;
    }

    #[tokio::test]
    async fn test_live_source_exit_is_a_read_error() {
        let mut reader = FfmpegStreamReader::new(tiny("rtsp://10.0.0.5/live"), "true", Duration::from_secs(5));
        reader.spawn().unwrap();

        let result = reader.read().await;
        assert!(matches!(result, Err(StreamError::ReadFailed { .. })));
    }

    #[tokio::test]
    async fn test_file_source_exit_is_end_of_stream() {
        let mut reader = FfmpegStreamReader::new(tiny("/srv/litterbox.mp4"), "true", Duration::from_secs(5));
        reader.spawn().unwrap();

        assert!(reader.read().await.unwrap().is_none());
    }
}
