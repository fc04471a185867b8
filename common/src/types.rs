use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// 当前墙钟时间（秒，UNIX纪元起）
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// 一帧解码后的画面
///
/// `data` 为 `width * height * 3` 字节的 BGR24 像素，`captured_at` 为采集时刻（秒）。
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub captured_at: f64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(sequence: u64, captured_at: f64, width: u32, height: u32, data: Bytes) -> Self {
        Self {
            sequence,
            captured_at,
            width,
            height,
            data,
        }
    }

    /// BGR24 帧的期望字节数
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }
}

/// 检测框（像素坐标，左上/右下）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// 单帧检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub detected: bool,
    pub bbox: Option<BoundingBox>,
    pub confidence: Option<f32>,
}

impl Detection {
    pub fn absent() -> Self {
        Self {
            detected: false,
            bbox: None,
            confidence: None,
        }
    }

    pub fn present(bbox: Option<BoundingBox>, confidence: Option<f32>) -> Self {
        Self {
            detected: true,
            bbox,
            confidence,
        }
    }
}

/// 访问结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// 去抖窗口超时，正常离开
    Debounce,
    /// 视频流正常结束
    EndOfStream,
    /// 引擎停止
    Shutdown,
    /// 重连失败，流已断开
    Disconnected,
}

impl ExitReason {
    /// 是否为强制结束（非去抖判定）
    pub fn is_forced(&self) -> bool {
        !matches!(self, ExitReason::Debounce)
    }
}

/// 一次完整访问的结果
///
/// `frames` 只包含尚未交给录像任务的尾部帧，`frame_count` 为整个访问期间采集的帧数。
#[derive(Debug, Clone)]
pub struct VisitResult {
    pub visit_id: Uuid,
    pub stream_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub frames: Vec<Frame>,
    pub frame_count: usize,
    pub exceeds_threshold: bool,
    pub exit_reason: ExitReason,
}

impl VisitResult {
    /// 构造访问结果；`exceeds_threshold` 采用严格不等式 `duration > threshold`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        visit_id: Uuid,
        stream_id: impl Into<String>,
        start_time: f64,
        end_time: f64,
        frames: Vec<Frame>,
        frame_count: usize,
        threshold_secs: f64,
        exit_reason: ExitReason,
    ) -> Self {
        let duration = end_time - start_time;
        Self {
            visit_id,
            stream_id: stream_id.into(),
            start_time,
            end_time,
            duration,
            frames,
            frame_count,
            exceeds_threshold: duration > threshold_secs,
            exit_reason,
        }
    }

    /// 不含帧数据的摘要，用于事件广播
    pub fn summary(&self) -> VisitSummary {
        VisitSummary {
            visit_id: self.visit_id,
            stream_id: self.stream_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            duration: self.duration,
            frame_count: self.frame_count,
            exceeds_threshold: self.exceeds_threshold,
            exit_reason: self.exit_reason,
        }
    }

    /// 访问开始时刻的本地时间戳，用于录像文件命名
    pub fn visit_timestamp(&self) -> String {
        visit_timestamp(self.start_time)
    }
}

/// 将秒级时间戳格式化为 `YYYYmmdd_HHMMSS`（本地时区）
pub fn visit_timestamp(secs: f64) -> String {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
        .map(|utc| utc.with_timezone(&Local).format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| format!("{:.0}", secs))
}

/// 访问摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitSummary {
    pub visit_id: Uuid,
    pub stream_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub frame_count: usize,
    pub exceeds_threshold: bool,
    pub exit_reason: ExitReason,
}

/// 录像文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub frame_count: usize,
}

/// 告警消息，仅在访问超过阈值时构造
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub stream_id: String,
    pub visit_id: Uuid,
    pub text: String,
    pub clip_path: Option<PathBuf>,
}

impl AlertMessage {
    /// 为超时访问生成告警；未超过阈值时返回 `None`
    pub fn for_visit(visit: &VisitResult, threshold_secs: f64, clip: Option<&Clip>) -> Option<Self> {
        if !visit.exceeds_threshold {
            return None;
        }

        let mut text = format!(
            "⚠️ Alert: visit on {} lasted {:.1} seconds (threshold {:.1}s)",
            visit.stream_id, visit.duration, threshold_secs
        );
        if visit.exit_reason.is_forced() {
            text.push_str(&format!(" [ended early: {:?}]", visit.exit_reason));
        }

        Some(Self {
            stream_id: visit.stream_id.clone(),
            visit_id: visit.visit_id,
            text,
            clip_path: clip.map(|c| c.path.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit(start: f64, end: f64, threshold: f64) -> VisitResult {
        VisitResult::new(
            Uuid::new_v4(),
            "cam-a",
            start,
            end,
            Vec::new(),
            0,
            threshold,
            ExitReason::Debounce,
        )
    }

    #[test]
    fn test_duration_is_end_minus_start() {
        let v = visit(10.0, 62.0, 45.0);
        assert_eq!(v.duration, 52.0);
        assert!(v.exceeds_threshold);
    }

    #[test]
    fn test_threshold_equality_does_not_alert() {
        let v = visit(0.0, 45.0, 45.0);
        assert_eq!(v.duration, 45.0);
        assert!(!v.exceeds_threshold);
        assert!(AlertMessage::for_visit(&v, 45.0, None).is_none());
    }

    #[test]
    fn test_alert_message_carries_clip_path() {
        let v = visit(0.0, 52.0, 45.0);
        let clip = Clip {
            path: PathBuf::from("clips/cam-a/20240101_000000.mp4"),
            size_bytes: 1024,
            frame_count: 10,
        };

        let alert = AlertMessage::for_visit(&v, 45.0, Some(&clip)).unwrap();
        assert_eq!(alert.clip_path, Some(clip.path));
        assert!(alert.text.contains("52.0 seconds"));
        assert!(!alert.text.contains("ended early"));
    }

    #[test]
    fn test_forced_exit_is_marked_in_alert() {
        let mut v = visit(0.0, 60.0, 45.0);
        v.exit_reason = ExitReason::EndOfStream;

        let alert = AlertMessage::for_visit(&v, 45.0, None).unwrap();
        assert!(alert.text.contains("ended early"));
    }

    #[test]
    fn test_summary_serializes_without_frames() {
        let v = visit(1.0, 4.0, 45.0);
        let json = serde_json::to_string(&v.summary()).unwrap();
        assert!(json.contains("\"exit_reason\":\"debounce\""));
        assert!(!json.contains("frames\""));
    }

    #[test]
    fn test_visit_timestamp_format() {
        let stamp = visit_timestamp(1_700_000_000.25);
        assert_eq!(stamp.len(), 15);
        assert_eq!(&stamp[8..9], "_");
    }
}
