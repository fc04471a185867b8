// 监控事件广播
//
// 各路视频流的访问、录像、告警与重连事件通过广播通道推送给订阅者（CLI、测试）。

use common::{Clip, VisitSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// 视频流停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// 视频源正常结束
    EndOfStream,
    /// 收到停止信号
    Shutdown,
}

/// 监控事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MonitorEvent {
    /// 视频流已打开，监控循环开始
    StreamStarted { stream_id: String },
    /// 视频流启动失败
    StreamFailed { stream_id: String, reason: String },
    /// 访问开始
    VisitStarted {
        stream_id: String,
        visit_id: Uuid,
        start_time: f64,
    },
    /// 访问结束
    VisitEnded { visit: VisitSummary },
    /// 时长为零的强制结束访问被丢弃
    VisitDiscarded { stream_id: String, visit_id: Uuid },
    /// 录像已保存
    ClipSaved {
        stream_id: String,
        visit_id: Uuid,
        clip: Clip,
    },
    /// 录像失败
    ClipFailed {
        stream_id: String,
        visit_id: Uuid,
        reason: String,
    },
    /// 告警已发送
    AlertSent {
        stream_id: String,
        visit_id: Uuid,
        attached: bool,
        truncated: bool,
    },
    /// 告警发送失败
    AlertFailed {
        stream_id: String,
        visit_id: Uuid,
        reason: String,
    },
    /// 重连成功
    Reconnected { stream_id: String, attempt: u32 },
    /// 重连失败
    ReconnectFailed {
        stream_id: String,
        attempt: u32,
        reason: String,
    },
    /// 监控循环退出
    StreamEnded { stream_id: String, reason: StopReason },
}

impl MonitorEvent {
    /// 事件所属的视频流
    pub fn stream_id(&self) -> &str {
        match self {
            MonitorEvent::StreamStarted { stream_id }
            | MonitorEvent::StreamFailed { stream_id, .. }
            | MonitorEvent::VisitStarted { stream_id, .. }
            | MonitorEvent::VisitDiscarded { stream_id, .. }
            | MonitorEvent::ClipSaved { stream_id, .. }
            | MonitorEvent::ClipFailed { stream_id, .. }
            | MonitorEvent::AlertSent { stream_id, .. }
            | MonitorEvent::AlertFailed { stream_id, .. }
            | MonitorEvent::Reconnected { stream_id, .. }
            | MonitorEvent::ReconnectFailed { stream_id, .. }
            | MonitorEvent::StreamEnded { stream_id, .. } => stream_id,
            MonitorEvent::VisitEnded { visit } => &visit.stream_id,
        }
    }
}

/// 事件总线
///
/// 无订阅者时事件直接丢弃，不影响监控循环。
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    /// # 参数
    ///
    /// - `capacity`: 广播通道容量，慢订阅者超出后会丢失最旧的事件
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn with_defaults() -> Self {
        Self::new(1024)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish(&self, event: MonitorEvent) {
        match self.tx.send(event) {
            Ok(count) => trace!("Published monitor event to {} subscribers", count),
            Err(_) => trace!("Monitor event dropped: no subscribers"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}
