// 视频流监控循环
//
// 每路视频流一个监控任务：读帧 → (采样)检测 → 访问状态机 → 录像/告警。
// 录像与告警由同一路流专属的访问处理任务串行执行，监控循环继续读帧。

use crate::config::AppConfig;
use crate::detector::{DetectionSampler, Detector};
use crate::events::{EventBus, MonitorEvent, StopReason};
use crate::notifier::Notifier;
use crate::reader::StreamReader;
use crate::recorder::{ClipRecorder, ClipSession};
use crate::tracker::{TrackerSettings, VisitEvent, VisitTracker};
use common::{AlertMessage, Clip, ClipError, ExitReason, Frame, StreamError, VisitResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 访问处理队列深度（以指令计，每个分片最多 `chunk_frames` 帧）；
/// 处理任务跟不上时监控循环会等待，积压帧数不超过约两个分片
const VISIT_QUEUE_DEPTH: usize = 2;

// ============================================================================
// 状态快照
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Starting,
    Idle,
    Visiting,
    Reconnecting,
    Ended,
    Stopped,
    Failed,
}

/// 单路视频流的运行状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub state: StreamState,
    pub frames_read: u64,
    pub detections: u64,
    pub visits_completed: u64,
    pub clips_saved: u64,
    pub alerts_sent: u64,
    pub reconnects: u32,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

impl StreamStatus {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            state: StreamState::Starting,
            frames_read: 0,
            detections: 0,
            visits_completed: 0,
            clips_saved: 0,
            alerts_sent: 0,
            reconnects: 0,
            consecutive_errors: 0,
            last_error: None,
        }
    }
}

pub type StatusRegistry = Arc<DashMap<String, StreamStatus>>;

fn update_status(registry: &StatusRegistry, stream_id: &str, f: impl FnOnce(&mut StreamStatus)) {
    if let Some(mut entry) = registry.get_mut(stream_id) {
        f(entry.value_mut());
    }
}

// ============================================================================
// 错误计数与重连策略
// ============================================================================

/// 连续读帧失败计数器
#[derive(Debug, Clone)]
pub struct ErrorCounter {
    count: u32,
    max: u32,
}

impl ErrorCounter {
    pub fn new(max: u32) -> Self {
        Self {
            count: 0,
            max: max.max(1),
        }
    }

    /// 记录一次失败，达到上限时返回true
    pub fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count >= self.max
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

/// 重连失败后的退避策略
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl ReconnectPolicy {
    pub fn new(backoff_max: Duration) -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max,
        }
    }

    /// 计算退避时间
    ///
    /// # 参数
    ///
    /// - `failures`: 连续重连失败次数（从1开始）
    pub fn calculate_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(failures - 1);
        self.backoff_base
            .saturating_mul(multiplier)
            .min(self.backoff_max)
    }
}

// ============================================================================
// 监控参数
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub tracker: TrackerSettings,
    pub detection_interval: Duration,
    pub max_consecutive_errors: u32,
    pub reconnect: ReconnectPolicy,
    pub flush_on_disconnect: bool,
}

impl SupervisorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            tracker: TrackerSettings::new(
                config.engine.debounce,
                config.engine.alert_threshold,
                config.recording.chunk_frames,
            ),
            detection_interval: config.engine.detection_interval,
            max_consecutive_errors: config.engine.max_consecutive_errors,
            reconnect: ReconnectPolicy::new(config.engine.reconnect_delay_max),
            flush_on_disconnect: config.engine.flush_on_disconnect,
        }
    }
}

// ============================================================================
// 访问处理任务
// ============================================================================

/// 监控循环发给访问处理任务的指令，按访问顺序排列
#[derive(Debug)]
pub enum VisitCommand {
    Begin { visit_id: Uuid, start_time: f64 },
    Frames(Vec<Frame>),
    End(VisitResult),
    Discard { visit_id: Uuid },
}

/// 一路视频流的录像与告警处理
pub struct VisitHandler {
    stream_id: String,
    recorder: Option<ClipRecorder>,
    notifier: Arc<Notifier>,
    alert_threshold: f64,
    events: EventBus,
    status: StatusRegistry,
}

impl VisitHandler {
    pub fn new(
        stream_id: impl Into<String>,
        recorder: Option<ClipRecorder>,
        notifier: Arc<Notifier>,
        alert_threshold: Duration,
        events: EventBus,
        status: StatusRegistry,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            recorder,
            notifier,
            alert_threshold: alert_threshold.as_secs_f64(),
            events,
            status,
        }
    }

    pub async fn run(self, mut commands: mpsc::Receiver<VisitCommand>) {
        let mut session: Option<ClipSession> = None;
        let mut clip_error: Option<ClipError> = None;

        while let Some(command) = commands.recv().await {
            match command {
                VisitCommand::Begin {
                    visit_id,
                    start_time,
                } => {
                    if let Some(stale) = session.take() {
                        stale.abort().await;
                    }
                    clip_error = None;
                    session = self
                        .recorder
                        .as_ref()
                        .map(|r| r.start(self.stream_id.clone(), visit_id, start_time));
                }
                VisitCommand::Frames(frames) => {
                    self.append(&mut session, &mut clip_error, frames).await;
                }
                VisitCommand::End(mut visit) => {
                    let tail = mem::take(&mut visit.frames);
                    self.append(&mut session, &mut clip_error, tail).await;
                    let clip = self.finish_clip(session.take(), clip_error.take(), &visit).await;
                    self.alert(&visit, clip.as_ref()).await;
                }
                VisitCommand::Discard { visit_id } => {
                    debug!(stream_id = %self.stream_id, %visit_id, "Discarding visit recording");
                    if let Some(stale) = session.take() {
                        stale.abort().await;
                    }
                    clip_error = None;
                }
            }
        }

        if let Some(stale) = session.take() {
            stale.abort().await;
        }
    }

    async fn append(
        &self,
        session: &mut Option<ClipSession>,
        clip_error: &mut Option<ClipError>,
        frames: Vec<Frame>,
    ) {
        if clip_error.is_some() || frames.is_empty() {
            return;
        }
        let Some(active) = session.as_mut() else {
            return;
        };

        if let Err(e) = active.append(frames).await {
            warn!(stream_id = %self.stream_id, visit_id = %active.visit_id(), "Clip recording failed: {}", e);
            if let Some(failed) = session.take() {
                failed.abort().await;
            }
            *clip_error = Some(e);
        }
    }

    async fn finish_clip(
        &self,
        session: Option<ClipSession>,
        clip_error: Option<ClipError>,
        visit: &VisitResult,
    ) -> Option<Clip> {
        let outcome = match (clip_error, session) {
            (Some(e), _) => Err(e),
            (None, Some(session)) => session.finish().await,
            (None, None) => return None,
        };

        match outcome {
            Ok(clip) => {
                update_status(&self.status, &self.stream_id, |s| s.clips_saved += 1);
                self.events.publish(MonitorEvent::ClipSaved {
                    stream_id: self.stream_id.clone(),
                    visit_id: visit.visit_id,
                    clip: clip.clone(),
                });
                Some(clip)
            }
            Err(ClipError::EmptyVisit) => {
                debug!(stream_id = %self.stream_id, visit_id = %visit.visit_id, "Visit had no frames, no clip written");
                None
            }
            Err(e) => {
                error!(stream_id = %self.stream_id, visit_id = %visit.visit_id, "❌ Clip not saved: {}", e);
                self.events.publish(MonitorEvent::ClipFailed {
                    stream_id: self.stream_id.clone(),
                    visit_id: visit.visit_id,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    async fn alert(&self, visit: &VisitResult, clip: Option<&Clip>) {
        let Some(alert) = AlertMessage::for_visit(visit, self.alert_threshold, clip) else {
            return;
        };

        match self.notifier.deliver(&alert).await {
            Ok(report) => {
                update_status(&self.status, &self.stream_id, |s| s.alerts_sent += 1);
                self.events.publish(MonitorEvent::AlertSent {
                    stream_id: self.stream_id.clone(),
                    visit_id: visit.visit_id,
                    attached: report.attached,
                    truncated: report.truncated,
                });
            }
            Err(e) => {
                error!(stream_id = %self.stream_id, visit_id = %visit.visit_id, "❌ Alert delivery failed: {}", e);
                self.events.publish(MonitorEvent::AlertFailed {
                    stream_id: self.stream_id.clone(),
                    visit_id: visit.visit_id,
                    reason: e.to_string(),
                });
            }
        }
    }
}

// ============================================================================
// 监控循环
// ============================================================================

/// 监控循环退出时的汇总
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorReport {
    pub stream_id: String,
    pub reason: StopReason,
    pub frames_read: u64,
    pub visits_completed: u64,
    pub reconnects: u32,
}

pub struct StreamSupervisor {
    stream_id: String,
    reader: Box<dyn StreamReader>,
    detector: Arc<dyn Detector>,
    handler: Option<VisitHandler>,
    tracker: VisitTracker,
    sampler: DetectionSampler,
    errors: ErrorCounter,
    settings: SupervisorSettings,
    events: EventBus,
    status: StatusRegistry,
    frames_read: u64,
    visits_completed: u64,
    reconnects: u32,
    failed_reconnects: u32,
}

impl StreamSupervisor {
    pub fn new(
        stream_id: impl Into<String>,
        reader: Box<dyn StreamReader>,
        detector: Arc<dyn Detector>,
        handler: VisitHandler,
        settings: SupervisorSettings,
        events: EventBus,
        status: StatusRegistry,
    ) -> Self {
        let stream_id = stream_id.into();
        status
            .entry(stream_id.clone())
            .or_insert_with(|| StreamStatus::new(stream_id.clone()));

        Self {
            tracker: VisitTracker::new(stream_id.clone(), settings.tracker),
            sampler: DetectionSampler::new(settings.detection_interval),
            errors: ErrorCounter::new(settings.max_consecutive_errors),
            stream_id,
            reader,
            detector,
            handler: Some(handler),
            settings,
            events,
            status,
            frames_read: 0,
            visits_completed: 0,
            reconnects: 0,
            failed_reconnects: 0,
        }
    }

    /// 运行监控循环，直到流结束或收到停止信号
    pub async fn run(mut self, cancel: CancellationToken) -> SupervisorReport {
        let (tx, rx) = mpsc::channel(VISIT_QUEUE_DEPTH);
        let handler = self.handler.take().map(|h| tokio::spawn(h.run(rx)));

        self.set_state(StreamState::Idle);
        info!(stream_id = %self.stream_id, "🚀 Monitoring started");

        let reason = self.drive(&tx, &cancel).await;

        self.reader.release().await;
        drop(tx);
        if let Some(handle) = handler {
            if let Err(e) = handle.await {
                error!(stream_id = %self.stream_id, "Visit handler panicked: {}", e);
            }
        }

        self.set_state(match reason {
            StopReason::EndOfStream => StreamState::Ended,
            StopReason::Shutdown => StreamState::Stopped,
        });
        self.events.publish(MonitorEvent::StreamEnded {
            stream_id: self.stream_id.clone(),
            reason,
        });
        info!(
            stream_id = %self.stream_id,
            "Monitoring stopped ({:?}): {} frames, {} visits, {} reconnects",
            reason,
            self.frames_read,
            self.visits_completed,
            self.reconnects
        );

        SupervisorReport {
            stream_id: self.stream_id.clone(),
            reason,
            frames_read: self.frames_read,
            visits_completed: self.visits_completed,
            reconnects: self.reconnects,
        }
    }

    async fn drive(
        &mut self,
        tx: &mpsc::Sender<VisitCommand>,
        cancel: &CancellationToken,
    ) -> StopReason {
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                read = self.reader.read() => Some(read),
            };

            let Some(read) = read else {
                self.flush(ExitReason::Shutdown, tx).await;
                return StopReason::Shutdown;
            };

            match read {
                Ok(Some(frame)) => self.on_frame(frame, tx).await,
                Ok(None) => {
                    info!(stream_id = %self.stream_id, "Stream reached its end");
                    self.flush(ExitReason::EndOfStream, tx).await;
                    return StopReason::EndOfStream;
                }
                Err(e) => {
                    if !self.on_read_error(e, tx, cancel).await {
                        self.flush(ExitReason::Shutdown, tx).await;
                        return StopReason::Shutdown;
                    }
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame, tx: &mpsc::Sender<VisitCommand>) {
        self.errors.reset();
        self.failed_reconnects = 0;
        self.frames_read += 1;

        let now = frame.captured_at;
        let sampled = self.sampler.should_detect(now, self.tracker.is_active());
        if sampled {
            self.sampler.mark(now);
            let detected = match self.detector.detect(&frame).await {
                Ok(detection) => detection.detected,
                Err(e) => {
                    warn!(stream_id = %self.stream_id, "Detection failed, treating as absent: {}", e);
                    false
                }
            };

            let event = self.tracker.observe(now, detected);
            self.dispatch(event, tx).await;
        }

        update_status(&self.status, &self.stream_id, |s| {
            s.frames_read += 1;
            s.consecutive_errors = 0;
            if sampled {
                s.detections += 1;
            }
        });

        if let Some(chunk) = self.tracker.capture(frame) {
            send(tx, &self.stream_id, VisitCommand::Frames(chunk)).await;
        }
    }

    async fn dispatch(&mut self, event: VisitEvent, tx: &mpsc::Sender<VisitCommand>) {
        match event {
            VisitEvent::None => {}
            VisitEvent::Started {
                visit_id,
                start_time,
            } => {
                self.set_state(StreamState::Visiting);
                self.events.publish(MonitorEvent::VisitStarted {
                    stream_id: self.stream_id.clone(),
                    visit_id,
                    start_time,
                });
                send(
                    tx,
                    &self.stream_id,
                    VisitCommand::Begin {
                        visit_id,
                        start_time,
                    },
                )
                .await;
            }
            VisitEvent::Ended(visit) => {
                self.visits_completed += 1;
                update_status(&self.status, &self.stream_id, |s| {
                    s.visits_completed += 1;
                    s.state = StreamState::Idle;
                });
                self.events.publish(MonitorEvent::VisitEnded {
                    visit: visit.summary(),
                });
                send(tx, &self.stream_id, VisitCommand::End(visit)).await;
            }
            VisitEvent::Discarded { visit_id } => {
                self.set_state(StreamState::Idle);
                self.events.publish(MonitorEvent::VisitDiscarded {
                    stream_id: self.stream_id.clone(),
                    visit_id,
                });
                send(tx, &self.stream_id, VisitCommand::Discard { visit_id }).await;
            }
        }
    }

    /// 处理读帧失败；返回false表示退避期间收到停止信号
    async fn on_read_error(
        &mut self,
        err: StreamError,
        tx: &mpsc::Sender<VisitCommand>,
        cancel: &CancellationToken,
    ) -> bool {
        let limit_reached = self.errors.record_failure();
        warn!(
            stream_id = %self.stream_id,
            "⚠️ Read failed ({}/{}): {}",
            self.errors.count(),
            self.errors.max(),
            err
        );

        let count = self.errors.count();
        update_status(&self.status, &self.stream_id, |s| {
            s.consecutive_errors = count;
            s.last_error = Some(err.to_string());
        });

        if !limit_reached {
            return true;
        }

        self.set_state(StreamState::Reconnecting);
        info!(stream_id = %self.stream_id, "🔄 Reconnecting after {} consecutive errors", count);

        let outcome = self.reader.reconnect().await;
        self.errors.reset();
        self.reconnects += 1;
        let attempt = self.reconnects;
        let active = self.tracker.is_active();
        update_status(&self.status, &self.stream_id, |s| {
            s.consecutive_errors = 0;
            s.reconnects = attempt;
            s.state = if active {
                StreamState::Visiting
            } else {
                StreamState::Idle
            };
        });

        match outcome {
            Ok(()) => {
                self.failed_reconnects = 0;
                info!(stream_id = %self.stream_id, "✓ Reconnected (attempt {})", attempt);
                self.events.publish(MonitorEvent::Reconnected {
                    stream_id: self.stream_id.clone(),
                    attempt,
                });
                true
            }
            Err(e) => {
                self.failed_reconnects += 1;
                error!(stream_id = %self.stream_id, "❌ Reconnect failed (attempt {}): {}", attempt, e);
                self.events.publish(MonitorEvent::ReconnectFailed {
                    stream_id: self.stream_id.clone(),
                    attempt,
                    reason: e.to_string(),
                });

                if self.settings.flush_on_disconnect {
                    self.flush(ExitReason::Disconnected, tx).await;
                }

                let delay = self.settings.reconnect.calculate_delay(self.failed_reconnects);
                if delay.is_zero() {
                    return true;
                }
                debug!(stream_id = %self.stream_id, "Backing off for {:?}", delay);
                tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            }
        }
    }

    /// 强制结束进行中的访问
    ///
    /// 开启 `flush_on_disconnect` 时以最后一帧时间结束访问并照常录像/告警；
    /// 关闭时流结束或停止会丢弃访问，断线则保留访问等待恢复。
    async fn flush(&mut self, reason: ExitReason, tx: &mpsc::Sender<VisitCommand>) {
        if !self.tracker.is_active() {
            return;
        }

        if self.settings.flush_on_disconnect {
            let event = self.tracker.force_exit(reason);
            self.dispatch(event, tx).await;
            return;
        }

        if reason == ExitReason::Disconnected {
            return;
        }

        if let Some(visit_id) = self.tracker.abandon() {
            warn!(stream_id = %self.stream_id, %visit_id, "Dropping in-progress visit on {:?}", reason);
            self.set_state(StreamState::Idle);
            self.events.publish(MonitorEvent::VisitDiscarded {
                stream_id: self.stream_id.clone(),
                visit_id,
            });
            send(tx, &self.stream_id, VisitCommand::Discard { visit_id }).await;
        }
    }

    fn set_state(&self, state: StreamState) {
        update_status(&self.status, &self.stream_id, |s| s.state = state);
    }
}

async fn send(tx: &mpsc::Sender<VisitCommand>, stream_id: &str, command: VisitCommand) {
    if tx.send(command).await.is_err() {
        error!(stream_id = %stream_id, "Visit handler stopped, command dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_counter_reaches_limit() {
        let mut counter = ErrorCounter::new(3);
        assert!(!counter.record_failure());
        assert!(!counter.record_failure());
        assert!(counter.record_failure());
        assert_eq!(counter.count(), 3);
        counter.reset();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn test_error_counter_zero_max_is_one() {
        let mut counter = ErrorCounter::new(0);
        assert!(counter.record_failure());
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let policy = ReconnectPolicy::new(Duration::from_secs(10));
        assert_eq!(policy.calculate_delay(0), Duration::ZERO);
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(4), Duration::from_secs(8));
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(10));
        assert_eq!(policy.calculate_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_cap_disables_backoff() {
        let policy = ReconnectPolicy::new(Duration::ZERO);
        assert!(policy.calculate_delay(3).is_zero());
    }

    #[test]
    fn test_settings_from_config() {
        let config = AppConfig::default();
        let settings = SupervisorSettings::from_config(&config);
        assert_eq!(settings.tracker.debounce, Duration::from_secs(4));
        assert_eq!(settings.tracker.chunk_frames, 150);
        assert_eq!(settings.max_consecutive_errors, 5);
        assert!(settings.flush_on_disconnect);
    }

    #[test]
    fn test_visit_queue_backlog_is_two_chunks() {
        // 默认150帧分片，编码停滞时最多积压300帧
        let settings = SupervisorSettings::from_config(&AppConfig::default());
        assert_eq!(VISIT_QUEUE_DEPTH * settings.tracker.chunk_frames, 300);
    }
}
