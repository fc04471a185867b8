#[cfg(test)]
mod tests {
    use crate::config::{AppConfig, RecordingConfig, StreamConfig};
    use crate::events::{EventBus, MonitorEvent, StopReason};
    use crate::mock::{FnDetector, MemoryClipEncoder, RecordingTransport, ScriptStep, ScriptedStreamSource};
    use crate::notifier::Notifier;
    use crate::reader::StreamSource;
    use crate::recorder::ClipRecorder;
    use crate::supervisor::{
        StatusRegistry, StreamState, StreamSupervisor, SupervisorReport, SupervisorSettings,
        VisitHandler,
    };
    use common::{DetectError, ExitReason, VisitSummary};
    use dashmap::DashMap;
    use proptest::prelude::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const STREAM: &str = "cam-a";
    const LIMIT: u64 = 8 * 1024 * 1024;

    fn settings(max_errors: u32, flush_on_disconnect: bool) -> SupervisorSettings {
        let mut config = AppConfig::default();
        config.engine.debounce = Duration::from_secs(2);
        config.engine.alert_threshold = Duration::from_secs(45);
        config.engine.detection_interval = Duration::from_secs(1);
        config.engine.max_consecutive_errors = max_errors;
        config.engine.reconnect_delay_max = Duration::ZERO;
        config.engine.flush_on_disconnect = flush_on_disconnect;
        config.recording.chunk_frames = 4;
        SupervisorSettings::from_config(&config)
    }

    struct Harness {
        source: ScriptedStreamSource,
        detector: Arc<FnDetector>,
        encoder: Arc<MemoryClipEncoder>,
        transport: Arc<RecordingTransport>,
        events: EventBus,
        status: StatusRegistry,
        settings: SupervisorSettings,
    }

    impl Harness {
        fn new(steps: Vec<ScriptStep>, detector: FnDetector) -> Self {
            Self {
                source: ScriptedStreamSource::new().with_script(STREAM, steps),
                detector: Arc::new(detector),
                encoder: Arc::new(MemoryClipEncoder::new()),
                transport: Arc::new(RecordingTransport::new()),
                events: EventBus::new(4096),
                status: Arc::new(DashMap::new()),
                settings: settings(5, true),
            }
        }

        async fn supervisor(&self, dir: &Path) -> StreamSupervisor {
            let reader = self
                .source
                .open(&StreamConfig::new(STREAM, "scripted"))
                .await
                .unwrap();
            let recording = RecordingConfig {
                output_dir: dir.to_path_buf(),
                ..RecordingConfig::default()
            };
            let handler = VisitHandler::new(
                STREAM,
                Some(ClipRecorder::new(self.encoder.clone(), &recording)),
                Arc::new(Notifier::new(self.transport.clone(), LIMIT)),
                self.settings.tracker.alert_threshold,
                self.events.clone(),
                self.status.clone(),
            );
            StreamSupervisor::new(
                STREAM,
                reader,
                self.detector.clone(),
                handler,
                self.settings,
                self.events.clone(),
                self.status.clone(),
            )
        }

        /// Run the stream to its end and collect what it published.
        async fn run(&self, dir: &Path) -> (SupervisorReport, Vec<MonitorEvent>) {
            let mut rx = self.events.subscribe();
            let supervisor = self.supervisor(dir).await;
            let report = supervisor.run(CancellationToken::new()).await;

            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            (report, events)
        }

        fn consecutive_errors(&self) -> u32 {
            self.status.get(STREAM).map(|s| s.consecutive_errors).unwrap_or(u32::MAX)
        }
    }

    fn ended_visits(events: &[MonitorEvent]) -> Vec<VisitSummary> {
        events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::VisitEnded { visit } => Some(visit.clone()),
                _ => None,
            })
            .collect()
    }

    fn errors(n: usize) -> Vec<ScriptStep> {
        vec![ScriptStep::Error; n]
    }

    fn never() -> FnDetector {
        FnDetector::by_time(|_| false)
    }

    #[tokio::test]
    async fn test_fewer_failures_than_limit_do_not_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = vec![ScriptStep::Frame(0.0)];
        steps.extend(errors(4));
        steps.extend([ScriptStep::Frame(1.0), ScriptStep::End]);

        let harness = Harness::new(steps, never());
        let (report, events) = harness.run(dir.path()).await;

        assert_eq!(harness.source.stats(STREAM).reconnects(), 0);
        assert_eq!(report.reconnects, 0);
        assert_eq!(report.frames_read, 2);
        assert_eq!(harness.consecutive_errors(), 0);
        assert!(!events.iter().any(|e| matches!(e, MonitorEvent::Reconnected { .. })));
    }

    #[tokio::test]
    async fn test_limit_triggers_exactly_one_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = errors(5);
        steps.extend([ScriptStep::Frame(0.0), ScriptStep::End]);

        let harness = Harness::new(steps, never());
        let (report, events) = harness.run(dir.path()).await;

        assert_eq!(harness.source.stats(STREAM).reconnects(), 1);
        assert_eq!(report.reconnects, 1);
        assert_eq!(harness.consecutive_errors(), 0);
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::Reconnected { attempt: 1, .. })));
    }

    #[tokio::test]
    async fn test_failed_reconnect_still_resets_counter() {
        let dir = tempfile::tempdir().unwrap();
        // 重连失败后计数归零：再失败4次不会触发第二次重连
        let mut steps = errors(5);
        steps.extend(errors(4));
        steps.push(ScriptStep::End);

        let mut harness = Harness::new(steps, never());
        harness.source = harness.source.with_reconnect_results(STREAM, vec![false]);
        let (_, events) = harness.run(dir.path()).await;

        assert_eq!(harness.source.stats(STREAM).reconnects(), 1);
        assert_eq!(harness.consecutive_errors(), 4);
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::ReconnectFailed { attempt: 1, .. })));
    }

    #[tokio::test]
    async fn test_repeated_failures_keep_reconnecting() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = errors(10);
        steps.push(ScriptStep::End);

        let mut harness = Harness::new(steps, never());
        harness.source = harness.source.with_reconnect_results(STREAM, vec![false, false]);
        let (report, _) = harness.run(dir.path()).await;

        assert_eq!(harness.source.stats(STREAM).reconnects(), 2);
        assert_eq!(report.reconnects, 2);
        assert_eq!(report.reason, StopReason::EndOfStream);
    }

    #[tokio::test]
    async fn test_idle_detection_rate_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = ScriptStep::frames(0.0, 10.0, 0.125);
        steps.push(ScriptStep::End);

        let harness = Harness::new(steps, never());
        let (report, _) = harness.run(dir.path()).await;

        assert_eq!(report.frames_read, 81);
        let times = harness.detector.call_times();
        assert_eq!(times.len(), 11);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= 1.0, "detections too close: {:?}", pair);
        }
    }

    #[tokio::test]
    async fn test_every_frame_recorded_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = ScriptStep::frames(0.0, 10.0, 0.25);
        steps.push(ScriptStep::End);

        // 2.0 起有猫，4.75 之后离开；6.75 去抖结束
        let harness = Harness::new(steps, FnDetector::by_time(|t| (2.0..5.0).contains(&t)));
        let (report, events) = harness.run(dir.path()).await;

        let visits = ended_visits(&events);
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].start_time, 2.0);
        assert_eq!(visits[0].end_time, 6.75);
        assert_eq!(visits[0].frame_count, 19);
        assert_eq!(report.visits_completed, 1);

        assert_eq!(harness.encoder.written_sequences(), (8..=26).collect::<Vec<u64>>());
        let clip = events
            .iter()
            .find_map(|e| match e {
                MonitorEvent::ClipSaved { clip, .. } => Some(clip.clone()),
                _ => None,
            })
            .expect("clip saved");
        assert_eq!(clip.frame_count, 19);
        assert!(clip.path.starts_with(dir.path().join(STREAM)));

        // 4.75秒未超过阈值，不告警
        assert!(harness.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_long_visit_alert_carries_clip() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = ScriptStep::frames(0.0, 60.0, 0.5);
        steps.push(ScriptStep::End);

        let harness = Harness::new(steps, FnDetector::by_time(|t| t <= 50.0));
        let (_, events) = harness.run(dir.path()).await;

        let visits = ended_visits(&events);
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].duration, 52.0);
        assert!(visits[0].exceeds_threshold);

        let sent = harness.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("52.0 seconds"));
        assert!(sent[0].attachment.is_some());
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::AlertSent { attached: true, .. })));
    }

    #[tokio::test]
    async fn test_encoding_failure_still_alerts_without_clip() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = ScriptStep::frames(0.0, 60.0, 0.5);
        steps.push(ScriptStep::End);

        let harness = Harness::new(steps, FnDetector::by_time(|t| t <= 50.0));
        harness.encoder.set_fail(true);
        let (_, events) = harness.run(dir.path()).await;

        assert!(events.iter().any(|e| matches!(e, MonitorEvent::ClipFailed { .. })));
        let sent = harness.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].attachment.is_none());
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = ScriptStep::frames(0.0, 60.0, 0.5);
        steps.push(ScriptStep::End);

        let harness = Harness::new(steps, FnDetector::by_time(|t| t <= 50.0));
        harness.transport.set_fail(true);
        let (report, events) = harness.run(dir.path()).await;

        assert_eq!(harness.transport.attempts(), 1);
        assert!(events.iter().any(|e| matches!(e, MonitorEvent::AlertFailed { .. })));
        assert_eq!(report.reason, StopReason::EndOfStream);
    }

    #[tokio::test]
    async fn test_end_of_stream_flushes_active_visit() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = ScriptStep::frames(0.0, 3.0, 0.5);
        steps.push(ScriptStep::End);

        let harness = Harness::new(steps, FnDetector::by_time(|_| true));
        let (report, events) = harness.run(dir.path()).await;

        let visits = ended_visits(&events);
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].exit_reason, ExitReason::EndOfStream);
        assert_eq!(visits[0].duration, 3.0);
        assert_eq!(visits[0].frame_count, 7);
        assert_eq!(report.reason, StopReason::EndOfStream);
        assert!(harness.source.stats(STREAM).released());
        assert!(matches!(
            events.last(),
            Some(MonitorEvent::StreamEnded {
                reason: StopReason::EndOfStream,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_end_of_stream_drops_visit_when_flush_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = ScriptStep::frames(0.0, 3.0, 0.5);
        steps.push(ScriptStep::End);

        let mut harness = Harness::new(steps, FnDetector::by_time(|_| true));
        harness.settings = settings(5, false);
        let (_, events) = harness.run(dir.path()).await;

        assert!(ended_visits(&events).is_empty());
        assert!(events.iter().any(|e| matches!(e, MonitorEvent::VisitDiscarded { .. })));
        assert!(harness.encoder.written_sequences().len() <= 4);

        let mut entries = tokio::fs::read_dir(dir.path().join(STREAM)).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_reconnect_flushes_visit_as_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = vec![ScriptStep::Frame(0.0), ScriptStep::Frame(1.0)];
        steps.extend(errors(5));
        steps.push(ScriptStep::End);

        let mut harness = Harness::new(steps, FnDetector::by_time(|_| true));
        harness.source = harness.source.with_reconnect_results(STREAM, vec![false]);
        let (_, events) = harness.run(dir.path()).await;

        let visits = ended_visits(&events);
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].exit_reason, ExitReason::Disconnected);
        assert_eq!(visits[0].duration, 1.0);
    }

    #[tokio::test]
    async fn test_visit_survives_outage_when_flush_disabled() {
        let dir = tempfile::tempdir().unwrap();
        // 第一次重连失败、第二次成功，访问在断线期间保持进行
        let mut steps = vec![ScriptStep::Frame(0.0), ScriptStep::Frame(1.0)];
        steps.extend(errors(5));
        steps.extend(errors(5));
        steps.extend(ScriptStep::frames(2.0, 6.0, 0.5));
        steps.push(ScriptStep::End);

        let mut harness = Harness::new(steps, FnDetector::by_time(|t| t <= 3.0));
        harness.settings = settings(5, false);
        harness.source = harness.source.with_reconnect_results(STREAM, vec![false, true]);
        let (report, events) = harness.run(dir.path()).await;

        assert_eq!(report.reconnects, 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::ReconnectFailed { attempt: 1, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::Reconnected { attempt: 2, .. })));
        assert!(!events.iter().any(|e| matches!(e, MonitorEvent::VisitDiscarded { .. })));

        let started = events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::VisitStarted { .. }))
            .count();
        assert_eq!(started, 1);

        let visits = ended_visits(&events);
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].exit_reason, ExitReason::Debounce);
        assert_eq!(visits[0].start_time, 0.0);
        assert_eq!(visits[0].end_time, 5.0);
    }

    #[tokio::test]
    async fn test_stop_discards_visit_when_flush_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = ScriptStep::frames(0.0, 2.5, 0.5);
        steps.push(ScriptStep::Hold);

        let mut harness = Harness::new(steps, FnDetector::by_time(|_| true));
        harness.settings = settings(5, false);
        let mut rx = harness.events.subscribe();
        let supervisor = harness.supervisor(dir.path()).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));

        let status = harness.status.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while status.get(STREAM).map(|s| s.frames_read).unwrap_or(0) < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frames processed");

        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("supervisor stopped")
            .unwrap();
        assert_eq!(report.reason, StopReason::Shutdown);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(ended_visits(&events).is_empty());
        assert!(events.iter().any(|e| matches!(e, MonitorEvent::VisitDiscarded { .. })));
        assert!(harness.transport.sent().is_empty());

        // 已写入一个分片，丢弃后不留下半成品文件
        assert_eq!(harness.encoder.written_sequences(), vec![0, 1, 2, 3]);
        let mut entries = tokio::fs::read_dir(dir.path().join(STREAM)).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_detection_errors_count_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut steps = ScriptStep::frames(0.0, 5.0, 0.5);
        steps.push(ScriptStep::End);

        let detector = FnDetector::new(|_| {
            Err(DetectError::RequestFailed {
                reason: "model offline".to_string(),
            })
        });
        let harness = Harness::new(steps, detector);
        let (report, events) = harness.run(dir.path()).await;

        assert_eq!(report.frames_read, 11);
        assert_eq!(report.visits_completed, 0);
        assert!(!events.iter().any(|e| matches!(e, MonitorEvent::VisitStarted { .. })));
    }

    #[tokio::test]
    async fn test_stop_signal_interrupts_blocked_read() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![ScriptStep::Frame(0.0), ScriptStep::Frame(0.5), ScriptStep::Hold];

        let harness = Harness::new(steps, FnDetector::by_time(|_| true));
        let mut rx = harness.events.subscribe();
        let supervisor = harness.supervisor(dir.path()).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));

        let status = harness.status.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while status.get(STREAM).map(|s| s.frames_read).unwrap_or(0) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frames processed");

        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("supervisor stopped")
            .unwrap();

        assert_eq!(report.reason, StopReason::Shutdown);
        assert!(harness.source.stats(STREAM).released());
        assert_eq!(
            harness.status.get(STREAM).map(|s| s.state),
            Some(StreamState::Stopped)
        );

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let visits = ended_visits(&events);
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].exit_reason, ExitReason::Shutdown);
        assert_eq!(visits[0].duration, 0.5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_failures_below_limit_never_reconnect(max_errors in 1u32..8, failures in 0usize..8) {
            let failures = failures.min(max_errors as usize - 1);
            let mut steps = vec![ScriptStep::Frame(0.0)];
            steps.extend(errors(failures));
            steps.extend([ScriptStep::Frame(1.0), ScriptStep::End]);

            let mut harness = Harness::new(steps, never());
            harness.settings = settings(max_errors, true);
            let dir = tempfile::tempdir().unwrap();
            let (report, _) = tokio_test::block_on(harness.run(dir.path()));

            prop_assert_eq!(report.reconnects, 0);
            prop_assert_eq!(harness.source.stats(STREAM).reconnects(), 0);
        }

        #[test]
        fn prop_limit_reconnects_once(max_errors in 1u32..8, reconnect_ok in any::<bool>()) {
            let mut steps = errors(max_errors as usize);
            steps.push(ScriptStep::End);

            let mut harness = Harness::new(steps, never());
            harness.settings = settings(max_errors, true);
            harness.source = harness.source.with_reconnect_results(STREAM, vec![reconnect_ok]);
            let dir = tempfile::tempdir().unwrap();
            tokio_test::block_on(harness.run(dir.path()));

            prop_assert_eq!(harness.source.stats(STREAM).reconnects(), 1);
            prop_assert_eq!(harness.consecutive_errors(), 0);
        }
    }
}
