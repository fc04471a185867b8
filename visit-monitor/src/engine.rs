use crate::config::{AppConfig, StartupPolicy, StreamConfig};
use crate::detector::{Detector, HttpDetector};
use crate::events::{EventBus, MonitorEvent};
use crate::notifier::{LogTransport, Notifier, NotifyTransport, WebhookTransport};
use crate::reader::{FfmpegStreamSource, StreamReader, StreamSource};
use crate::recorder::{ClipEncoder, ClipRecorder, FfmpegClipEncoder};
use crate::supervisor::{
    StatusRegistry, StreamState, StreamStatus, StreamSupervisor, SupervisorReport,
    SupervisorSettings, VisitHandler,
};
use common::{EngineError, StreamError};
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Builder for dependency injection; unset collaborators fall back to the
/// ffmpeg / HTTP implementations.
pub struct EngineBuilder {
    config: AppConfig,
    source: Option<Arc<dyn StreamSource>>,
    detector: Option<Arc<dyn Detector>>,
    encoder: Option<Arc<dyn ClipEncoder>>,
    transport: Option<Arc<dyn NotifyTransport>>,
    events: Option<EventBus>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            source: None,
            detector: None,
            encoder: None,
            transport: None,
            events: None,
        }
    }

    /// Set custom stream source implementation
    pub fn with_source(mut self, source: Arc<dyn StreamSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set custom detector implementation
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Set custom clip encoder implementation
    pub fn with_encoder(mut self, encoder: Arc<dyn ClipEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Set custom alert transport implementation
    pub fn with_transport(mut self, transport: Arc<dyn NotifyTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share an existing event bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;

        let source = match self.source {
            Some(source) => source,
            None => Arc::new(FfmpegStreamSource::new(self.config.engine.open_timeout)),
        };

        let detector = match self.detector {
            Some(detector) => detector,
            None => Arc::new(HttpDetector::new(&self.config.detector).map_err(|e| {
                EngineError::Setup {
                    component: "detector",
                    reason: e.to_string(),
                }
            })?),
        };

        let encoder = match self.encoder {
            Some(encoder) => encoder,
            None => Arc::new(FfmpegClipEncoder::new(self.config.recording.codec.clone())),
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&self.config)?,
        };

        Ok(Engine {
            recorder: self
                .config
                .recording
                .enabled
                .then(|| ClipRecorder::new(encoder, &self.config.recording)),
            notifier: Arc::new(Notifier::new(
                transport,
                self.config.notifier.max_attachment_bytes,
            )),
            settings: SupervisorSettings::from_config(&self.config),
            config: self.config,
            source,
            detector,
            events: self.events.unwrap_or_default(),
            status: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }
}

fn default_transport(config: &AppConfig) -> Result<Arc<dyn NotifyTransport>, EngineError> {
    match &config.notifier.webhook_url {
        Some(url) => {
            let transport = WebhookTransport::new(url.clone(), config.notifier.timeout).map_err(|e| {
                EngineError::Setup {
                    component: "notifier",
                    reason: e.to_string(),
                }
            })?;
            Ok(Arc::new(transport))
        }
        None => {
            warn!("No webhook configured, alerts will only be logged");
            Ok(Arc::new(LogTransport))
        }
    }
}

/// Streams that opened and streams that did not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Owns one supervisor task per configured stream.
pub struct Engine {
    config: AppConfig,
    source: Arc<dyn StreamSource>,
    detector: Arc<dyn Detector>,
    recorder: Option<ClipRecorder>,
    notifier: Arc<Notifier>,
    settings: SupervisorSettings,
    events: EventBus,
    status: StatusRegistry,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<SupervisorReport>>,
}

impl Engine {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Token that stops every stream loop when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Per-stream snapshot, ordered by stream id.
    pub fn status(&self) -> Vec<StreamStatus> {
        let mut status: Vec<StreamStatus> =
            self.status.iter().map(|entry| entry.value().clone()).collect();
        status.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        status
    }

    /// Open every configured stream and start its supervisor.
    ///
    /// Under `isolate` an unopenable stream is reported and skipped, and start
    /// fails only when nothing opened. Under `abort_all` the first unopenable
    /// stream (in configuration order) fails start and the streams that did
    /// open are released.
    pub async fn start(&mut self) -> Result<StartReport, EngineError> {
        if !self.tasks.is_empty() {
            return Err(EngineError::AlreadyRunning);
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        info!("🚀 Starting visit monitor with {} streams", self.config.streams.len());

        for stream in &self.config.streams {
            self.status
                .insert(stream.id.clone(), StreamStatus::new(stream.id.clone()));
        }

        let opened = join_all(
            self.config
                .streams
                .iter()
                .map(|stream| open_stream(self.source.clone(), stream.clone())),
        )
        .await;

        let mut readers = Vec::new();
        let mut failures: Vec<(String, StreamError)> = Vec::new();
        for (stream, result) in self.config.streams.iter().zip(opened) {
            match result {
                Ok(reader) => readers.push((stream.id.clone(), reader)),
                Err(e) => {
                    error!(stream_id = %stream.id, "❌ Failed to open stream: {}", e);
                    if let Some(mut entry) = self.status.get_mut(&stream.id) {
                        entry.state = StreamState::Failed;
                        entry.last_error = Some(e.to_string());
                    }
                    self.events.publish(MonitorEvent::StreamFailed {
                        stream_id: stream.id.clone(),
                        reason: e.to_string(),
                    });
                    failures.push((stream.id.clone(), e));
                }
            }
        }

        if self.config.engine.startup_policy == StartupPolicy::AbortAll && !failures.is_empty() {
            for (_, mut reader) in readers {
                reader.release().await;
            }
            let (stream_id, source) = failures.remove(0);
            return Err(EngineError::StartupAborted { stream_id, source });
        }

        if readers.is_empty() {
            return Err(EngineError::NoStreamsStarted {
                failed: failures.len(),
            });
        }

        let mut report = StartReport {
            started: Vec::new(),
            failed: failures
                .iter()
                .map(|(id, e)| (id.clone(), e.to_string()))
                .collect(),
        };

        for (stream_id, reader) in readers {
            let handler = VisitHandler::new(
                stream_id.clone(),
                self.recorder.clone(),
                self.notifier.clone(),
                self.settings.tracker.alert_threshold,
                self.events.clone(),
                self.status.clone(),
            );
            let supervisor = StreamSupervisor::new(
                stream_id.clone(),
                reader,
                self.detector.clone(),
                handler,
                self.settings,
                self.events.clone(),
                self.status.clone(),
            );

            self.events.publish(MonitorEvent::StreamStarted {
                stream_id: stream_id.clone(),
            });
            self.tasks.push(tokio::spawn(supervisor.run(self.cancel.clone())));
            report.started.push(stream_id);
        }

        info!(
            "✓ Visit monitor started: {} streams running, {} failed",
            report.started.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Wait for every stream loop to finish on its own.
    pub async fn wait(&mut self) -> Vec<SupervisorReport> {
        let tasks = std::mem::take(&mut self.tasks);
        let mut reports = Vec::with_capacity(tasks.len());
        for result in join_all(tasks).await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => error!("Stream supervisor task failed: {}", e),
            }
        }
        reports
    }

    /// Signal every stream loop to stop, then wait for them to release
    /// their sources and drain pending clips and alerts.
    pub async fn stop(&mut self) -> Vec<SupervisorReport> {
        info!("Stopping visit monitor");
        self.cancel.cancel();
        let reports = self.wait().await;
        info!("✓ Visit monitor stopped ({} streams)", reports.len());
        reports
    }
}

async fn open_stream(
    source: Arc<dyn StreamSource>,
    stream: StreamConfig,
) -> Result<Box<dyn StreamReader>, StreamError> {
    source.open(&stream).await
}
