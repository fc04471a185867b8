// Alert delivery.
//
// `Notifier` applies the attachment ceiling and makes a single delivery
// attempt per alert; transports only move bytes.

use async_trait::async_trait;
use common::{AlertMessage, NotifyError};
use reqwest::multipart::{Form, Part};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Outbound alert channel.
#[async_trait]
pub trait NotifyTransport: Send + Sync {
    async fn send(&self, text: &str, attachment: Option<&Path>) -> Result<(), NotifyError>;
}

/// What was actually delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attached: bool,
    pub truncated: bool,
}

pub struct Notifier {
    transport: Arc<dyn NotifyTransport>,
    max_attachment_bytes: u64,
}

impl Notifier {
    pub fn new(transport: Arc<dyn NotifyTransport>, max_attachment_bytes: u64) -> Self {
        Self {
            transport,
            max_attachment_bytes,
        }
    }

    /// Deliver one alert. Clips at or above the ceiling, or clips that cannot
    /// be inspected, are replaced by a notice in the text. Exactly one send.
    pub async fn deliver(&self, alert: &AlertMessage) -> Result<DeliveryReport, NotifyError> {
        let mut text = alert.text.clone();
        let mut attachment = None;
        let mut truncated = false;

        if let Some(path) = alert.clip_path.as_deref() {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.len() < self.max_attachment_bytes => {
                    attachment = Some(path);
                }
                Ok(meta) => {
                    truncated = true;
                    text.push_str(&format!(
                        "\n(clip omitted: {} bytes exceeds {} byte attachment limit; saved at {})",
                        meta.len(),
                        self.max_attachment_bytes,
                        path.display()
                    ));
                }
                Err(e) => {
                    truncated = true;
                    warn!(stream_id = %alert.stream_id, "Clip {:?} unreadable: {}", path, e);
                    text.push_str("\n(clip omitted: file unreadable)");
                }
            }
        }

        self.transport.send(&text, attachment).await?;

        let report = DeliveryReport {
            attached: attachment.is_some(),
            truncated,
        };
        info!(
            stream_id = %alert.stream_id,
            visit_id = %alert.visit_id,
            "📨 Alert delivered (attached: {}, truncated: {})",
            report.attached,
            report.truncated
        );
        Ok(report)
    }
}

/// Discord-style webhook: `content` field plus optional `file` part.
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport {
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("avi") => "video/x-msvideo",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl NotifyTransport for WebhookTransport {
    async fn send(&self, text: &str, attachment: Option<&Path>) -> Result<(), NotifyError> {
        let mut form = Form::new().text("content", text.to_string());

        if let Some(path) = attachment {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|_| NotifyError::AttachmentUnreadable {
                    path: path.to_path_buf(),
                })?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "clip".to_string());
            let part = Part::bytes(bytes)
                .file_name(file_name)
                .mime_str(mime_for(path))
                .map_err(|e| NotifyError::Transport {
                    reason: e.to_string(),
                })?;
            form = form.part("file", part);
        }

        let resp = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| NotifyError::Transport {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::HttpStatus {
                code: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Writes alerts to the log; used when no webhook is configured.
pub struct LogTransport;

#[async_trait]
impl NotifyTransport for LogTransport {
    async fn send(&self, text: &str, attachment: Option<&Path>) -> Result<(), NotifyError> {
        match attachment {
            Some(path) => warn!("{} (clip: {})", text, path.display()),
            None => warn!("{}", text),
        }
        Ok(())
    }
}
