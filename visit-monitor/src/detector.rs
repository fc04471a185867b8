// Detector adapter - uniform per-frame presence query
//
// ## Responsibilities
//
// - `Detector` trait wrapping the external detection model
// - HTTP inference client (raw frame upload, JSON detections back)
// - Detection-rate sampling while no visit is active

use crate::config::DetectorConfig;
use async_trait::async_trait;
use common::{BoundingBox, DetectError, Detection, Frame};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

/// Per-frame presence query.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Detection, DetectError>;
}

/// Raw detection as returned by the inference service
#[derive(Debug, Clone, Deserialize)]
pub struct RawDetection {
    pub label: String,
    pub conf: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

/// Pick the first detection matching the target label at or above the
/// confidence floor.
pub fn select_target(detections: &[RawDetection], target_label: &str, min_confidence: f32) -> Detection {
    detections
        .iter()
        .find(|d| d.label.eq_ignore_ascii_case(target_label) && d.conf >= min_confidence)
        .map(|d| {
            Detection::present(
                Some(BoundingBox {
                    x1: d.x1,
                    y1: d.y1,
                    x2: d.x2,
                    y2: d.y2,
                }),
                Some(d.conf),
            )
        })
        .unwrap_or_else(Detection::absent)
}

/// HTTP inference client
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    target_label: String,
    min_confidence: f32,
    timeout: Duration,
}

impl HttpDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DetectError::RequestFailed {
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            target_label: config.target_label.clone(),
            min_confidence: config.min_confidence,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &Frame) -> Result<Detection, DetectError> {
        let image = Part::bytes(frame.data.to_vec())
            .file_name(format!("frame_{}.bgr", frame.sequence))
            .mime_str("application/octet-stream")
            .map_err(|e| DetectError::RequestFailed {
                reason: e.to_string(),
            })?;

        let form = Form::new()
            .part("frame", image)
            .text("width", frame.width.to_string())
            .text("height", frame.height.to_string())
            .text("pixel_format", "bgr24")
            .text("captured_at", format!("{:.3}", frame.captured_at));

        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DetectError::Timeout {
                        duration: self.timeout,
                    }
                } else {
                    DetectError::RequestFailed {
                        reason: e.to_string(),
                    }
                }
            })?;

        if !resp.status().is_success() {
            return Err(DetectError::HttpStatus {
                code: resp.status().as_u16(),
            });
        }

        let body: DetectResponse = resp.json().await.map_err(|e| DetectError::InvalidResponse {
            reason: e.to_string(),
        })?;

        Ok(select_target(&body.detections, &self.target_label, self.min_confidence))
    }
}

/// Bounds detection calls while idle to one per `interval`.
#[derive(Debug, Clone)]
pub struct DetectionSampler {
    interval: f64,
    last_detection: Option<f64>,
}

impl DetectionSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.as_secs_f64(),
            last_detection: None,
        }
    }

    /// Whether a detection is due at `now`. Active visits always detect; a
    /// clock that moved backwards re-arms the sampler.
    pub fn should_detect(&self, now: f64, active: bool) -> bool {
        if active {
            return true;
        }
        match self.last_detection {
            None => true,
            Some(last) if now < last => true,
            Some(last) => now - last >= self.interval,
        }
    }

    pub fn mark(&mut self, now: f64) {
        self.last_detection = Some(now);
    }
}
