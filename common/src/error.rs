use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Stream Reader Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to open stream {source_desc}: {reason}")]
    OpenFailed { source_desc: String, reason: String },

    #[error("Stream open timed out after {duration:?}")]
    OpenTimeout { duration: Duration },

    #[error("Frame read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("Reconnect failed: {reason}")]
    ReconnectFailed { reason: String },

    #[error("Stream not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Detector Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Detection request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Detection service returned status {code}")]
    HttpStatus { code: u16 },

    #[error("Invalid detection response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Detection timed out after {duration:?}")]
    Timeout { duration: Duration },
}

// ============================================================================
// Clip Recorder Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ClipError {
    #[error("Video encoder not available: {reason}")]
    CodecUnavailable { reason: String },

    #[error("Clip write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    #[error("Visit has no frames to encode")]
    EmptyVisit,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Notifier Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification transport error: {reason}")]
    Transport { reason: String },

    #[error("Notification rejected with status {code}: {body}")]
    HttpStatus { code: u16, body: String },

    #[error("Attachment unreadable: {path:?}")]
    AttachmentUnreadable { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ============================================================================
// Engine Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Startup aborted: stream {stream_id} failed to open: {source}")]
    StartupAborted {
        stream_id: String,
        #[source]
        source: StreamError,
    },

    #[error("No stream could be started ({failed} failed)")]
    NoStreamsStarted { failed: usize },

    #[error("Failed to set up {component}: {reason}")]
    Setup {
        component: &'static str,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
