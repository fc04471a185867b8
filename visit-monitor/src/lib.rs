pub mod config;
pub mod serde_helpers;
pub mod tracker;
pub mod detector;
pub mod reader;
pub mod recorder;
pub mod notifier;
pub mod events;
pub mod supervisor;
#[cfg(test)]
mod supervisor_test;
pub mod engine;
pub mod mock;

pub use config::{AppConfig, ConfigManager, EnvConfigOverride, StartupPolicy, StreamConfig};
pub use engine::{Engine, EngineBuilder, StartReport};
pub use events::{EventBus, MonitorEvent, StopReason};
pub use supervisor::{StreamState, StreamStatus, SupervisorReport};
pub use tracker::{TrackerSettings, VisitEvent, VisitTracker};
