// Per-stream visit state machine.
//
// The tracker turns `(detected, now)` ticks into visit boundaries:
//
// - `Idle` + detected → `Active` (visit started)
// - `Active` + detected → `Active`, `last_detection_time` refreshed
// - `Active` + not detected → stays `Active` until
//   `now - last_detection_time >= debounce`, then `Idle` with a `VisitResult`
// - `Idle` + not detected → no-op
//
// Frames are captured separately through `VisitTracker::capture` so the
// caller decides which frames belong to the visit. Once the buffer holds
// `chunk_frames` frames it is swapped for a fresh one and handed back as a
// chunk, which keeps memory bounded for long visits.

use common::{ExitReason, Frame, VisitResult};
use std::mem;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tracker tuning, derived from engine and recording configuration.
#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub debounce: Duration,
    pub alert_threshold: Duration,
    pub chunk_frames: usize,
}

impl TrackerSettings {
    pub fn new(debounce: Duration, alert_threshold: Duration, chunk_frames: usize) -> Self {
        Self {
            debounce,
            alert_threshold,
            chunk_frames: chunk_frames.max(1),
        }
    }
}

/// An in-progress visit.
#[derive(Debug)]
struct ActiveVisit {
    visit_id: Uuid,
    start_time: f64,
    last_detection_time: f64,
    /// Latest timestamp observed while active; used for forced exits.
    last_seen: f64,
    frames: Vec<Frame>,
    frame_count: usize,
}

#[derive(Debug)]
enum VisitState {
    Idle,
    Active(ActiveVisit),
}

/// Outcome of feeding one tick into the tracker.
#[derive(Debug)]
pub enum VisitEvent {
    None,
    Started { visit_id: Uuid, start_time: f64 },
    Ended(VisitResult),
    /// A forced exit whose duration was not positive; nothing is reported.
    Discarded { visit_id: Uuid },
}

pub struct VisitTracker {
    stream_id: String,
    settings: TrackerSettings,
    state: VisitState,
}

impl VisitTracker {
    pub fn new(stream_id: impl Into<String>, settings: TrackerSettings) -> Self {
        Self {
            stream_id: stream_id.into(),
            settings,
            state: VisitState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, VisitState::Active(_))
    }

    /// Feed one detection result. Timestamps earlier than the last one seen
    /// during the visit are clamped forward.
    pub fn observe(&mut self, now: f64, detected: bool) -> VisitEvent {
        let debounce = self.settings.debounce.as_secs_f64();

        match &mut self.state {
            VisitState::Idle => {
                if !detected {
                    return VisitEvent::None;
                }

                let visit_id = Uuid::new_v4();
                info!(stream_id = %self.stream_id, %visit_id, "🐾 Visit started at {:.3}", now);
                self.state = VisitState::Active(ActiveVisit {
                    visit_id,
                    start_time: now,
                    last_detection_time: now,
                    last_seen: now,
                    frames: Vec::new(),
                    frame_count: 0,
                });
                VisitEvent::Started {
                    visit_id,
                    start_time: now,
                }
            }
            VisitState::Active(visit) => {
                let now = now.max(visit.last_seen);
                visit.last_seen = now;

                if detected {
                    visit.last_detection_time = now;
                    return VisitEvent::None;
                }

                if now - visit.last_detection_time >= debounce {
                    let visit_id = visit.visit_id;
                    return match self.finish(now, ExitReason::Debounce) {
                        Some(result) => VisitEvent::Ended(result),
                        None => VisitEvent::Discarded { visit_id },
                    };
                }

                VisitEvent::None
            }
        }
    }

    /// Append a frame to the active visit. Returns a full chunk once the
    /// buffer reaches `chunk_frames`; frames offered while idle are dropped.
    pub fn capture(&mut self, frame: Frame) -> Option<Vec<Frame>> {
        let chunk_frames = self.settings.chunk_frames;
        let VisitState::Active(visit) = &mut self.state else {
            return None;
        };

        visit.last_seen = visit.last_seen.max(frame.captured_at);
        visit.frames.push(frame);
        visit.frame_count += 1;

        if visit.frames.len() >= chunk_frames {
            let chunk = mem::replace(&mut visit.frames, Vec::with_capacity(chunk_frames));
            debug!(
                stream_id = %self.stream_id,
                visit_id = %visit.visit_id,
                "Handing off chunk of {} frames",
                chunk.len()
            );
            return Some(chunk);
        }

        None
    }

    /// End the active visit without waiting for the debounce, using the last
    /// observed timestamp as its end.
    pub fn force_exit(&mut self, reason: ExitReason) -> VisitEvent {
        let (visit_id, end_time) = match &self.state {
            VisitState::Idle => return VisitEvent::None,
            VisitState::Active(visit) => (visit.visit_id, visit.last_seen),
        };

        match self.finish(end_time, reason) {
            Some(result) => {
                info!(
                    stream_id = %self.stream_id,
                    visit_id = %result.visit_id,
                    "Visit flushed ({:?}) after {:.1} seconds",
                    reason,
                    result.duration
                );
                VisitEvent::Ended(result)
            }
            None => {
                warn!(
                    stream_id = %self.stream_id,
                    %visit_id,
                    "Dropping zero-length visit on {:?}",
                    reason
                );
                VisitEvent::Discarded { visit_id }
            }
        }
    }

    /// Drop the active visit and its buffered frames without a result.
    pub fn abandon(&mut self) -> Option<Uuid> {
        match mem::replace(&mut self.state, VisitState::Idle) {
            VisitState::Idle => None,
            VisitState::Active(visit) => Some(visit.visit_id),
        }
    }

    fn finish(&mut self, end_time: f64, reason: ExitReason) -> Option<VisitResult> {
        let VisitState::Active(visit) = mem::replace(&mut self.state, VisitState::Idle) else {
            return None;
        };

        if end_time - visit.start_time <= 0.0 {
            return None;
        }

        let result = VisitResult::new(
            visit.visit_id,
            self.stream_id.clone(),
            visit.start_time,
            end_time,
            visit.frames,
            visit.frame_count,
            self.settings.alert_threshold.as_secs_f64(),
            reason,
        );

        if reason == ExitReason::Debounce {
            info!(
                stream_id = %self.stream_id,
                visit_id = %result.visit_id,
                "Visit ended after {:.1} seconds ({} frames)",
                result.duration,
                result.frame_count
            );
        }

        Some(result)
    }
}
