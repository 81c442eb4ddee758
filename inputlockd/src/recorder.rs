use inputlock_common::{
    DeviceKind, InputEdge, MacroAction, MacroEvent, Notification, RawInputEvent,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::Notifier;

/// Delays below this are coalesced: the event is stamped with the previous
/// event's offset.
pub const DEFAULT_MIN_DELAY_MS: u64 = 10;

/// Hard cap on recording duration.
pub const DEFAULT_MAX_DURATION_MS: u64 = 30 * 60 * 1000;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("a recording is already in progress")]
    AlreadyRecording,
    #[error("no recording in progress")]
    NotRecording,
}

/// What the recorder keeps from the raw stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderFilters {
    pub record_keyboard: bool,
    pub record_mouse: bool,
    pub record_mouse_movement: bool,
    pub record_delays: bool,
}

impl Default for RecorderFilters {
    fn default() -> Self {
        Self {
            record_keyboard: true,
            record_mouse: true,
            record_mouse_movement: false,
            record_delays: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Recording,
    Paused,
}

/// Timestamped macro recorder fed from the raw event stream.
///
/// Offsets are measured from start(), with paused spans subtracted, so a
/// recording that was paused plays back without the pause gap.
pub struct MacroRecorder {
    phase: Phase,
    filters: RecorderFilters,
    min_delay_ms: u64,
    max_duration_ms: u64,
    events: Vec<MacroEvent>,
    started: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
    last_offset_ms: u64,
    last_position: Option<(i32, i32)>,
    capped: bool,
    notifier: Notifier,
}

impl MacroRecorder {
    pub fn new(filters: RecorderFilters, notifier: Notifier) -> Self {
        Self {
            phase: Phase::Idle,
            filters,
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_duration_ms: DEFAULT_MAX_DURATION_MS,
            events: Vec::new(),
            started: None,
            paused_at: None,
            paused_total: Duration::ZERO,
            last_offset_ms: 0,
            last_position: None,
            capped: false,
            notifier,
        }
    }

    pub fn with_limits(mut self, min_delay_ms: u64, max_duration_ms: u64) -> Self {
        self.min_delay_ms = min_delay_ms;
        self.max_duration_ms = max_duration_ms;
        self
    }

    pub fn is_recording(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn is_paused(&self) -> bool {
        self.phase == Phase::Paused
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn set_filters(&mut self, filters: RecorderFilters) {
        self.filters = filters;
    }

    /// Begin a new recording. The previous buffer is discarded.
    pub fn start(&mut self) -> Result<(), RecorderError> {
        if self.phase != Phase::Idle {
            return Err(RecorderError::AlreadyRecording);
        }
        self.events.clear();
        self.started = Some(Instant::now());
        self.paused_at = None;
        self.paused_total = Duration::ZERO;
        self.last_offset_ms = 0;
        self.last_position = None;
        self.capped = false;
        self.phase = Phase::Recording;
        info!("Recording started");
        self.notifier.publish(Notification::RecordingStarted);
        Ok(())
    }

    /// Freeze the offset clock; events are dropped until resume.
    pub fn pause(&mut self) -> Result<(), RecorderError> {
        match self.phase {
            Phase::Recording => {
                self.paused_at = Some(Instant::now());
                self.phase = Phase::Paused;
                info!("Recording paused at {} events", self.events.len());
                Ok(())
            }
            Phase::Paused => Ok(()),
            Phase::Idle => Err(RecorderError::NotRecording),
        }
    }

    pub fn resume(&mut self) -> Result<(), RecorderError> {
        match self.phase {
            Phase::Paused => {
                if let Some(paused_at) = self.paused_at.take() {
                    self.paused_total += paused_at.elapsed();
                }
                self.phase = Phase::Recording;
                info!("Recording resumed");
                Ok(())
            }
            Phase::Recording => Ok(()),
            Phase::Idle => Err(RecorderError::NotRecording),
        }
    }

    /// End the recording and return the captured events with the total
    /// recorded duration in milliseconds.
    pub fn stop(&mut self) -> Result<(Vec<MacroEvent>, u64), RecorderError> {
        if self.phase == Phase::Idle {
            // A recording that hit the duration cap already stopped and
            // notified; hand over its buffer without notifying again.
            if self.capped {
                self.capped = false;
                let events = std::mem::take(&mut self.events);
                return Ok((events, self.max_duration_ms));
            }
            return Err(RecorderError::NotRecording);
        }
        // A stop while paused must not count the trailing paused span
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += paused_at.elapsed();
        }
        let duration_ms = self.recorded_offset_ms(Instant::now());
        let events = std::mem::take(&mut self.events);
        self.phase = Phase::Idle;
        self.started = None;

        info!("Recording stopped: {} events over {}ms", events.len(), duration_ms);
        self.notifier.publish(Notification::RecordingStopped {
            duration_ms,
            events: events.len(),
        });
        Ok((events, duration_ms))
    }

    /// Feed one raw event from the hook stream.
    pub fn observe(&mut self, event: &RawInputEvent) {
        self.observe_at(event, Instant::now());
    }

    fn observe_at(&mut self, event: &RawInputEvent, now: Instant) {
        if self.phase != Phase::Recording {
            return;
        }

        let offset_ms = self.recorded_offset_ms(now);
        if offset_ms > self.max_duration_ms {
            // Hard limit: the recording stops itself. The buffer is
            // retained so a later stop() still returns it.
            warn!(
                "Recording hit the {}ms duration cap, stopping",
                self.max_duration_ms
            );
            self.capped = true;
            self.phase = Phase::Idle;
            self.started = None;
            self.paused_at = None;
            self.notifier.publish(Notification::RecordingStopped {
                duration_ms: self.max_duration_ms,
                events: self.events.len(),
            });
            return;
        }

        let action = match self.convert(event) {
            Some(action) => action,
            None => return,
        };

        let offset_ms = if !self.filters.record_delays {
            self.last_offset_ms
        } else if offset_ms.saturating_sub(self.last_offset_ms) < self.min_delay_ms {
            self.last_offset_ms
        } else {
            offset_ms
        };

        debug!("Recorded {:?} at +{}ms", action, offset_ms);
        self.last_offset_ms = offset_ms;
        self.events.push(MacroEvent { offset_ms, action });
    }

    /// Milliseconds of recording time elapsed, paused spans excluded.
    fn recorded_offset_ms(&self, now: Instant) -> u64 {
        let started = match self.started {
            Some(started) => started,
            None => return 0,
        };
        now.duration_since(started)
            .saturating_sub(self.paused_total)
            .as_millis() as u64
    }

    fn convert(&mut self, event: &RawInputEvent) -> Option<MacroAction> {
        match (event.device, &event.edge) {
            (DeviceKind::Keyboard, InputEdge::Down) if self.filters.record_keyboard => {
                Some(MacroAction::KeyDown(event.code))
            }
            (DeviceKind::Keyboard, InputEdge::Up) if self.filters.record_keyboard => {
                Some(MacroAction::KeyUp(event.code))
            }
            (DeviceKind::Mouse, InputEdge::Down) if self.filters.record_mouse => {
                Some(MacroAction::MouseDown(event.code))
            }
            (DeviceKind::Mouse, InputEdge::Up) if self.filters.record_mouse => {
                Some(MacroAction::MouseUp(event.code))
            }
            (DeviceKind::Mouse, InputEdge::Wheel { delta }) if self.filters.record_mouse => {
                Some(MacroAction::MouseWheel(*delta))
            }
            (DeviceKind::Mouse, InputEdge::Move { .. })
                if self.filters.record_mouse_movement =>
            {
                let position = event.position?;
                // Successive samples at the same coordinates carry no
                // information
                if self.last_position == Some(position) {
                    return None;
                }
                self.last_position = Some(position);
                Some(MacroAction::MouseMove { x: position.0, y: position.1 })
            }
            _ => None,
        }
    }
}
