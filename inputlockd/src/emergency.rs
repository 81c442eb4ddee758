use inputlock_common::{DeviceKind, InputEdge, Modifiers, Notification, RawInputEvent};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

use crate::blocking::BlockingStateMachine;
use crate::Notifier;

/// Reason recorded on both state machines when the chord fires.
pub const EMERGENCY_UNLOCK_REASON: &str = "emergency unlock";

// Linux KEY_U
const DEFAULT_CHORD_KEY: u16 = 22;

/// Chord configuration for the emergency unlock detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    pub key: u16,
    pub modifiers: Modifiers,
    pub required_presses: u32,
    pub timeout_ms: u64,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        // Ctrl+Alt+U, three times within two seconds
        Self {
            key: DEFAULT_CHORD_KEY,
            modifiers: Modifiers { ctrl: true, alt: true, ..Modifiers::NONE },
            required_presses: 3,
            timeout_ms: 2000,
        }
    }
}

/// Detects the emergency chord on the raw keyboard stream and forces both
/// state machines back to unblocked.
///
/// Must observe events BEFORE the suppression decision: if an advanced
/// configuration blocks the chord key itself, detection after suppression
/// would lock the user out.
pub struct EmergencyUnlock {
    config: EmergencyConfig,
    press_count: u32,
    last_press: Option<Instant>,
    keyboard: Arc<Mutex<BlockingStateMachine>>,
    mouse: Arc<Mutex<BlockingStateMachine>>,
    notifier: Notifier,
}

impl EmergencyUnlock {
    pub fn new(
        config: EmergencyConfig,
        keyboard: Arc<Mutex<BlockingStateMachine>>,
        mouse: Arc<Mutex<BlockingStateMachine>>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            press_count: 0,
            last_press: None,
            keyboard,
            mouse,
            notifier,
        }
    }

    pub fn press_count(&self) -> u32 {
        self.press_count
    }

    /// Feed one raw event. Returns true when this event completed the
    /// chord sequence and both devices were unblocked.
    pub fn observe(&mut self, event: &RawInputEvent) -> bool {
        self.observe_at(event, Instant::now())
    }

    fn observe_at(&mut self, event: &RawInputEvent, now: Instant) -> bool {
        if event.device != DeviceKind::Keyboard
            || event.edge != InputEdge::Down
            || event.code != self.config.key
            || !self.config.modifiers.satisfied_by(&event.modifiers)
        {
            return false;
        }

        // Sliding window: a lapsed gap restarts the count
        if let Some(last) = self.last_press {
            if now.duration_since(last).as_millis() as u64 > self.config.timeout_ms {
                debug!("emergency chord window lapsed, resetting count");
                self.press_count = 0;
            }
        }

        self.press_count += 1;
        self.last_press = Some(now);
        self.notifier.publish(Notification::EmergencyUnlockAttempt {
            count: self.press_count,
        });
        debug!("emergency chord press {}/{}", self.press_count, self.config.required_presses);

        if self.press_count >= self.config.required_presses {
            self.press_count = 0;
            self.last_press = None;
            info!("emergency unlock chord completed, unblocking both devices");
            self.keyboard
                .lock()
                .unwrap()
                .set_blocked(false, EMERGENCY_UNLOCK_REASON);
            self.mouse
                .lock()
                .unwrap()
                .set_blocked(false, EMERGENCY_UNLOCK_REASON);
            return true;
        }

        false
    }
}
