use inputlock_common::{
    AdvancedConfig, BlockMode, BlockingSnapshot, DeviceKind, Notification, RawInputEvent,
};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

use crate::Notifier;

/// Errors raised by blocking state transitions
#[derive(Error, Debug)]
pub enum BlockingError {
    #[error("apply_selection requires select mode, current mode is {0}")]
    NotInSelectMode(&'static str),
}

/// Per-device blocking state machine.
///
/// Created at service start and lives for the process lifetime; mutated
/// only through the explicit operations below. Every transition updates
/// the toggle bookkeeping and publishes exactly one StateChanged.
pub struct BlockingStateMachine {
    device: DeviceKind,
    blocked: bool,
    mode: BlockMode,
    last_toggle_time: Option<Instant>,
    last_toggle_unix_ms: Option<u64>,
    last_toggle_reason: Option<String>,
    notifier: Notifier,
}

impl BlockingStateMachine {
    pub fn new(device: DeviceKind, notifier: Notifier) -> Self {
        Self {
            device,
            blocked: false,
            mode: BlockMode::Simple,
            last_toggle_time: None,
            last_toggle_unix_ms: None,
            last_toggle_reason: None,
            notifier,
        }
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn mode(&self) -> &BlockMode {
        &self.mode
    }

    pub fn last_toggle_time(&self) -> Option<Instant> {
        self.last_toggle_time
    }

    pub fn last_toggle_reason(&self) -> Option<&str> {
        self.last_toggle_reason.as_deref()
    }

    /// Flip the blocked flag.
    pub fn toggle(&mut self, reason: &str) {
        self.blocked = !self.blocked;
        info!("{} blocking toggled to {} ({})", self.device, self.blocked, reason);
        self.touch(reason);
    }

    /// Set the blocked flag explicitly.
    pub fn set_blocked(&mut self, blocked: bool, reason: &str) {
        self.blocked = blocked;
        info!("{} blocking set to {} ({})", self.device, blocked, reason);
        self.touch(reason);
    }

    /// Switch to Simple mode: everything on this device is suppressed
    /// while blocked.
    pub fn set_simple_mode(&mut self, reason: &str) {
        self.mode = BlockMode::Simple;
        info!("{} mode set to simple ({})", self.device, reason);
        self.touch(reason);
    }

    /// Switch to Advanced mode with an explicit configuration.
    pub fn set_advanced_mode(&mut self, config: AdvancedConfig, reason: &str) {
        self.mode = BlockMode::Advanced(config);
        info!("{} mode set to advanced ({})", self.device, reason);
        self.touch(reason);
    }

    /// Switch to Select mode. The current advanced configuration is
    /// snapshotted so its blocked set survives, but category flags are
    /// cleared so highlighting reflects only the incoming selection.
    pub fn set_select_mode(&mut self, config: AdvancedConfig, reason: &str) {
        let mut snapshot = match &self.mode {
            BlockMode::Advanced(current) | BlockMode::Select(current) => current.clone(),
            BlockMode::Simple => config.clone(),
        };
        snapshot.clear_category_flags();
        snapshot.selected = config.selected;
        self.mode = BlockMode::Select(snapshot);
        info!("{} mode set to select ({})", self.device, reason);
        self.touch(reason);
    }

    /// Merge the Select-mode selection into the blocked set and transition
    /// to Advanced.
    pub fn apply_selection(&mut self, reason: &str) -> Result<(), BlockingError> {
        match &mut self.mode {
            BlockMode::Select(config) => {
                config.apply_selection();
                let config = config.clone();
                let count = config.blocked.len();
                self.mode = BlockMode::Advanced(config);
                info!("{} selection applied, {} controls blocked ({})", self.device, count, reason);
                self.touch(reason);
                Ok(())
            }
            other => Err(BlockingError::NotInSelectMode(other.name())),
        }
    }

    /// The suppress/pass-through decision for one raw event.
    ///
    /// Select mode never suppresses regardless of the blocked flag; it
    /// exists so the UI can let the user pick controls without losing
    /// input control.
    pub fn is_suppressed(&self, event: &RawInputEvent) -> bool {
        if !self.blocked {
            return false;
        }
        match &self.mode {
            BlockMode::Simple => true,
            BlockMode::Advanced(config) => {
                let suppressed = config.is_blocked(&event.control());
                if suppressed {
                    debug!("{} suppressing {:?}", self.device, event.control());
                }
                suppressed
            }
            BlockMode::Select(_) => false,
        }
    }

    /// Serializable snapshot for IPC and StateChanged notifications.
    pub fn snapshot(&self) -> BlockingSnapshot {
        BlockingSnapshot {
            device: self.device,
            blocked: self.blocked,
            mode: self.mode.clone(),
            last_toggle_reason: self.last_toggle_reason.clone(),
            last_toggle_unix_ms: self.last_toggle_unix_ms,
        }
    }

    fn touch(&mut self, reason: &str) {
        self.last_toggle_time = Some(Instant::now());
        self.last_toggle_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64);
        self.last_toggle_reason = Some(reason.to_string());
        self.notifier.publish(Notification::StateChanged(self.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inputlock_common::{Control, InputEdge, Modifiers};
    use std::time::Instant;

    fn machine(device: DeviceKind) -> (BlockingStateMachine, Notifier) {
        let notifier = Notifier::new();
        (BlockingStateMachine::new(device, notifier.clone()), notifier)
    }

    fn key_down(code: u16) -> RawInputEvent {
        RawInputEvent {
            device: DeviceKind::Keyboard,
            code,
            edge: InputEdge::Down,
            modifiers: Modifiers::NONE,
            position: None,
            timestamp: Instant::now(),
        }
    }

    fn mouse_move() -> RawInputEvent {
        RawInputEvent {
            device: DeviceKind::Mouse,
            code: 0,
            edge: InputEdge::Move { dx: 1, dy: 0 },
            modifiers: Modifiers::NONE,
            position: Some((100, 100)),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_toggle_flips_and_notifies_once() {
        let (mut sm, notifier) = machine(DeviceKind::Keyboard);
        let mut rx = notifier.subscribe();

        assert!(!sm.is_blocked());
        assert!(sm.last_toggle_time().is_none());

        sm.toggle("test");
        assert!(sm.is_blocked());
        assert_eq!(sm.last_toggle_reason(), Some("test"));
        assert!(sm.last_toggle_time().is_some());

        // Exactly one StateChanged
        match rx.try_recv().unwrap() {
            Notification::StateChanged(snapshot) => {
                assert!(snapshot.blocked);
                assert_eq!(snapshot.device, DeviceKind::Keyboard);
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        sm.toggle("again");
        assert!(!sm.is_blocked());
    }

    #[test]
    fn test_simple_mode_suppresses_everything_when_blocked() {
        let (mut sm, _n) = machine(DeviceKind::Keyboard);
        assert!(!sm.is_suppressed(&key_down(30)));

        sm.set_blocked(true, "test");
        assert!(sm.is_suppressed(&key_down(30)));
        assert!(sm.is_suppressed(&key_down(59)));
    }

    #[test]
    fn test_advanced_mode_uses_config() {
        let (mut sm, _n) = machine(DeviceKind::Keyboard);
        let mut config = AdvancedConfig::default();
        config.blocked.insert(Control::Key(30));

        sm.set_advanced_mode(config, "test");
        sm.set_blocked(true, "test");

        assert!(sm.is_suppressed(&key_down(30)));
        assert!(!sm.is_suppressed(&key_down(31)));
    }

    #[test]
    fn test_select_mode_never_suppresses() {
        let (mut sm, _n) = machine(DeviceKind::Mouse);
        let mut config = AdvancedConfig::default();
        config.selected.insert(Control::MouseMove);
        config.block_mouse_movement = true;

        sm.set_select_mode(config, "test");
        sm.set_blocked(true, "test");

        // Blocked flag and flags notwithstanding, select passes everything
        assert!(!sm.is_suppressed(&mouse_move()));
    }

    #[test]
    fn test_select_entry_snapshots_and_clears_flags() {
        let (mut sm, _n) = machine(DeviceKind::Keyboard);

        let mut advanced = AdvancedConfig::default();
        advanced.blocked.insert(Control::Key(30));
        advanced.block_function_keys = true;
        sm.set_advanced_mode(advanced, "test");

        let mut selection = AdvancedConfig::default();
        selection.selected.insert(Control::Key(31));
        sm.set_select_mode(selection, "test");

        match sm.mode() {
            BlockMode::Select(config) => {
                // Blocked set survives, stale category flags do not
                assert!(config.blocked.contains(&Control::Key(30)));
                assert!(!config.block_function_keys);
                assert!(config.selected.contains(&Control::Key(31)));
            }
            other => panic!("expected select mode, got {}", other.name()),
        }
    }

    #[test]
    fn test_apply_selection_merges_and_transitions() {
        let (mut sm, _n) = machine(DeviceKind::Keyboard);

        let mut selection = AdvancedConfig::default();
        selection.selected.insert(Control::Key(31));
        sm.set_select_mode(selection, "test");

        sm.apply_selection("test").unwrap();
        match sm.mode() {
            BlockMode::Advanced(config) => {
                assert!(config.blocked.contains(&Control::Key(31)));
                assert!(config.selected.is_empty());
            }
            other => panic!("expected advanced mode, got {}", other.name()),
        }

        // Now suppression applies
        sm.set_blocked(true, "test");
        assert!(sm.is_suppressed(&key_down(31)));
    }

    #[test]
    fn test_apply_selection_outside_select_fails() {
        let (mut sm, _n) = machine(DeviceKind::Keyboard);
        assert!(sm.apply_selection("test").is_err());
    }
}
