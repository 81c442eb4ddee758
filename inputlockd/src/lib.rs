//! Inputlock Daemon Library
//!
//! This library provides the core functionality for the inputlock daemon:
//! - Global input interception (exclusive device grabs) and pass-through
//! - Per-device blocking state machines
//! - Emergency unlock detection
//! - Macro recording and playback
//! - Trigger-to-macro bindings
//! - Input synthesis via uinput
//! - IPC communication

use inputlock_common::Notification;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;

pub mod bindings;
pub mod blocking;
pub mod config;
pub mod emergency;
pub mod hook;
pub mod injector;
pub mod ipc;
pub mod player;
pub mod recorder;

// Re-export common types
pub use inputlock_common::{
    BlockMode, DeviceKind, Macro, MacroBinding, MacroEvent, RawInputEvent,
};

/// Capacity of the notification broadcast channel.
const NOTIFICATION_CHANNEL_SIZE: usize = 256;

/// Fan-out bus for notifications to external callers. Delivery order equals
/// publish order; subscribers that lag past the channel capacity lose the
/// oldest frames rather than blocking the publisher.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_SIZE);
        Self { tx }
    }

    /// Publish a notification. No receivers is not an error.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// DaemonState bundles the shared component handles the IPC server needs
pub struct DaemonState {
    pub start_time: Instant,
    pub keyboard: Arc<Mutex<blocking::BlockingStateMachine>>,
    pub mouse: Arc<Mutex<blocking::BlockingStateMachine>>,
    pub recorder: Arc<Mutex<recorder::MacroRecorder>>,
    pub player: Arc<player::MacroPlayer>,
    pub triggers: Arc<bindings::TriggerService>,
    pub config: Arc<config::ConfigManager>,
    pub notifier: Notifier,
}

impl DaemonState {
    /// The state machine for one device kind.
    pub fn machine_for(&self, device: DeviceKind) -> Arc<Mutex<blocking::BlockingStateMachine>> {
        match device {
            DeviceKind::Keyboard => Arc::clone(&self.keyboard),
            DeviceKind::Mouse => Arc::clone(&self.mouse),
        }
    }

    /// Snapshot both devices' blocking state, keyboard first.
    pub fn blocking_snapshots(&self) -> Vec<inputlock_common::BlockingSnapshot> {
        vec![
            self.keyboard.lock().unwrap().snapshot(),
            self.mouse.lock().unwrap().snapshot(),
        ]
    }
}
