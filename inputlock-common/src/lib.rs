use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

// Re-export common dependencies
pub use bincode;
pub use serde;
pub use tokio;
pub use tracing;

// IPC client module
pub mod ipc_client;

/// Which physical device class an event came from or a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Keyboard,
    Mouse,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceKind::Keyboard => write!(f, "keyboard"),
            DeviceKind::Mouse => write!(f, "mouse"),
        }
    }
}

/// Modifier keys held alongside an event or required by a trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers {
        ctrl: false,
        alt: false,
        shift: false,
        meta: false,
    };

    /// True when every modifier required by `self` is held in `held`.
    pub fn satisfied_by(&self, held: &Modifiers) -> bool {
        (!self.ctrl || held.ctrl)
            && (!self.alt || held.alt)
            && (!self.shift || held.shift)
            && (!self.meta || held.meta)
    }
}

/// The edge of a raw input event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEdge {
    Down,
    Up,
    Move { dx: i32, dy: i32 },
    Wheel { delta: i32 },
}

/// A single control a blocking rule can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Control {
    Key(u16),
    MouseButton(u16),
    MouseWheel,
    MouseMove,
}

/// Normalized payload delivered by the interception layer.
///
/// Ephemeral: produced inside the per-device reader and fanned out to
/// subscribers, never persisted.
#[derive(Debug, Clone)]
pub struct RawInputEvent {
    pub device: DeviceKind,
    pub code: u16,
    pub edge: InputEdge,
    pub modifiers: Modifiers,
    pub position: Option<(i32, i32)>,
    pub timestamp: Instant,
}

impl RawInputEvent {
    /// The control this event acts on, for blocking-rule lookup.
    pub fn control(&self) -> Control {
        match (self.device, self.edge) {
            (DeviceKind::Keyboard, _) => Control::Key(self.code),
            (DeviceKind::Mouse, InputEdge::Move { .. }) => Control::MouseMove,
            (DeviceKind::Mouse, InputEdge::Wheel { .. }) => Control::MouseWheel,
            (DeviceKind::Mouse, _) => Control::MouseButton(self.code),
        }
    }
}

// Linux key code ranges used by the category flags
const KEY_F1: u16 = 59;
const KEY_F10: u16 = 68;
const KEY_F11: u16 = 87;
const KEY_F12: u16 = 88;
const KEY_HOME: u16 = 102;
const KEY_DELETE: u16 = 111;

/// True for KEY_F1..KEY_F12.
pub fn is_function_key(code: u16) -> bool {
    (KEY_F1..=KEY_F10).contains(&code) || code == KEY_F11 || code == KEY_F12
}

/// True for the navigation cluster (Home/End/arrows/PgUp/PgDn/Ins/Del).
pub fn is_navigation_key(code: u16) -> bool {
    (KEY_HOME..=KEY_DELETE).contains(&code)
}

/// Explicit blocked controls plus category flags for Advanced mode, and the
/// parallel selection set used only for Select-mode highlighting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedConfig {
    pub blocked: HashSet<Control>,
    pub selected: HashSet<Control>,
    pub block_function_keys: bool,
    pub block_navigation_keys: bool,
    pub block_mouse_buttons: bool,
    pub block_mouse_wheel: bool,
    pub block_mouse_movement: bool,
}

impl AdvancedConfig {
    /// A control is blocked iff it is in the explicit set or a category
    /// flag covers it. The selection set never contributes.
    pub fn is_blocked(&self, control: &Control) -> bool {
        if self.blocked.contains(control) {
            return true;
        }
        match control {
            Control::Key(code) => {
                (self.block_function_keys && is_function_key(*code))
                    || (self.block_navigation_keys && is_navigation_key(*code))
            }
            Control::MouseButton(_) => self.block_mouse_buttons,
            Control::MouseWheel => self.block_mouse_wheel,
            Control::MouseMove => self.block_mouse_movement,
        }
    }

    /// Clear category flags so Select-mode highlighting reflects only the
    /// current selection set.
    pub fn clear_category_flags(&mut self) {
        self.block_function_keys = false;
        self.block_navigation_keys = false;
        self.block_mouse_buttons = false;
        self.block_mouse_wheel = false;
        self.block_mouse_movement = false;
    }

    /// Merge the selection set into the blocked set and clear it.
    pub fn apply_selection(&mut self) {
        let selected: Vec<Control> = self.selected.drain().collect();
        self.blocked.extend(selected);
    }
}

/// Blocking mode. The configuration travels with the mode so it cannot
/// exist outside Advanced or Select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockMode {
    Simple,
    Advanced(AdvancedConfig),
    Select(AdvancedConfig),
}

impl BlockMode {
    pub fn name(&self) -> &'static str {
        match self {
            BlockMode::Simple => "simple",
            BlockMode::Advanced(_) => "advanced",
            BlockMode::Select(_) => "select",
        }
    }
}

/// Serializable snapshot of one device's blocking state, sent over IPC and
/// carried by StateChanged notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingSnapshot {
    pub device: DeviceKind,
    pub blocked: bool,
    pub mode: BlockMode,
    pub last_toggle_reason: Option<String>,
    pub last_toggle_unix_ms: Option<u64>,
}

/// Type-specific payload of one recorded action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MacroAction {
    KeyDown(u16),
    KeyUp(u16),
    MouseDown(u16),
    MouseUp(u16),
    MouseMove { x: i32, y: i32 },
    MouseWheel(i32),
    Delay(u64),
    Text(String),
}

/// One recorded action with its offset from the start of the recording.
/// Immutable once created; ordering inside a macro is by offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroEvent {
    pub offset_ms: u64,
    pub action: MacroAction,
}

/// Iteration policy for playback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Execute the event list once.
    Once,
    /// Execute n times with a fixed inter-iteration pause.
    Repeat(u32),
    /// Execute until cancelled.
    Loop,
    /// Execute, wait the fixed delay (ms), repeat until cancelled.
    Interval(u64),
    /// Execute, wait a uniformly random delay in [min, max] ms, repeat.
    RandomInterval(u64, u64),
    /// Reserved; rejected by player validation.
    UntilCondition,
}

/// A named, ordered sequence of recorded events with execution parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macro {
    pub id: u64,
    pub name: String,
    pub events: Vec<MacroEvent>,
    pub execution: ExecutionMode,
    pub enabled: bool,
    pub run_count: u64,
    pub last_run_unix_secs: Option<u64>,
}

impl Macro {
    pub fn new(name: impl Into<String>, events: Vec<MacroEvent>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            events,
            execution: ExecutionMode::Once,
            enabled: true,
            run_count: 0,
            last_run_unix_secs: None,
        }
    }
}

/// Which edge a trigger fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEdge {
    Down,
    Up,
}

/// Condition that fires a binding: device, control code, required
/// modifiers, and edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub device: DeviceKind,
    pub code: u16,
    pub modifiers: Modifiers,
    pub edge: TriggerEdge,
}

impl Trigger {
    /// True when a raw event satisfies this trigger.
    pub fn matches(&self, event: &RawInputEvent) -> bool {
        if event.device != self.device || event.code != self.code {
            return false;
        }
        let edge_ok = matches!(
            (self.edge, event.edge),
            (TriggerEdge::Down, InputEdge::Down) | (TriggerEdge::Up, InputEdge::Up)
        );
        edge_ok && self.modifiers.satisfied_by(&event.modifiers)
    }
}

/// Binds a trigger to a macro by name. The name is resolved at fire time;
/// the binding does not own the macro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroBinding {
    pub id: u64,
    pub macro_name: String,
    pub trigger: Trigger,
    pub enabled: bool,
}

/// Notifications raised to external callers (GUI, tray, tests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    StateChanged(BlockingSnapshot),
    EmergencyUnlockAttempt { count: u32 },
    PlaybackStarted { name: String },
    PlaybackStopped { name: String, cancelled: bool },
    PlaybackPaused { name: String },
    PlaybackResumed { name: String },
    EventExecuted { index: usize, success: bool },
    ProgressChanged { current: usize, total: usize, percentage: f32 },
    RecordingStarted,
    RecordingStopped { duration_ms: u64, events: usize },
    BindingsChanged,
}

/// IPC requests from external callers to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Flip blocking on both devices
    ToggleBlocking { reason: String },

    /// Set blocking on both devices explicitly
    SetBlocking { blocked: bool, reason: String },

    /// Set the blocking mode for one device
    SetMode {
        device: DeviceKind,
        mode: BlockMode,
        reason: String,
    },

    /// Merge the Select-mode selection into the blocked set
    ApplySelection { device: DeviceKind },

    /// Snapshot both devices' blocking state
    GetState,

    /// Begin recording a macro
    StartRecording,

    /// Pause the offset clock
    PauseRecording,

    /// Resume a paused recording
    ResumeRecording,

    /// Stop recording; the captured events are saved under `name`
    StopRecording { name: String },

    /// Store or replace a macro
    SaveMacro { macro_entry: Macro },

    /// Fetch a macro by name
    GetMacro { name: String },

    /// List all stored macros
    ListMacros,

    /// Delete a macro by name
    DeleteMacro { name: String },

    /// Play a stored macro, optionally overriding its execution parameters
    PlayMacro {
        name: String,
        mode: Option<ExecutionMode>,
        repeat_count: Option<u32>,
    },

    /// Cancel the running playback
    StopPlayback,

    /// Pause or resume the running playback
    SetPlaybackPaused { paused: bool },

    /// Add a binding, or update in place when an identical trigger exists
    AddBinding { binding: MacroBinding },

    /// Remove a binding by id
    RemoveBinding { id: u64 },

    /// Enable or disable one binding
    SetBindingEnabled { id: u64, enabled: bool },

    /// Remove every binding referencing a macro name
    RemoveBindingsForMacro { name: String },

    /// List bindings and the service-level enabled flag
    ListBindings,

    /// Remove all bindings
    ClearBindings,

    /// Enable or disable trigger matching as a whole
    SetTriggersEnabled { enabled: bool },

    /// Get daemon status and version
    GetStatus,

    /// Switch this connection to a notification stream
    Subscribe,
}

/// IPC responses from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Acknowledgment of successful operation
    Ack,

    /// Blocking state of both devices
    State(Vec<BlockingSnapshot>),

    /// A single macro
    Macro(Macro),

    /// All stored macros
    Macros(Vec<Macro>),

    /// Bindings plus the service-level enabled flag
    Bindings {
        enabled: bool,
        bindings: Vec<MacroBinding>,
    },

    /// Status information
    Status {
        version: String,
        uptime_seconds: u64,
        macros_count: usize,
        bindings_count: usize,
        recording: bool,
        playing: bool,
    },

    /// One notification frame on a subscribed connection
    Event(Notification),

    /// Error response
    Error(String),
}

/// Errors shared across the daemon and client
#[derive(Error, Debug)]
pub enum InputLockError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("daemon error: {0}")]
    Daemon(String),
}

/// Serialization helpers for the IPC protocol
pub fn serialize<T: Serialize>(msg: &T) -> Vec<u8> {
    bincode::serialize(msg).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize message: {:?}", e);
        Vec::new()
    })
}

pub fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_event(code: u16, edge: InputEdge, modifiers: Modifiers) -> RawInputEvent {
        RawInputEvent {
            device: DeviceKind::Keyboard,
            code,
            edge,
            modifiers,
            position: None,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_macro_serialization_roundtrip() {
        let mut m = Macro::new(
            "login",
            vec![
                MacroEvent { offset_ms: 0, action: MacroAction::KeyDown(30) },
                MacroEvent { offset_ms: 50, action: MacroAction::KeyUp(30) },
                MacroEvent { offset_ms: 120, action: MacroAction::MouseMove { x: 10, y: 20 } },
                MacroEvent { offset_ms: 200, action: MacroAction::Text("hi".to_string()) },
            ],
        );
        m.execution = ExecutionMode::RandomInterval(100, 500);

        let bytes = serialize(&m);
        let back: Macro = deserialize(&bytes).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_advanced_config_category_flags() {
        let mut config = AdvancedConfig::default();
        config.blocked.insert(Control::Key(30));
        config.block_function_keys = true;

        assert!(config.is_blocked(&Control::Key(30)));
        assert!(config.is_blocked(&Control::Key(59))); // F1
        assert!(!config.is_blocked(&Control::Key(31)));
        assert!(!config.is_blocked(&Control::MouseWheel));

        config.block_mouse_wheel = true;
        assert!(config.is_blocked(&Control::MouseWheel));
    }

    #[test]
    fn test_selection_never_blocks() {
        let mut config = AdvancedConfig::default();
        config.selected.insert(Control::Key(30));
        assert!(!config.is_blocked(&Control::Key(30)));

        config.apply_selection();
        assert!(config.is_blocked(&Control::Key(30)));
        assert!(config.selected.is_empty());
    }

    #[test]
    fn test_trigger_matching() {
        let trigger = Trigger {
            device: DeviceKind::Keyboard,
            code: 30,
            modifiers: Modifiers { ctrl: true, ..Modifiers::NONE },
            edge: TriggerEdge::Down,
        };

        let held = Modifiers { ctrl: true, shift: true, ..Modifiers::NONE };
        assert!(trigger.matches(&key_event(30, InputEdge::Down, held)));
        // Missing required modifier
        assert!(!trigger.matches(&key_event(30, InputEdge::Down, Modifiers::NONE)));
        // Wrong edge
        assert!(!trigger.matches(&key_event(30, InputEdge::Up, held)));
        // Wrong code
        assert!(!trigger.matches(&key_event(31, InputEdge::Down, held)));
    }

    #[test]
    fn test_request_serialization() {
        let request = Request::PlayMacro {
            name: "login".to_string(),
            mode: Some(ExecutionMode::Repeat(3)),
            repeat_count: None,
        };
        let bytes = serialize(&request);
        let back: Request = deserialize(&bytes).unwrap();
        assert!(matches!(back, Request::PlayMacro { .. }));
    }
}
