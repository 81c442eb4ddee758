use evdev::{Device as EvdevDevice, InputEventKind, Key, RelativeAxisType};
use inputlock_common::{DeviceKind, InputEdge, Modifiers, RawInputEvent};
use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blocking::BlockingStateMachine;
use crate::emergency::EmergencyUnlock;
use crate::injector::UinputInjector;

// EVIOCGRAB ioctl number for exclusive device access
const EVIOCGRAB: u64 = 0x40044590;

// Capacity of the raw event fan-out channel; lagging subscribers drop
// frames instead of backpressuring the reader.
const RAW_CHANNEL_SIZE: usize = 1024;

// Modifier key codes
const KEY_LEFTCTRL: u16 = 29;
const KEY_LEFTSHIFT: u16 = 42;
const KEY_RIGHTSHIFT: u16 = 54;
const KEY_LEFTALT: u16 = 56;
const KEY_RIGHTCTRL: u16 = 97;
const KEY_RIGHTALT: u16 = 100;
const KEY_LEFTMETA: u16 = 125;
const KEY_RIGHTMETA: u16 = 126;

const REL_X_CODE: u16 = 0x00;
const REL_Y_CODE: u16 = 0x01;
const REL_WHEEL_CODE: u16 = 0x08;

/// Errors from installing or operating the interception layer
#[derive(Error, Debug)]
pub enum HookError {
    #[error("no {0} device found to grab")]
    NoDevice(DeviceKind),
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("EVIOCGRAB failed for {path}: {source}")]
    Grab { path: PathBuf, source: io::Error },
    #[error("device scan failed: {0}")]
    Scan(io::Error),
}

/// Which physical devices to grab. Empty paths mean auto-detection.
#[derive(Debug, Clone, Default)]
pub struct HookConfig {
    pub keyboard_path: Option<PathBuf>,
    pub mouse_path: Option<PathBuf>,
}

/// One exclusively grabbed physical device
struct GrabbedDevice {
    kind: DeviceKind,
    path: PathBuf,
    name: String,
    fd: RawFd,
}

/// The interception layer.
///
/// Owns the exclusive grabs and the per-device reader tasks for its whole
/// lifetime. While installed, every event from the grabbed devices passes
/// through a reader before any other process can see it; the reader is the
/// latency-critical path and performs only the emergency check, the
/// suppression decision, a non-blocking broadcast publish, and the
/// pass-through write.
pub struct InputHook {
    grabs: Vec<GrabbedDevice>,
    handles: Vec<JoinHandle<()>>,
    raw_tx: broadcast::Sender<RawInputEvent>,
    running: Arc<AtomicBool>,
}

impl InputHook {
    /// Grab the configured devices and start the reader tasks. Failure to
    /// grab a required device is fatal to startup and propagates.
    pub fn install(
        config: &HookConfig,
        keyboard: Arc<Mutex<BlockingStateMachine>>,
        mouse: Arc<Mutex<BlockingStateMachine>>,
        emergency: Arc<Mutex<EmergencyUnlock>>,
        output: Arc<UinputInjector>,
    ) -> Result<Self, HookError> {
        let (raw_tx, _) = broadcast::channel(RAW_CHANNEL_SIZE);
        let running = Arc::new(AtomicBool::new(true));
        // One modifier state for all readers, so mouse events carry the
        // modifiers held on the keyboard.
        let modifiers = Arc::new(Mutex::new(ModifierTracker::default()));

        let keyboard_path = match &config.keyboard_path {
            Some(path) => path.clone(),
            None => discover_device(DeviceKind::Keyboard)?,
        };
        let mouse_path = match &config.mouse_path {
            Some(path) => path.clone(),
            None => discover_device(DeviceKind::Mouse)?,
        };

        let mut hook = Self {
            grabs: Vec::new(),
            handles: Vec::new(),
            raw_tx,
            running,
        };

        hook.grab_and_spawn(
            DeviceKind::Keyboard,
            &keyboard_path,
            keyboard,
            Some(emergency),
            Arc::clone(&output),
            Arc::clone(&modifiers),
        )?;
        hook.grab_and_spawn(DeviceKind::Mouse, &mouse_path, mouse, None, output, modifiers)?;

        info!("Input hook installed on {} devices", hook.grabs.len());
        Ok(hook)
    }

    /// Subscribe to the normalized raw event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RawInputEvent> {
        self.raw_tx.subscribe()
    }

    /// Release all grabs. Failures are logged and non-fatal; process exit
    /// releases the grabs anyway.
    pub fn uninstall(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        for grab in self.grabs.drain(..) {
            info!("Ungrabbing {} ({})", grab.name, grab.path.display());
            let result = unsafe { libc::ioctl(grab.fd, EVIOCGRAB, 0 as libc::c_int) };
            if result < 0 {
                warn!(
                    "Failed to ungrab {}: {}",
                    grab.path.display(),
                    io::Error::last_os_error()
                );
            }
        }

        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }

    fn grab_and_spawn(
        &mut self,
        kind: DeviceKind,
        path: &Path,
        machine: Arc<Mutex<BlockingStateMachine>>,
        emergency: Option<Arc<Mutex<EmergencyUnlock>>>,
        output: Arc<UinputInjector>,
        modifiers: Arc<Mutex<ModifierTracker>>,
    ) -> Result<(), HookError> {
        let device = EvdevDevice::open(path).map_err(|e| HookError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;

        let name = device.name().unwrap_or("Unknown Device").to_string();
        let fd = device.as_raw_fd();

        // Grab exclusively; once this succeeds no other process sees the
        // device's events until we release it.
        let result = unsafe { libc::ioctl(fd, EVIOCGRAB, 1 as libc::c_int) };
        if result < 0 {
            let err = io::Error::last_os_error();
            error!("Failed to grab {} ({}): {}", name, path.display(), err);
            return Err(HookError::Grab {
                path: path.to_path_buf(),
                source: err,
            });
        }

        info!("Grabbed {} device: {} ({})", kind, name, path.display());

        self.grabs.push(GrabbedDevice {
            kind,
            path: path.to_path_buf(),
            name,
            fd,
        });

        let handle = spawn_reader(
            kind,
            device,
            machine,
            emergency,
            output,
            modifiers,
            self.raw_tx.clone(),
            Arc::clone(&self.running),
        );
        self.handles.push(handle);

        Ok(())
    }
}

/// Spawn the blocking reader loop for one grabbed device.
fn spawn_reader(
    kind: DeviceKind,
    mut device: EvdevDevice,
    machine: Arc<Mutex<BlockingStateMachine>>,
    emergency: Option<Arc<Mutex<EmergencyUnlock>>>,
    output: Arc<UinputInjector>,
    modifiers: Arc<Mutex<ModifierTracker>>,
    raw_tx: broadcast::Sender<RawInputEvent>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        info!("Starting {} event reader", kind);

        let mut position: (i32, i32) = (0, 0);

        while running.load(Ordering::SeqCst) {
            let events = match device.fetch_events() {
                Ok(events) => events,
                Err(e) => {
                    error!("Error reading {} events: {}", kind, e);
                    break;
                }
            };

            for event in events {
                let type_ = event.event_type().0;
                let code = event.code();
                let value = event.value();

                let normalized = {
                    let mut tracker = modifiers.lock().unwrap();
                    normalize(kind, &event, &mut tracker, &mut position)
                };

                let suppressed = match &normalized {
                    Some(raw) => {
                        let verdict = decide(raw, emergency.as_ref(), &machine);
                        // Fan out after the emergency check so subscribers
                        // see the same pre-suppression stream the detector
                        // does; a send error just means no subscribers.
                        let _ = raw_tx.send(raw.clone());
                        verdict
                    }
                    // SYN pulses and unmodeled event kinds ride along with
                    // the surrounding events.
                    None => false,
                };

                if !suppressed {
                    if let Err(e) = output.forward_raw(type_, code, value) {
                        error!("Pass-through write failed: {}", e);
                    }
                }
            }
        }

        info!("{} event reader stopped", kind);
    })
}

/// The suppress/pass-through decision for one normalized event.
///
/// The emergency detector runs first, on the pre-suppression stream; a
/// completed chord forces pass-through regardless of the current mode.
pub(crate) fn decide(
    event: &RawInputEvent,
    emergency: Option<&Arc<Mutex<EmergencyUnlock>>>,
    machine: &Arc<Mutex<BlockingStateMachine>>,
) -> bool {
    if let Some(emergency) = emergency {
        if emergency.lock().unwrap().observe(event) {
            return false;
        }
    }
    machine.lock().unwrap().is_suppressed(event)
}

/// Convert one evdev event into the normalized form, updating the modifier
/// tracker and the accumulated mouse position.
fn normalize(
    kind: DeviceKind,
    event: &evdev::InputEvent,
    tracker: &mut ModifierTracker,
    position: &mut (i32, i32),
) -> Option<RawInputEvent> {
    match event.kind() {
        InputEventKind::Key(key) => {
            let code = key.0;
            let edge = match event.value() {
                1 | 2 => InputEdge::Down, // 2 = autorepeat
                0 => InputEdge::Up,
                _ => return None,
            };
            if kind == DeviceKind::Keyboard {
                tracker.update(code, matches!(edge, InputEdge::Down));
            }
            Some(RawInputEvent {
                device: kind,
                code,
                edge,
                modifiers: tracker.current(),
                position: (kind == DeviceKind::Mouse).then_some(*position),
                timestamp: Instant::now(),
            })
        }
        InputEventKind::RelAxis(axis) => {
            let value = event.value();
            let edge = match axis {
                RelativeAxisType::REL_X => {
                    position.0 += value;
                    InputEdge::Move { dx: value, dy: 0 }
                }
                RelativeAxisType::REL_Y => {
                    position.1 += value;
                    InputEdge::Move { dx: 0, dy: value }
                }
                RelativeAxisType::REL_WHEEL => InputEdge::Wheel { delta: value },
                _ => return None,
            };
            let code = match edge {
                InputEdge::Wheel { .. } => REL_WHEEL_CODE,
                _ => 0,
            };
            Some(RawInputEvent {
                device: kind,
                code,
                edge,
                modifiers: tracker.current(),
                position: Some(*position),
                timestamp: Instant::now(),
            })
        }
        _ => None,
    }
}

/// Tracks held modifier keys. Shared by all reader tasks: the keyboard
/// reader updates it, every reader stamps its events from it.
#[derive(Debug, Default)]
struct ModifierTracker {
    ctrl_left: bool,
    ctrl_right: bool,
    shift_left: bool,
    shift_right: bool,
    alt_left: bool,
    alt_right: bool,
    meta_left: bool,
    meta_right: bool,
}

impl ModifierTracker {
    fn update(&mut self, code: u16, pressed: bool) {
        match code {
            KEY_LEFTCTRL => self.ctrl_left = pressed,
            KEY_RIGHTCTRL => self.ctrl_right = pressed,
            KEY_LEFTSHIFT => self.shift_left = pressed,
            KEY_RIGHTSHIFT => self.shift_right = pressed,
            KEY_LEFTALT => self.alt_left = pressed,
            KEY_RIGHTALT => self.alt_right = pressed,
            KEY_LEFTMETA => self.meta_left = pressed,
            KEY_RIGHTMETA => self.meta_right = pressed,
            _ => {}
        }
    }

    fn current(&self) -> Modifiers {
        Modifiers {
            ctrl: self.ctrl_left || self.ctrl_right,
            alt: self.alt_left || self.alt_right,
            shift: self.shift_left || self.shift_right,
            meta: self.meta_left || self.meta_right,
        }
    }
}

/// Scan /dev/input for the first device of the requested class, skipping
/// our own virtual output device.
fn discover_device(kind: DeviceKind) -> Result<PathBuf, HookError> {
    for entry in fs::read_dir("/dev/input").map_err(HookError::Scan)? {
        let entry = entry.map_err(HookError::Scan)?;
        let path = entry.path();

        let is_event_node = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.starts_with("event"))
            .unwrap_or(false);
        if !is_event_node {
            continue;
        }

        let device = match EvdevDevice::open(&path) {
            Ok(device) => device,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        if device.name().unwrap_or("").contains("Inputlock Virtual") {
            continue;
        }

        if classify(&device) == Some(kind) {
            info!(
                "Auto-detected {} device: {} ({})",
                kind,
                device.name().unwrap_or("Unknown Device"),
                path.display()
            );
            return Ok(path);
        }
    }

    Err(HookError::NoDevice(kind))
}

/// Classify an event node by its advertised capabilities.
fn classify(device: &EvdevDevice) -> Option<DeviceKind> {
    let keys = device.supported_keys()?;

    if keys.contains(Key::BTN_LEFT) {
        let has_rel = device
            .supported_relative_axes()
            .map(|axes| axes.contains(RelativeAxisType::REL_X))
            .unwrap_or(false);
        if has_rel {
            return Some(DeviceKind::Mouse);
        }
    }

    if keys.contains(Key::KEY_A) && keys.contains(Key::KEY_SPACE) {
        return Some(DeviceKind::Keyboard);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::EmergencyConfig;
    use crate::Notifier;
    use inputlock_common::{AdvancedConfig, Control};

    fn chord_event() -> RawInputEvent {
        RawInputEvent {
            device: DeviceKind::Keyboard,
            code: 22, // KEY_U
            edge: InputEdge::Down,
            modifiers: Modifiers { ctrl: true, alt: true, ..Modifiers::NONE },
            position: None,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_modifier_tracker() {
        let mut tracker = ModifierTracker::default();
        assert_eq!(tracker.current(), Modifiers::NONE);

        tracker.update(KEY_LEFTCTRL, true);
        tracker.update(KEY_RIGHTSHIFT, true);
        let held = tracker.current();
        assert!(held.ctrl);
        assert!(held.shift);
        assert!(!held.alt);

        tracker.update(KEY_LEFTCTRL, false);
        assert!(!tracker.current().ctrl);
        // Other shift still held
        tracker.update(KEY_LEFTSHIFT, true);
        tracker.update(KEY_RIGHTSHIFT, false);
        assert!(tracker.current().shift);
    }

    #[test]
    fn test_mouse_events_carry_keyboard_modifiers() {
        let tracker = Arc::new(Mutex::new(ModifierTracker::default()));
        let mut position = (0, 0);

        let ctrl_down = evdev::InputEvent::new(evdev::EventType::KEY, KEY_LEFTCTRL, 1);
        let _ = normalize(
            DeviceKind::Keyboard,
            &ctrl_down,
            &mut tracker.lock().unwrap(),
            &mut position,
        );

        // The mouse reader stamps from the same tracker
        let btn_down = evdev::InputEvent::new(evdev::EventType::KEY, 272, 1); // BTN_LEFT
        let event = normalize(
            DeviceKind::Mouse,
            &btn_down,
            &mut tracker.lock().unwrap(),
            &mut position,
        )
        .unwrap();
        assert_eq!(event.device, DeviceKind::Mouse);
        assert!(event.modifiers.ctrl);

        let ctrl_up = evdev::InputEvent::new(evdev::EventType::KEY, KEY_LEFTCTRL, 0);
        let _ = normalize(
            DeviceKind::Keyboard,
            &ctrl_up,
            &mut tracker.lock().unwrap(),
            &mut position,
        );
        let event = normalize(
            DeviceKind::Mouse,
            &btn_down,
            &mut tracker.lock().unwrap(),
            &mut position,
        )
        .unwrap();
        assert!(!event.modifiers.ctrl);
    }

    #[test]
    fn test_decide_suppresses_under_simple_blocking() {
        let notifier = Notifier::new();
        let machine = Arc::new(Mutex::new(BlockingStateMachine::new(
            DeviceKind::Keyboard,
            notifier.clone(),
        )));
        let event = chord_event();

        assert!(!decide(&event, None, &machine));
        machine.lock().unwrap().set_blocked(true, "test");
        assert!(decide(&event, None, &machine));
    }

    #[test]
    fn test_emergency_runs_before_suppression() {
        // An advanced config that blocks the chord key itself must not be
        // able to starve the detector.
        let notifier = Notifier::new();
        let keyboard = Arc::new(Mutex::new(BlockingStateMachine::new(
            DeviceKind::Keyboard,
            notifier.clone(),
        )));
        let mouse = Arc::new(Mutex::new(BlockingStateMachine::new(
            DeviceKind::Mouse,
            notifier.clone(),
        )));

        let mut config = AdvancedConfig::default();
        config.blocked.insert(Control::Key(22));
        keyboard.lock().unwrap().set_advanced_mode(config, "test");
        keyboard.lock().unwrap().set_blocked(true, "test");
        mouse.lock().unwrap().set_blocked(true, "test");

        let emergency = Arc::new(Mutex::new(EmergencyUnlock::new(
            EmergencyConfig::default(),
            Arc::clone(&keyboard),
            Arc::clone(&mouse),
            notifier,
        )));

        let event = chord_event();
        // First two presses are still suppressed but counted
        assert!(decide(&event, Some(&emergency), &keyboard));
        assert!(decide(&event, Some(&emergency), &keyboard));
        // Third press completes the chord: pass-through and unblocked
        assert!(!decide(&event, Some(&emergency), &keyboard));
        assert!(!keyboard.lock().unwrap().is_blocked());
        assert!(!mouse.lock().unwrap().is_blocked());
    }
}
