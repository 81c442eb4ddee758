use inputlock_common::{ExecutionMode, Macro, MacroAction, MacroEvent, Notification};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::blocking::BlockingStateMachine;
use crate::config::ConfigManager;
use crate::injector::Injector;
use crate::Notifier;

/// Playback speed bounds; requested multipliers are clamped into this range.
pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 10.0;

/// Pause between iterations in Repeat and Loop modes.
const ITERATION_PAUSE_MS: u64 = 100;

/// Granularity of cancellable waits. Long delays are slept in chunks of
/// this size so stop and pause take effect promptly.
const WAIT_CHUNK_MS: u64 = 50;

const PLAYBACK_REASON: &str = "macro playback";
const PLAYBACK_DONE_REASON: &str = "macro playback finished";

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("macro '{0}' not found")]
    NotFound(String),
    #[error("macro '{0}' is disabled")]
    Disabled(String),
    #[error("macro '{0}' has no events")]
    Empty(String),
    #[error("until-condition execution is not implemented")]
    UnsupportedMode,
    #[error("playback of '{0}' already in progress")]
    Busy(String),
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerSettings {
    pub speed: f64,
    /// When false, recorded gaps are ignored and a fixed delay is used
    /// between events instead.
    pub respect_timing: bool,
    pub custom_delay_ms: u64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            speed: 1.0,
            respect_timing: true,
            custom_delay_ms: 50,
        }
    }
}

struct ActivePlayback {
    name: String,
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    prior_keyboard_blocked: bool,
    prior_mouse_blocked: bool,
}

/// Timing-accurate macro playback.
///
/// Single-flight: at most one macro plays at a time. Blocking is suspended
/// on both devices for the duration of playback and the prior flags are
/// restored afterwards, whether playback completed or was cancelled.
///
/// Cloning shares all state; the playback task runs on a clone.
#[derive(Clone)]
pub struct MacroPlayer {
    injector: Arc<RwLock<dyn Injector + Send + Sync>>,
    keyboard: Arc<StdMutex<BlockingStateMachine>>,
    mouse: Arc<StdMutex<BlockingStateMachine>>,
    store: Arc<ConfigManager>,
    notifier: Notifier,
    settings: Arc<StdMutex<PlayerSettings>>,
    active: Arc<StdMutex<Option<ActivePlayback>>>,
}

impl MacroPlayer {
    pub fn new(
        injector: Arc<RwLock<dyn Injector + Send + Sync>>,
        keyboard: Arc<StdMutex<BlockingStateMachine>>,
        mouse: Arc<StdMutex<BlockingStateMachine>>,
        store: Arc<ConfigManager>,
        notifier: Notifier,
    ) -> Self {
        Self {
            injector,
            keyboard,
            mouse,
            store,
            notifier,
            settings: Arc::new(StdMutex::new(PlayerSettings::default())),
            active: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    pub fn current(&self) -> Option<String> {
        self.active.lock().unwrap().as_ref().map(|a| a.name.clone())
    }

    /// Set the speed multiplier, clamped to the supported range.
    pub fn set_speed(&self, speed: f64) {
        let clamped = speed.clamp(MIN_SPEED, MAX_SPEED);
        if (clamped - speed).abs() > f64::EPSILON {
            warn!("Playback speed {} clamped to {}", speed, clamped);
        }
        self.settings.lock().unwrap().speed = clamped;
    }

    pub fn speed(&self) -> f64 {
        self.settings.lock().unwrap().speed
    }

    /// Configure whether recorded gaps are honored, and the fixed
    /// inter-event delay used when they are not.
    pub fn set_timing(&self, respect_timing: bool, custom_delay_ms: u64) {
        let mut settings = self.settings.lock().unwrap();
        settings.respect_timing = respect_timing;
        settings.custom_delay_ms = custom_delay_ms;
    }

    /// Start playback of a stored macro. `mode` overrides the macro's own
    /// execution mode; `repeat_count` forces Repeat with that count.
    pub async fn play(
        &self,
        name: &str,
        mode: Option<ExecutionMode>,
        repeat_count: Option<u32>,
    ) -> Result<(), PlayerError> {
        let entry = self
            .store
            .get_macro(name)
            .await
            .ok_or_else(|| PlayerError::NotFound(name.to_string()))?;

        if !entry.enabled {
            return Err(PlayerError::Disabled(entry.name));
        }
        if entry.events.is_empty() {
            return Err(PlayerError::Empty(entry.name));
        }

        let mode = match repeat_count {
            Some(count) => ExecutionMode::Repeat(count.max(1)),
            None => mode.unwrap_or(entry.execution),
        };
        if mode == ExecutionMode::UntilCondition {
            return Err(PlayerError::UnsupportedMode);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));

        // Claim the single playback slot and suspend blocking atomically
        // with respect to other play() calls.
        {
            let mut active = self.active.lock().unwrap();
            if let Some(current) = active.as_ref() {
                return Err(PlayerError::Busy(current.name.clone()));
            }

            let prior_keyboard_blocked = {
                let mut machine = self.keyboard.lock().unwrap();
                let prior = machine.is_blocked();
                if prior {
                    machine.set_blocked(false, PLAYBACK_REASON);
                }
                prior
            };
            let prior_mouse_blocked = {
                let mut machine = self.mouse.lock().unwrap();
                let prior = machine.is_blocked();
                if prior {
                    machine.set_blocked(false, PLAYBACK_REASON);
                }
                prior
            };

            *active = Some(ActivePlayback {
                name: entry.name.clone(),
                stop: Arc::clone(&stop),
                paused: Arc::clone(&paused),
                prior_keyboard_blocked,
                prior_mouse_blocked,
            });
        }

        info!("Starting playback of '{}' ({:?})", entry.name, mode);
        self.notifier.publish(Notification::PlaybackStarted {
            name: entry.name.clone(),
        });

        let player = self.clone();
        let settings = *self.settings.lock().unwrap();
        tokio::spawn(async move {
            let cancelled = player
                .run_loop(&entry, mode, settings, &stop, &paused)
                .await;
            player.finish(&entry.name, cancelled).await;
        });

        Ok(())
    }

    /// Request cancellation of the current playback. Returns whether a
    /// playback was running.
    pub fn stop(&self) -> bool {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(playback) => {
                info!("Stopping playback of '{}'", playback.name);
                playback.stop.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Pause or resume the current playback at the next event boundary.
    /// Returns whether a playback was running.
    pub fn set_paused(&self, pause: bool) -> bool {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(playback) => {
                playback.paused.store(pause, Ordering::SeqCst);
                let notification = if pause {
                    Notification::PlaybackPaused { name: playback.name.clone() }
                } else {
                    Notification::PlaybackResumed { name: playback.name.clone() }
                };
                self.notifier.publish(notification);
                true
            }
            None => false,
        }
    }

    /// Iteration loop for one playback session. Returns true if cancelled.
    async fn run_loop(
        &self,
        entry: &Macro,
        mode: ExecutionMode,
        settings: PlayerSettings,
        stop: &AtomicBool,
        paused: &AtomicBool,
    ) -> bool {
        let mut iteration: u32 = 0;
        loop {
            if !self.execute_once(&entry.events, settings, stop, paused).await {
                return true;
            }
            iteration += 1;

            let pause_ms = match mode {
                ExecutionMode::Once => return false,
                ExecutionMode::Repeat(count) => {
                    if iteration >= count {
                        return false;
                    }
                    ITERATION_PAUSE_MS
                }
                ExecutionMode::Loop => ITERATION_PAUSE_MS,
                ExecutionMode::Interval(ms) => ms,
                ExecutionMode::RandomInterval(min, max) => random_between(min, max),
                // Rejected by play() validation
                ExecutionMode::UntilCondition => return false,
            };

            if !wait_cancellable(pause_ms, stop).await {
                return true;
            }
        }
    }

    /// Execute the event list once. Returns false if cancelled mid-run.
    async fn execute_once(
        &self,
        events: &[MacroEvent],
        settings: PlayerSettings,
        stop: &AtomicBool,
        paused: &AtomicBool,
    ) -> bool {
        let total = events.len();
        let mut previous_offset: u64 = 0;

        for (index, event) in events.iter().enumerate() {
            // Pause holds at event boundaries so a resumed run never splits
            // a press/release pair around an unbounded gap.
            while paused.load(Ordering::SeqCst) {
                if stop.load(Ordering::SeqCst) {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(WAIT_CHUNK_MS)).await;
            }

            let wait_ms = if settings.respect_timing {
                let gap = event.offset_ms.saturating_sub(previous_offset);
                scale(gap, settings.speed)
            } else if index > 0 {
                settings.custom_delay_ms
            } else {
                0
            };
            previous_offset = event.offset_ms;
            if !wait_cancellable(wait_ms, stop).await {
                return false;
            }

            let success = self.execute_action(&event.action, settings.speed, stop).await;
            self.notifier.publish(Notification::EventExecuted { index, success });
            self.notifier.publish(Notification::ProgressChanged {
                current: index + 1,
                total,
                percentage: (index + 1) as f32 / total as f32 * 100.0,
            });

            if stop.load(Ordering::SeqCst) {
                return false;
            }
        }
        true
    }

    async fn execute_action(&self, action: &MacroAction, speed: f64, stop: &AtomicBool) -> bool {
        let injector = self.injector.read().await;
        let result = match action {
            MacroAction::KeyDown(code) => injector.key_press(*code).await,
            MacroAction::KeyUp(code) => injector.key_release(*code).await,
            MacroAction::MouseDown(button) => injector.mouse_press(*button).await,
            MacroAction::MouseUp(button) => injector.mouse_release(*button).await,
            MacroAction::MouseMove { x, y } => injector.mouse_move_abs(*x, *y).await,
            MacroAction::MouseWheel(amount) => injector.mouse_scroll(*amount).await,
            MacroAction::Delay(ms) => {
                wait_cancellable(scale(*ms, speed), stop).await;
                Ok(())
            }
            MacroAction::Text(text) => injector.type_string(text).await,
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to execute {:?}: {}", action, e);
                false
            }
        }
    }

    /// Restore blocking, release the slot, update run statistics, notify.
    async fn finish(&self, name: &str, cancelled: bool) {
        let playback = self.active.lock().unwrap().take();
        if let Some(playback) = playback {
            if playback.prior_keyboard_blocked {
                self.keyboard
                    .lock()
                    .unwrap()
                    .set_blocked(true, PLAYBACK_DONE_REASON);
            }
            if playback.prior_mouse_blocked {
                self.mouse
                    .lock()
                    .unwrap()
                    .set_blocked(true, PLAYBACK_DONE_REASON);
            }
        }

        if let Err(e) = self.store.update_macro_stats(name).await {
            warn!("Failed to update stats for '{}': {}", name, e);
        }

        info!("Playback of '{}' {}", name, if cancelled { "cancelled" } else { "completed" });
        self.notifier.publish(Notification::PlaybackStopped {
            name: name.to_string(),
            cancelled,
        });
    }
}

/// Scale a delay by the speed multiplier; 2.0 halves every gap.
fn scale(ms: u64, speed: f64) -> u64 {
    if ms == 0 {
        return 0;
    }
    (ms as f64 / speed).round() as u64
}

/// Sleep in chunks, aborting early when the stop flag is raised. Returns
/// false if cancelled.
async fn wait_cancellable(ms: u64, stop: &AtomicBool) -> bool {
    let mut remaining = ms;
    while remaining > 0 {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let chunk = remaining.min(WAIT_CHUNK_MS);
        tokio::time::sleep(Duration::from_millis(chunk)).await;
        remaining -= chunk;
    }
    !stop.load(Ordering::SeqCst)
}

/// Uniform-ish jitter without an RNG dependency; millisecond-scale
/// scheduling noise is all RandomInterval needs.
fn random_between(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    let jitter = hasher.finish() % (max - min + 1);
    debug!("RandomInterval wait: {}ms", min + jitter);
    min + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Notifier;
    use inputlock_common::DeviceKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::TempDir;

    struct MockInjector {
        calls: AtomicUsize,
    }

    impl MockInjector {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl Injector for MockInjector {
        async fn initialize(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        async fn key_press(&self, _key_code: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn key_release(&self, _key_code: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn mouse_press(&self, _button: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        async fn mouse_release(&self, _button: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        async fn mouse_move_abs(&self, _x: i32, _y: i32) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        async fn mouse_scroll(&self, _amount: i32) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
        async fn type_string(&self, _text: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    async fn setup(dir: &TempDir) -> (Arc<MacroPlayer>, Arc<ConfigManager>, Notifier, Arc<StdMutex<BlockingStateMachine>>) {
        let notifier = Notifier::new();
        let keyboard = Arc::new(StdMutex::new(BlockingStateMachine::new(
            DeviceKind::Keyboard,
            notifier.clone(),
        )));
        let mouse = Arc::new(StdMutex::new(BlockingStateMachine::new(
            DeviceKind::Mouse,
            notifier.clone(),
        )));
        let store = Arc::new(ConfigManager::with_root(dir.path()));
        store.load().await.unwrap();

        let injector: Arc<RwLock<dyn Injector + Send + Sync>> =
            Arc::new(RwLock::new(MockInjector::new()));
        let player = Arc::new(MacroPlayer::new(
            injector,
            Arc::clone(&keyboard),
            mouse,
            Arc::clone(&store),
            notifier.clone(),
        ));
        (player, store, notifier, keyboard)
    }

    fn tap_macro(name: &str, gap_ms: u64) -> Macro {
        Macro::new(
            name,
            vec![
                MacroEvent { offset_ms: 0, action: MacroAction::KeyDown(30) },
                MacroEvent { offset_ms: gap_ms, action: MacroAction::KeyUp(30) },
            ],
        )
    }

    async fn wait_until_idle(player: &Arc<MacroPlayer>) {
        for _ in 0..100 {
            if !player.is_playing() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("playback did not finish");
    }

    #[tokio::test]
    async fn test_unknown_macro_rejected() {
        let dir = TempDir::new().unwrap();
        let (player, _store, _n, _k) = setup(&dir).await;
        assert!(matches!(
            player.play("missing", None, None).await,
            Err(PlayerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_and_empty_macros_rejected() {
        let dir = TempDir::new().unwrap();
        let (player, store, _n, _k) = setup(&dir).await;

        let mut disabled = tap_macro("disabled", 0);
        disabled.enabled = false;
        store.save_macro(disabled).await.unwrap();
        assert!(matches!(
            player.play("disabled", None, None).await,
            Err(PlayerError::Disabled(_))
        ));

        store.save_macro(Macro::new("empty", vec![])).await.unwrap();
        assert!(matches!(
            player.play("empty", None, None).await,
            Err(PlayerError::Empty(_))
        ));
    }

    #[tokio::test]
    async fn test_until_condition_rejected() {
        let dir = TempDir::new().unwrap();
        let (player, store, _n, _k) = setup(&dir).await;
        store.save_macro(tap_macro("tap", 0)).await.unwrap();
        assert!(matches!(
            player.play("tap", Some(ExecutionMode::UntilCondition), None).await,
            Err(PlayerError::UnsupportedMode)
        ));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let dir = TempDir::new().unwrap();
        let (player, store, _n, _k) = setup(&dir).await;
        store.save_macro(tap_macro("slow", 500)).await.unwrap();

        player.play("slow", None, None).await.unwrap();
        assert!(player.is_playing());
        assert!(matches!(
            player.play("slow", None, None).await,
            Err(PlayerError::Busy(_))
        ));

        player.stop();
        wait_until_idle(&player).await;
    }

    #[tokio::test]
    async fn test_speed_scales_gaps() {
        let dir = TempDir::new().unwrap();
        let (player, store, _n, _k) = setup(&dir).await;
        store.save_macro(tap_macro("tap", 200)).await.unwrap();

        player.set_speed(2.0);
        let started = Instant::now();
        player.play("tap", None, None).await.unwrap();
        wait_until_idle(&player).await;

        // 200ms gap at 2x should run in about 100ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(190), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_fixed_delay_ignores_recorded_gaps() {
        let dir = TempDir::new().unwrap();
        let (player, store, _n, _k) = setup(&dir).await;
        store.save_macro(tap_macro("slow", 2000)).await.unwrap();

        player.set_timing(false, 10);
        let started = Instant::now();
        player.play("slow", None, None).await.unwrap();
        wait_until_idle(&player).await;

        // The 2000ms recorded gap is replaced by the 10ms fixed delay
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_speed_clamped() {
        let dir = TempDir::new().unwrap();
        let (player, _store, _n, _k) = setup(&dir).await;
        player.set_speed(100.0);
        assert_eq!(player.speed(), MAX_SPEED);
        player.set_speed(0.0);
        assert_eq!(player.speed(), MIN_SPEED);
    }

    #[tokio::test]
    async fn test_blocking_suspended_and_restored() {
        let dir = TempDir::new().unwrap();
        let (player, store, _n, keyboard) = setup(&dir).await;
        store.save_macro(tap_macro("tap", 50)).await.unwrap();

        keyboard.lock().unwrap().set_blocked(true, "test");
        player.play("tap", None, None).await.unwrap();
        assert!(!keyboard.lock().unwrap().is_blocked());

        wait_until_idle(&player).await;
        assert!(keyboard.lock().unwrap().is_blocked());
        assert_eq!(
            keyboard.lock().unwrap().last_toggle_reason(),
            Some(PLAYBACK_DONE_REASON)
        );
    }

    #[tokio::test]
    async fn test_cancel_restores_state_and_notifies() {
        let dir = TempDir::new().unwrap();
        let (player, store, notifier, keyboard) = setup(&dir).await;
        store.save_macro(tap_macro("slow", 2000)).await.unwrap();

        keyboard.lock().unwrap().set_blocked(true, "test");
        let mut rx = notifier.subscribe();

        player.play("slow", None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(player.stop());
        wait_until_idle(&player).await;
        // finish() publishes PlaybackStopped after releasing the slot
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(keyboard.lock().unwrap().is_blocked());

        let mut saw_cancelled_stop = false;
        while let Ok(notification) = rx.try_recv() {
            if let Notification::PlaybackStopped { cancelled, .. } = notification {
                saw_cancelled_stop = cancelled;
            }
        }
        assert!(saw_cancelled_stop);
    }

    #[tokio::test]
    async fn test_repeat_runs_n_times() {
        let dir = TempDir::new().unwrap();
        let (player, store, notifier, _k) = setup(&dir).await;
        store.save_macro(tap_macro("tap", 0)).await.unwrap();

        let mut rx = notifier.subscribe();
        player.play("tap", None, Some(3)).await.unwrap();
        wait_until_idle(&player).await;

        let mut executed = 0;
        while let Ok(notification) = rx.try_recv() {
            if matches!(notification, Notification::EventExecuted { .. }) {
                executed += 1;
            }
        }
        // Two events per iteration, three iterations
        assert_eq!(executed, 6);
    }

    #[tokio::test]
    async fn test_stats_updated_after_run() {
        let dir = TempDir::new().unwrap();
        let (player, store, _n, _k) = setup(&dir).await;
        store.save_macro(tap_macro("tap", 0)).await.unwrap();

        player.play("tap", None, None).await.unwrap();
        wait_until_idle(&player).await;
        // finish() updates stats after releasing the slot
        tokio::time::sleep(Duration::from_millis(50)).await;

        let entry = store.get_macro("tap").await.unwrap();
        assert_eq!(entry.run_count, 1);
        assert!(entry.last_run_unix_secs.is_some());
    }
}
