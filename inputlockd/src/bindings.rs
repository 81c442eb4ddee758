use inputlock_common::{MacroBinding, Notification, RawInputEvent, Trigger};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::player::MacroPlayer;
use crate::recorder::MacroRecorder;
use crate::Notifier;

pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("binding {0} not found")]
    NotFound(u64),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// On-disk shape of the bindings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BindingsFile {
    enabled: bool,
    bindings: Vec<MacroBinding>,
}

struct Inner {
    enabled: bool,
    bindings: Vec<MacroBinding>,
    last_fired: HashMap<u64, Instant>,
    next_id: u64,
}

/// Persistent trigger-to-macro bindings with debounce.
///
/// The scan-and-stamp step runs under one lock so a burst of identical
/// trigger events cannot double-fire a binding; only the macro launch
/// itself happens outside it.
pub struct TriggerService {
    inner: StdMutex<Inner>,
    path: PathBuf,
    debounce: Duration,
    recorder: Arc<StdMutex<MacroRecorder>>,
    player: Arc<MacroPlayer>,
    notifier: Notifier,
}

impl TriggerService {
    /// Load bindings from disk, or start empty if the file is missing or
    /// unreadable. A bad bindings file must not keep the daemon down.
    pub async fn load(
        path: PathBuf,
        debounce_ms: u64,
        recorder: Arc<StdMutex<MacroRecorder>>,
        player: Arc<MacroPlayer>,
        notifier: Notifier,
    ) -> Self {
        let file = match fs::read_to_string(&path).await {
            Ok(content) => match serde_yaml::from_str::<BindingsFile>(&content) {
                Ok(file) => {
                    info!("Loaded {} bindings from {}", file.bindings.len(), path.display());
                    file
                }
                Err(e) => {
                    warn!("Failed to parse {}: {}, starting empty", path.display(), e);
                    BindingsFile { enabled: true, bindings: Vec::new() }
                }
            },
            Err(_) => BindingsFile { enabled: true, bindings: Vec::new() },
        };

        let next_id = file.bindings.iter().map(|b| b.id).max().unwrap_or(0) + 1;
        Self {
            inner: StdMutex::new(Inner {
                enabled: file.enabled,
                bindings: file.bindings,
                last_fired: HashMap::new(),
                next_id,
            }),
            path,
            debounce: Duration::from_millis(debounce_ms),
            recorder,
            player,
            notifier,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    pub fn list(&self) -> (bool, Vec<MacroBinding>) {
        let inner = self.inner.lock().unwrap();
        (inner.enabled, inner.bindings.clone())
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().bindings.len()
    }

    /// Enable or disable trigger matching globally. Bindings are kept.
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), BindingError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.enabled = enabled;
        }
        info!("Triggers {}", if enabled { "enabled" } else { "disabled" });
        self.persist().await
    }

    /// Insert a binding, or update the existing binding with the same
    /// trigger. Returns the stored binding with its assigned id.
    pub async fn add_or_update(
        &self,
        mut binding: MacroBinding,
    ) -> Result<MacroBinding, BindingError> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.bindings.iter_mut().find(|b| b.trigger == binding.trigger) {
                Some(existing) => {
                    binding.id = existing.id;
                    *existing = binding.clone();
                    debug!("Updated binding {} -> '{}'", binding.id, binding.macro_name);
                }
                None => {
                    binding.id = inner.next_id;
                    inner.next_id += 1;
                    inner.bindings.push(binding.clone());
                    debug!("Added binding {} -> '{}'", binding.id, binding.macro_name);
                }
            }
        }
        self.persist().await?;
        Ok(binding)
    }

    pub async fn remove(&self, id: u64) -> Result<(), BindingError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.bindings.len();
            inner.bindings.retain(|b| b.id != id);
            if inner.bindings.len() == before {
                return Err(BindingError::NotFound(id));
            }
            inner.last_fired.remove(&id);
        }
        self.persist().await
    }

    pub async fn set_binding_enabled(&self, id: u64, enabled: bool) -> Result<(), BindingError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let binding = inner
                .bindings
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or(BindingError::NotFound(id))?;
            binding.enabled = enabled;
        }
        self.persist().await
    }

    /// Remove every binding that targets the named macro. Returns the
    /// number removed.
    pub async fn remove_for_macro(&self, name: &str) -> Result<usize, BindingError> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.bindings.len();
            inner.bindings.retain(|b| b.macro_name != name);
            before - inner.bindings.len()
        };
        if removed > 0 {
            info!("Removed {} bindings for macro '{}'", removed, name);
            self.persist().await?;
        }
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<(), BindingError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.bindings.clear();
            inner.last_fired.clear();
        }
        info!("Cleared all bindings");
        self.persist().await
    }

    /// Feed one raw event from the hook stream. Fires at most one macro
    /// per matching binding, subject to the debounce window.
    pub async fn handle_event(&self, event: &RawInputEvent) {
        // Triggers are inert while recording (the press belongs in the
        // recording) and while a macro is already playing.
        if self.recorder.lock().unwrap().is_recording() || self.player.is_playing() {
            return;
        }

        let to_fire = self.matching_macros(event, Instant::now());
        for name in to_fire {
            info!("Trigger fired for macro '{}'", name);
            if let Err(e) = self.player.play(&name, None, None).await {
                warn!("Triggered playback of '{}' failed: {}", name, e);
            }
        }
    }

    /// Scan bindings and stamp debounce state in one critical section.
    fn matching_macros(&self, event: &RawInputEvent, now: Instant) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return Vec::new();
        }

        let debounce = self.debounce;
        let mut fired = Vec::new();
        let Inner { bindings, last_fired, .. } = &mut *inner;
        for binding in bindings.iter() {
            if !binding.enabled || !binding.trigger.matches(event) {
                continue;
            }
            if let Some(last) = last_fired.get(&binding.id) {
                if now.duration_since(*last) < debounce {
                    debug!("Binding {} debounced", binding.id);
                    continue;
                }
            }
            last_fired.insert(binding.id, now);
            fired.push(binding.macro_name.clone());
        }
        fired
    }

    async fn persist(&self) -> Result<(), BindingError> {
        let file = {
            let inner = self.inner.lock().unwrap();
            BindingsFile {
                enabled: inner.enabled,
                bindings: inner.bindings.clone(),
            }
        };
        let content = serde_yaml::to_string(&file)?;
        fs::write(&self.path, content).await?;
        self.notifier.publish(Notification::BindingsChanged);
        Ok(())
    }
}

/// Convenience constructor for a binding without an id; the service
/// assigns one on insert.
pub fn new_binding(macro_name: impl Into<String>, trigger: Trigger) -> MacroBinding {
    MacroBinding {
        id: 0,
        macro_name: macro_name.into(),
        trigger,
        enabled: true,
    }
}
