//! Inputlock Daemon - Main Entry Point
//!
//! The privileged system daemon responsible for:
//! - Grabbing the physical keyboard and mouse exclusively
//! - Suppressing or passing through input per the blocking configuration
//! - Emergency unlock chord detection
//! - Macro recording, playback, and trigger bindings
//! - IPC communication with external clients

use inputlock_common::tracing;
use inputlockd::{
    bindings, blocking, config, emergency, hook, injector, ipc, player, recorder, DaemonState,
    Notifier,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    info!("Starting Inputlock Daemon v{}", env!("CARGO_PKG_VERSION"));

    // Exclusive grabs and uinput need root
    if !nix::unistd::Uid::effective().is_root() {
        error!("Inputlock daemon must be started as root for device access");
        return Err("Insufficient privileges".into());
    }

    // Load configuration
    let config_manager = Arc::new(config::ConfigManager::new());
    config_manager.load().await?;
    let settings = config_manager.settings().await;
    info!("Using socket path: {}", settings.daemon.socket_path);

    let notifier = Notifier::new();

    // Virtual output device; without it there is neither pass-through nor
    // playback, so failure here is fatal.
    let output = Arc::new(injector::UinputInjector::new()?);
    output
        .initialize()
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
    info!("Uinput injector initialized");

    // Per-device blocking state machines
    let keyboard = Arc::new(Mutex::new(blocking::BlockingStateMachine::new(
        inputlockd::DeviceKind::Keyboard,
        notifier.clone(),
    )));
    let mouse = Arc::new(Mutex::new(blocking::BlockingStateMachine::new(
        inputlockd::DeviceKind::Mouse,
        notifier.clone(),
    )));

    let emergency = Arc::new(Mutex::new(emergency::EmergencyUnlock::new(
        settings.emergency.clone(),
        Arc::clone(&keyboard),
        Arc::clone(&mouse),
        notifier.clone(),
    )));

    // Install the interception layer before serving any requests; a daemon
    // that cannot grab its devices has nothing to offer.
    let hook_config = hook::HookConfig {
        keyboard_path: settings.devices.keyboard_path.clone().map(PathBuf::from),
        mouse_path: settings.devices.mouse_path.clone().map(PathBuf::from),
    };
    let mut input_hook = hook::InputHook::install(
        &hook_config,
        Arc::clone(&keyboard),
        Arc::clone(&mouse),
        emergency,
        Arc::clone(&output),
    )?;

    let recorder = Arc::new(Mutex::new(
        recorder::MacroRecorder::new(settings.recorder.filters.clone(), notifier.clone())
            .with_limits(settings.recorder.min_delay_ms, settings.recorder.max_duration_ms),
    ));

    let injector_for_player: Arc<RwLock<dyn injector::Injector + Send + Sync>> =
        Arc::new(RwLock::new((*output).clone()));
    let player = Arc::new(player::MacroPlayer::new(
        injector_for_player,
        Arc::clone(&keyboard),
        Arc::clone(&mouse),
        Arc::clone(&config_manager),
        notifier.clone(),
    ));
    player.set_speed(settings.player.speed);
    player.set_timing(settings.player.respect_timing, settings.player.custom_delay_ms);

    let triggers = Arc::new(
        bindings::TriggerService::load(
            config_manager.bindings_path().to_path_buf(),
            settings.triggers.debounce_ms,
            Arc::clone(&recorder),
            Arc::clone(&player),
            notifier.clone(),
        )
        .await,
    );

    // Pump the raw event stream into the recorder and the trigger service
    let mut raw_rx = input_hook.subscribe();
    {
        let recorder = Arc::clone(&recorder);
        let triggers = Arc::clone(&triggers);
        tokio::spawn(async move {
            loop {
                match raw_rx.recv().await {
                    Ok(event) => {
                        recorder.lock().unwrap().observe(&event);
                        triggers.handle_event(&event).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Raw event pump lagged, {} events dropped", missed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let state = Arc::new(DaemonState {
        start_time: Instant::now(),
        keyboard,
        mouse,
        recorder,
        player: Arc::clone(&player),
        triggers,
        config: config_manager,
        notifier,
    });

    let mut ipc_server = ipc::IpcServer::new(&settings.daemon.socket_path)?;
    ipc_server.start(state).await?;
    info!("IPC server started successfully");

    // Wait for shutdown signal
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = interrupt.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    info!("Starting cleanup...");
    player.stop();
    input_hook.uninstall();
    ipc_server.shutdown().await?;
    info!("Inputlock Daemon shutdown complete");
    Ok(())
}
