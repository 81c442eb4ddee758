use inputlock_common::{deserialize, serialize, tracing, Request, Response};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::DaemonState;

// Largest request frame we accept
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// IPC server handling external callers over a Unix socket.
///
/// One request per connection; a Subscribe request instead turns the
/// connection into a notification stream that lives until the client
/// disconnects.
pub struct IpcServer {
    socket_path: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl IpcServer {
    /// Create a new IPC server at the specified socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Result<Self, std::io::Error> {
        let path = socket_path.as_ref().to_string_lossy().to_string();

        // Remove any stale socket file from a previous run
        if Path::new(&path).exists() {
            std::fs::remove_file(&path)?;
        }

        Ok(Self {
            socket_path: path,
            shutdown_tx: None,
        })
    }

    /// Bind the socket and spawn the accept loop.
    pub async fn start(&mut self, state: Arc<DaemonState>) -> Result<(), std::io::Error> {
        info!("Starting IPC server at {}", self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        task::spawn(async move {
            loop {
                tokio::select! {
                    connection = listener.accept() => {
                        match connection {
                            Ok((stream, _)) => {
                                debug!("New client connected");
                                let state = Arc::clone(&state);
                                task::spawn(async move {
                                    if let Err(e) = handle_client(stream, state).await {
                                        error!("Error handling client: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Error accepting connection: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Shutting down IPC server");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop accepting connections and remove the socket file.
    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if Path::new(&self.socket_path).exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        Ok(())
    }
}

async fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_MESSAGE_SIZE {
        warn!("Received oversized message: {} bytes", msg_len);
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "message too large",
        ));
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;
    Ok(msg_buf)
}

async fn write_frame(stream: &mut UnixStream, response: &Response) -> Result<(), std::io::Error> {
    let bytes = serialize(response);
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

/// Handle one client connection.
async fn handle_client(
    mut stream: UnixStream,
    state: Arc<DaemonState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let msg_buf = read_frame(&mut stream).await?;
    let request: Request = deserialize(&msg_buf)?;
    debug!("Received request: {:?}", request);

    if matches!(request, Request::Subscribe) {
        return stream_notifications(stream, state).await;
    }

    let response = handle_request(request, &state).await;
    debug!("Sending response: {:?}", response);
    write_frame(&mut stream, &response).await?;
    Ok(())
}

/// Acknowledge the subscription and forward notifications until the
/// client goes away.
async fn stream_notifications(
    mut stream: UnixStream,
    state: Arc<DaemonState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut rx = state.notifier.subscribe();
    write_frame(&mut stream, &Response::Ack).await?;
    info!("Client subscribed to notifications");

    loop {
        match rx.recv().await {
            Ok(notification) => {
                if write_frame(&mut stream, &Response::Event(notification)).await.is_err() {
                    debug!("Subscriber disconnected");
                    return Ok(());
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Subscriber lagged, {} notifications dropped", missed);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Process a request against the daemon state.
async fn handle_request(request: Request, state: &Arc<DaemonState>) -> Response {
    match request {
        Request::ToggleBlocking { reason } => {
            state.keyboard.lock().unwrap().toggle(&reason);
            state.mouse.lock().unwrap().toggle(&reason);
            Response::State(state.blocking_snapshots())
        }
        Request::SetBlocking { blocked, reason } => {
            state.keyboard.lock().unwrap().set_blocked(blocked, &reason);
            state.mouse.lock().unwrap().set_blocked(blocked, &reason);
            Response::State(state.blocking_snapshots())
        }
        Request::SetMode { device, mode, reason } => {
            let machine = state.machine_for(device);
            let mut machine = machine.lock().unwrap();
            match mode {
                inputlock_common::BlockMode::Simple => machine.set_simple_mode(&reason),
                inputlock_common::BlockMode::Advanced(config) => {
                    machine.set_advanced_mode(config, &reason)
                }
                inputlock_common::BlockMode::Select(config) => {
                    machine.set_select_mode(config, &reason)
                }
            }
            Response::State(vec![machine.snapshot()])
        }
        Request::ApplySelection { device } => {
            let machine = state.machine_for(device);
            let mut machine = machine.lock().unwrap();
            match machine.apply_selection("selection applied") {
                Ok(()) => Response::State(vec![machine.snapshot()]),
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::GetState => Response::State(state.blocking_snapshots()),

        Request::StartRecording => match state.recorder.lock().unwrap().start() {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::PauseRecording => match state.recorder.lock().unwrap().pause() {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::ResumeRecording => match state.recorder.lock().unwrap().resume() {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StopRecording { name } => {
            let stopped = state.recorder.lock().unwrap().stop();
            match stopped {
                Ok((events, _duration_ms)) => {
                    let entry = inputlock_common::Macro::new(name, events);
                    match state.config.save_macro(entry).await {
                        Ok(stored) => Response::Macro(stored),
                        Err(e) => Response::Error(format!("Failed to save recording: {}", e)),
                    }
                }
                Err(e) => Response::Error(e.to_string()),
            }
        }

        Request::SaveMacro { macro_entry } => match state.config.save_macro(macro_entry).await {
            Ok(stored) => Response::Macro(stored),
            Err(e) => Response::Error(format!("Failed to save macro: {}", e)),
        },
        Request::GetMacro { name } => match state.config.get_macro(&name).await {
            Some(entry) => Response::Macro(entry),
            None => Response::Error(format!("Macro not found: {}", name)),
        },
        Request::ListMacros => Response::Macros(state.config.list_macros().await),
        Request::DeleteMacro { name } => match state.config.delete_macro(&name).await {
            Ok(true) => {
                // Bindings referencing a deleted macro are dangling; drop them
                if let Err(e) = state.triggers.remove_for_macro(&name).await {
                    warn!("Failed to prune bindings for '{}': {}", name, e);
                }
                Response::Ack
            }
            Ok(false) => Response::Error(format!("Macro not found: {}", name)),
            Err(e) => Response::Error(format!("Failed to delete macro: {}", e)),
        },

        Request::PlayMacro { name, mode, repeat_count } => {
            match state.player.play(&name, mode, repeat_count).await {
                Ok(()) => Response::Ack,
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::StopPlayback => {
            state.player.stop();
            Response::Ack
        }
        Request::SetPlaybackPaused { paused } => {
            if state.player.set_paused(paused) {
                Response::Ack
            } else {
                Response::Error("No playback in progress".to_string())
            }
        }

        Request::AddBinding { binding } => match state.triggers.add_or_update(binding).await {
            Ok(_stored) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::RemoveBinding { id } => match state.triggers.remove(id).await {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::SetBindingEnabled { id, enabled } => {
            match state.triggers.set_binding_enabled(id, enabled).await {
                Ok(()) => Response::Ack,
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::RemoveBindingsForMacro { name } => {
            match state.triggers.remove_for_macro(&name).await {
                Ok(_count) => Response::Ack,
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::ListBindings => {
            let (enabled, bindings) = state.triggers.list();
            Response::Bindings { enabled, bindings }
        }
        Request::ClearBindings => match state.triggers.clear_all().await {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::SetTriggersEnabled { enabled } => {
            match state.triggers.set_enabled(enabled).await {
                Ok(()) => Response::Ack,
                Err(e) => Response::Error(e.to_string()),
            }
        }

        Request::GetStatus => Response::Status {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            macros_count: state.config.macros_count().await,
            bindings_count: state.triggers.count(),
            recording: state.recorder.lock().unwrap().is_recording(),
            playing: state.player.is_playing(),
        },

        // Handled at the connection level
        Request::Subscribe => Response::Ack,
    }
}
