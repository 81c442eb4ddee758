//! Client side of the daemon's Unix socket protocol.
//!
//! Requests are bincode payloads behind a little-endian u32 length prefix.
//! `IpcClient` handles connect retries and per-operation timeouts; `subscribe`
//! turns a connection into a long-lived notification stream.

use crate::{Notification, Request, Response};
use serde::Serialize;

use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("could not write to daemon socket: {0}")]
    Send(std::io::Error),
    #[error("could not read from daemon socket: {0}")]
    Receive(std::io::Error),
    #[error("bad wire payload: {0}")]
    Serialization(String),
    #[error("timed out connecting to the daemon")]
    ConnectionTimeout,
    #[error("no reply within {0}ms")]
    OperationTimeout(u64),
    #[error("no daemon listening on {0}")]
    DaemonNotRunning(String),
    #[error("reply did not match the request")]
    InvalidResponse,
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    MessageTooLarge(usize, usize),
    #[error("daemon closed the connection")]
    ConnectionClosed,
    #[error("daemon refused the request: {0}")]
    Daemon(String),
}

pub const DEFAULT_SOCKET_PATH: &str = "/run/inputlock.sock";

/// Frames above this size are rejected on both ends.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Connect retry behaviour. The defaults cover a daemon restart.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, delay: Duration::from_millis(1000) }
    }
}

#[derive(Debug)]
pub struct IpcClient {
    socket_path: String,
    timeout: Duration,
    retry: RetryPolicy,
}

/// A connection switched into streaming mode by a Subscribe request.
/// Each call to `next` yields the next notification frame.
pub struct NotificationStream {
    stream: UnixStream,
}

impl NotificationStream {
    /// Wait for the next notification from the daemon.
    pub async fn next(&mut self) -> Result<Notification, IpcError> {
        match decode::<Response>(&read_frame(&mut self.stream).await?)? {
            Response::Event(notification) => Ok(notification),
            _ => Err(IpcError::InvalidResponse),
        }
    }
}

impl IpcClient {
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    pub fn with_socket_path<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().into_owned(),
            timeout: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    pub fn with_retry_params(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.retry = RetryPolicy { attempts: max_retries, delay: Duration::from_millis(retry_delay_ms) };
        self
    }

    /// True if something is accepting connections on the socket.
    pub async fn is_daemon_running(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    /// Connect, retrying per the client's `RetryPolicy`.
    pub async fn connect(&self) -> Result<UnixStream, IpcError> {
        for attempt in 0..=self.retry.attempts {
            if attempt > 0 {
                sleep(self.retry.delay).await;
            }
            match timeout(self.timeout, UnixStream::connect(&self.socket_path)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    debug!("connect attempt {} to {} failed: {}", attempt + 1, self.socket_path, e);
                }
                Err(_) => return Err(IpcError::ConnectionTimeout),
            }
        }
        Err(IpcError::DaemonNotRunning(self.socket_path.clone()))
    }

    /// One request, one response. The whole exchange is retried on failure
    /// since the daemon serves a single request per connection.
    pub async fn send(&self, request: &Request) -> Result<Response, IpcError> {
        let payload = encode(request)?;
        let mut last = None;

        for attempt in 0..=self.retry.attempts {
            if attempt > 0 {
                warn!("request attempt {} failed, retrying", attempt);
                sleep(self.retry.delay).await;
            }
            match self.round_trip(&payload).await {
                Ok(response) => return Ok(response),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or(IpcError::ConnectionClosed))
    }

    /// Send a request and interpret anything but Ack as a failure.
    pub async fn send_expect_ack(&self, request: &Request) -> Result<(), IpcError> {
        match self.send(request).await? {
            Response::Ack => Ok(()),
            Response::Error(msg) => Err(IpcError::Daemon(msg)),
            _ => Err(IpcError::InvalidResponse),
        }
    }

    /// Open a dedicated connection and switch it into notification
    /// streaming with a Subscribe request.
    pub async fn subscribe(&self) -> Result<NotificationStream, IpcError> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &encode(&Request::Subscribe)?).await?;

        // The daemon acknowledges before it starts streaming events
        match decode::<Response>(&read_frame(&mut stream).await?)? {
            Response::Ack => Ok(NotificationStream { stream }),
            Response::Error(msg) => Err(IpcError::Daemon(msg)),
            _ => Err(IpcError::InvalidResponse),
        }
    }

    async fn round_trip(&self, payload: &[u8]) -> Result<Response, IpcError> {
        let mut stream = self.connect().await?;

        timeout(self.timeout, write_frame(&mut stream, payload))
            .await
            .map_err(|_| IpcError::OperationTimeout(self.timeout.as_millis() as u64))??;

        let frame = timeout(self.timeout, read_frame(&mut stream))
            .await
            .map_err(|_| IpcError::OperationTimeout(self.timeout.as_millis() as u64))??;

        decode(&frame)
    }
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    let payload = bincode::serialize(msg).map_err(|e| IpcError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
    }
    Ok(payload)
}

fn decode<T: serde::de::DeserializeOwned>(frame: &[u8]) -> Result<T, IpcError> {
    bincode::deserialize(frame).map_err(|e| IpcError::Serialization(e.to_string()))
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> Result<(), IpcError> {
    let header = (payload.len() as u32).to_le_bytes();
    stream.write_all(&header).await.map_err(IpcError::Send)?;
    stream.write_all(payload).await.map_err(IpcError::Send)?;
    stream.flush().await.map_err(IpcError::Send)?;
    Ok(())
}

async fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>, IpcError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(IpcError::Receive)?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.map_err(IpcError::Receive)?;
    Ok(body)
}
