//! Per-worker connection task
//!
//! Each accepted worker connection gets its own task. The task reads the
//! handshake, registers the worker through the [`CoordinatorHandle`] and
//! then pumps records in both directions until either side stops:
//!
//! - inbound records are forwarded to the event loop as they arrive
//! - outbound records come from the event loop over an unbounded channel,
//!   interleaved with periodic heartbeats
//!
//! The session never touches coordinator state directly. When it ends it
//! reports the disconnect, and the event loop decides what happens to the
//! worker's jobs.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::handle::CoordinatorHandle;
use super::registry::ConnectionId;
use crate::error::Error;
use crate::metrics;
use crate::protocol::{
    CoordinatorMessage, FrameReader, FrameWriter, Handshake, ProtocolError, WorkerMessage,
    DEFAULT_MAX_FRAME_BYTES,
};

/// Record for a connection's writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(CoordinatorMessage),
    /// Flush and close the connection
    Close,
}

/// Sending side of a connection's outbound queue
pub type WorkerSender = mpsc::UnboundedSender<Outbound>;

/// Connection-level timing and limits
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_frame_bytes: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Accept worker connections forever, one session task each
pub async fn accept_loop(
    listener: TcpListener,
    handle: CoordinatorHandle,
    settings: SessionSettings,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Worker connection accepted");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                let handle = handle.clone();
                let settings = settings.clone();
                tokio::spawn(async move {
                    serve_worker(stream, handle, settings).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept worker connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Run one worker connection to completion
pub async fn serve_worker<S>(stream: S, handle: CoordinatorHandle, settings: SessionSettings)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half, settings.max_frame_bytes);
    let mut writer = FrameWriter::new(write_half);

    let handshake = match read_handshake(&mut reader, settings.handshake_timeout).await {
        Ok(handshake) => handshake,
        Err(e) => {
            if e.is_violation() {
                metrics::record_protocol_violation(e.kind());
                warn!(error = %e, "Dropping connection before registration");
                let _ = writer
                    .send(&CoordinatorMessage::Rejected {
                        reason: e.to_string(),
                    })
                    .await;
            } else {
                debug!(error = %e, "Connection closed before handshake");
            }
            let _ = writer.shutdown().await;
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let connection = match handle.connect(handshake.clone(), tx).await {
        Ok(connection) => connection,
        Err(e) => {
            if !matches!(e, Error::ShuttingDown) {
                info!(worker = %handshake.name, error = %e, "Handshake rejected");
            }
            let _ = writer
                .send(&CoordinatorMessage::Rejected {
                    reason: e.to_string(),
                })
                .await;
            let _ = writer.shutdown().await;
            return;
        }
    };

    let welcome = CoordinatorMessage::Welcome {
        heartbeat_interval_secs: settings.heartbeat_interval.as_secs(),
    };
    let name = handshake.name;

    let reason = tokio::select! {
        reason = write_loop(writer, rx, welcome, settings.heartbeat_interval) => reason,
        reason = read_loop(reader, &handle, &name, connection) => reason,
    };

    debug!(worker = %name, %connection, %reason, "Worker session ended");
    handle.disconnected(name, connection, reason).await;
}

async fn read_handshake<R>(
    reader: &mut FrameReader<R>,
    limit: Duration,
) -> Result<Handshake, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let first = timeout(limit, reader.next::<WorkerMessage>())
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout)??;

    match first {
        Some(WorkerMessage::Handshake(handshake)) => {
            handshake
                .validate()
                .map_err(ProtocolError::InvalidHandshake)?;
            Ok(handshake)
        }
        Some(other) => Err(ProtocolError::UnexpectedMessage {
            expected: "handshake",
            got: other.kind_name(),
        }),
        None => Err(ProtocolError::Closed),
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    welcome: CoordinatorMessage,
    heartbeat_interval: Duration,
) -> String
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer.send(&welcome).await {
        return format!("failed to send welcome: {e}");
    }

    let mut heartbeat = interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            record = outbound.recv() => match record {
                Some(Outbound::Message(message)) => {
                    if let Err(e) = writer.send(&message).await {
                        return format!("write failed: {e}");
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = writer.shutdown().await;
                    return "closed by coordinator".to_string();
                }
            },
            _ = heartbeat.tick() => {
                if let Err(e) = writer.send(&CoordinatorMessage::Heartbeat).await {
                    return format!("write failed: {e}");
                }
            }
        }
    }
}

async fn read_loop<R>(
    mut reader: FrameReader<R>,
    handle: &CoordinatorHandle,
    name: &str,
    connection: ConnectionId,
) -> String
where
    R: AsyncRead + Unpin,
{
    loop {
        let error = match reader.next::<WorkerMessage>().await {
            Ok(Some(WorkerMessage::Handshake(_))) => ProtocolError::DuplicateHandshake,
            Ok(Some(message)) => {
                if handle
                    .worker_message(name.to_string(), connection, message)
                    .await
                    .is_err()
                {
                    return "coordinator stopped".to_string();
                }
                continue;
            }
            Ok(None) => return "closed by worker".to_string(),
            Err(e) => e,
        };

        if error.is_violation() {
            metrics::record_protocol_violation(error.kind());
            warn!(worker = %name, %connection, error = %error, "Protocol violation, dropping worker");
        }
        return error.to_string();
    }
}
