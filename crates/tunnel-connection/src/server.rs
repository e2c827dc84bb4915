//! Framed TCP acceptor
//!
//! Accepts raw TCP connections, splits their byte streams into PDUs and
//! reports everything that happens as [`AcceptorEvent`]s. It has no broker
//! logic of its own: whoever consumes the events decides what to answer.

use crate::connection::read_pdus;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace};
use tunnel_proto::PduFramer;
use uuid::Uuid;

/// TCP acceptor errors
#[derive(Debug, Error)]
pub enum TcpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Connection closed")]
    ConnectionClosed,
}

/// TCP acceptor configuration
#[derive(Debug, Clone)]
pub struct TcpAcceptorConfig {
    pub bind_addr: SocketAddr,
    /// Connections silent for this long are dropped
    pub idle_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for TcpAcceptorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            idle_timeout: crate::tcp::DEFAULT_IDLE_TIMEOUT,
            max_frame_len: PduFramer::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Something that happened on an accepted connection
#[derive(Debug)]
pub enum AcceptorEvent {
    Connected(PeerConnection),
    Payload { id: Uuid, payload: Bytes },
    Closed { id: Uuid, timed_out: bool },
}

/// Handle to one accepted connection
#[derive(Debug, Clone)]
pub struct PeerConnection {
    id: Uuid,
    remote_addr: SocketAddr,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    close: CancellationToken,
}

impl PeerConnection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Write raw bytes to the peer
    pub async fn send(&self, payload: Bytes) -> Result<(), TcpServerError> {
        if self.close.is_cancelled() {
            return Err(TcpServerError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&payload).await?;
        Ok(())
    }

    /// Close the connection from the acceptor side
    pub fn close(&self) {
        self.close.cancel();
    }
}

type ConnectionMap = Arc<Mutex<HashMap<Uuid, PeerConnection>>>;

/// Framed TCP acceptor
pub struct TcpAcceptor {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    connections: ConnectionMap,
}

impl TcpAcceptor {
    /// Bind and start accepting
    ///
    /// Events for every connection are delivered on the returned receiver.
    pub async fn bind(
        config: TcpAcceptorConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AcceptorEvent>), TcpServerError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            TcpServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr()?;

        info!("TCP acceptor listening on {}", local_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let acceptor = Self {
            local_addr,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            connections: Arc::new(Mutex::new(HashMap::new())),
        };

        acceptor.tracker.spawn(accept_loop(
            listener,
            config,
            events_tx,
            acceptor.shutdown.clone(),
            acceptor.tracker.clone(),
            acceptor.connections.clone(),
        ));

        Ok((acceptor, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently open connections
    pub fn connection_count(&self) -> usize {
        match self.connections.lock() {
            Ok(connections) => connections.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Stop accepting, close every connection and wait for all tasks
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("TCP acceptor on {} stopped", self.local_addr);
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: TcpAcceptorConfig,
    events: mpsc::UnboundedSender<AcceptorEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    connections: ConnectionMap,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                debug!("Accepted TCP connection from {}", peer_addr);
                tracker.spawn(handle_connection(
                    socket,
                    peer_addr,
                    config.clone(),
                    events.clone(),
                    shutdown.child_token(),
                    connections.clone(),
                ));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    remote_addr: SocketAddr,
    config: TcpAcceptorConfig,
    events: mpsc::UnboundedSender<AcceptorEvent>,
    close: CancellationToken,
    connections: ConnectionMap,
) {
    if let Err(e) = socket.set_nodelay(true) {
        trace!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
    }

    let (read_half, write_half) = socket.into_split();
    let id = Uuid::new_v4();
    let peer = PeerConnection {
        id,
        remote_addr,
        writer: Arc::new(tokio::sync::Mutex::new(write_half)),
        close: close.clone(),
    };

    if let Ok(mut map) = connections.lock() {
        map.insert(id, peer.clone());
    }
    let _ = events.send(AcceptorEvent::Connected(peer.clone()));

    let reason = read_pdus(
        read_half,
        config.max_frame_len,
        config.idle_timeout,
        close.clone(),
        |payload| {
            let _ = events.send(AcceptorEvent::Payload { id, payload });
        },
    )
    .await;

    debug!("Connection {} from {} closed: {}", id, remote_addr, reason);

    close.cancel();
    if let Err(e) = peer.writer.lock().await.shutdown().await {
        trace!("Error shutting down connection {}: {}", id, e);
    }
    if let Ok(mut map) = connections.lock() {
        map.remove(&id);
    }

    let _ = events.send(AcceptorEvent::Closed {
        id,
        timed_out: reason.is_timeout(),
    });
}
