//! Transport abstraction layer for tunnel connections
//!
//! The client engine never touches a socket directly. It talks to a
//! [`Transport`], which owns exactly one physical stream connection, and it
//! builds new transports through a [`TransportFactory`] whenever the previous
//! one is lost.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  tunnel-client engine                    │
//! │    (ack correlation, tunnel fan-out, reconnection)       │
//! └─────────────────────────────────────────────────────────┘
//!              │ send(pdu)            ▲ inbound PDUs (mpsc)
//!              ↓                      │ closed() token
//! ┌─────────────────────────────────────────────────────────┐
//! │            tunnel-transport (this crate)                 │
//! │        - Transport          - TransportFactory           │
//! └─────────────────────────────────────────────────────────┘
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────────────┬──────────────────────────┐
//! │ tunnel-connection (TCP)      │ in-memory test doubles   │
//! └──────────────────────────────┴──────────────────────────┘
//! ```
//!
//! # Contract
//!
//! 1. `connect` dials once; it never retries internally.
//! 2. `send` writes one already-framed PDU; its bytes are never split across
//!    writes from other calls or reordered.
//! 3. Every complete inbound PDU is pushed, in wire order, into the
//!    [`InboundSender`] handed to the factory.
//! 4. The token returned by `closed` is cancelled once the stream is gone,
//!    whatever the cause (peer close, read error, idle timeout, `stop`).
//! 5. `stop` releases the stream and may be called more than once.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Timeout")]
    Timeout,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Where a transport delivers every inbound PDU
pub type InboundSender = mpsc::UnboundedSender<Bytes>;

/// Receiving side of [`InboundSender`]
pub type InboundReceiver = mpsc::UnboundedReceiver<Bytes>;

/// One physical stream connection to a tunnel broker
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Establish the stream
    ///
    /// Fails with a dial error if the peer cannot be reached. No retry.
    async fn connect(&mut self) -> TransportResult<()>;

    /// Write one framed PDU
    async fn send(&mut self, pdu: Bytes) -> TransportResult<()>;

    /// Token cancelled once the stream has been torn down
    ///
    /// Only meaningful after a successful `connect`.
    fn closed(&self) -> CancellationToken;

    /// Tear the stream down and release its resources
    async fn stop(&mut self);
}

/// Builds transports for the client engine
///
/// The engine calls `create` once for the initial connection and once per
/// reconnection attempt.
pub trait TransportFactory: Send + Sync {
    /// Create a transport to `addr` that delivers inbound PDUs into `inbound`
    fn create(&self, addr: &str, inbound: InboundSender) -> Box<dyn Transport>;

    /// Get a human-readable name for this transport (e.g., "TCP")
    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> TransportFactory for F
where
    F: Fn(&str, InboundSender) -> Box<dyn Transport> + Send + Sync,
{
    fn create(&self, addr: &str, inbound: InboundSender) -> Box<dyn Transport> {
        self(addr, inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct NullTransport {
        closed: CancellationToken,
    }

    #[async_trait]
    impl Transport for NullTransport {
        async fn connect(&mut self) -> TransportResult<()> {
            Ok(())
        }

        async fn send(&mut self, _pdu: Bytes) -> TransportResult<()> {
            Err(TransportError::NotConnected)
        }

        fn closed(&self) -> CancellationToken {
            self.closed.clone()
        }

        async fn stop(&mut self) {
            self.closed.cancel();
        }
    }

    #[tokio::test]
    async fn test_closure_factory() {
        let factory = |_addr: &str, _inbound: InboundSender| -> Box<dyn Transport> {
            Box::<NullTransport>::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut transport = factory.create("127.0.0.1:1", tx);
        assert_eq!(factory.name(), "custom");
        transport.connect().await.unwrap();

        let closed = transport.closed();
        assert!(!closed.is_cancelled());
        transport.stop().await;
        assert!(closed.is_cancelled());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(
            TransportError::FrameTooLarge(70000).to_string(),
            "Frame too large: 70000 bytes"
        );
    }
}
