//! Framed read loop shared by the client transport and the test acceptor

use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use tunnel_proto::PduFramer;

/// Why a read loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its side of the stream
    PeerClosed,
    /// Nothing was received for the whole idle window
    IdleTimeout,
    /// The stream failed or carried an unframeable byte sequence
    ReadError(String),
    /// Closed locally
    Stopped,
}

impl CloseReason {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CloseReason::IdleTimeout)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::ReadError(e) => write!(f, "read error: {}", e),
            CloseReason::Stopped => f.write_str("stopped"),
        }
    }
}

/// Read PDUs from `reader` until the stream ends, stays idle for
/// `idle_timeout`, or `stop` is cancelled
///
/// Every complete PDU, delimiter included, is handed to `on_pdu` in wire order.
pub(crate) async fn read_pdus<R, F>(
    reader: R,
    max_frame_len: usize,
    idle_timeout: Duration,
    stop: CancellationToken,
    mut on_pdu: F,
) -> CloseReason
where
    R: AsyncRead + Unpin,
    F: FnMut(Bytes),
{
    let mut frames = FramedRead::new(reader, PduFramer::with_max_frame_len(max_frame_len));

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => return CloseReason::Stopped,

            next = tokio::time::timeout(idle_timeout, frames.next()) => match next {
                Err(_) => return CloseReason::IdleTimeout,
                Ok(None) => return CloseReason::PeerClosed,
                Ok(Some(Err(e))) => return CloseReason::ReadError(e.to_string()),
                Ok(Some(Ok(pdu))) => {
                    trace!("Read PDU of {} bytes", pdu.len());
                    on_pdu(pdu);
                }
            },
        }
    }
}
