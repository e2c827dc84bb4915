//! TCP transport implementation

use crate::connection::read_pdus;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tunnel_proto::PduFramer;
use tunnel_transport::{InboundSender, Transport, TransportError, TransportFactory, TransportResult};

/// Default allowed idle duration before the connection is dropped
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// TCP transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    /// Connection is considered lost after this long without inbound data
    #[serde(with = "crate::duration_ms")]
    pub idle_timeout: Duration,
    /// Upper bound for a single dial
    #[serde(with = "crate::duration_ms")]
    pub connect_timeout: Duration,
    /// Largest accepted inbound PDU
    pub max_frame_len: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            max_frame_len: PduFramer::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// One TCP stream to a tunnel broker
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
    config: TcpTransportConfig,
    inbound: InboundSender,
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
    closed: CancellationToken,
    stop: CancellationToken,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>, config: TcpTransportConfig, inbound: InboundSender) -> Self {
        Self {
            addr: addr.into(),
            config,
            inbound,
            writer: None,
            reader: None,
            closed: CancellationToken::new(),
            stop: CancellationToken::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        if self.writer.is_some() {
            return Err(TransportError::ConnectionError(
                "transport already connected".to_string(),
            ));
        }

        debug!("Connecting to tunnel server: {}", self.addr);

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionError(format!("dial {}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let inbound = self.inbound.clone();
        let closed = self.closed.clone();
        let stop = self.stop.clone();
        let max_frame_len = self.config.max_frame_len;
        let idle_timeout = self.config.idle_timeout;
        let addr = self.addr.clone();

        self.reader = Some(tokio::spawn(async move {
            let reason = read_pdus(read_half, max_frame_len, idle_timeout, stop, |pdu| {
                if inbound.send(pdu).is_err() {
                    trace!("Inbound receiver dropped, discarding PDU");
                }
            })
            .await;

            debug!("Connection to {} ended: {}", addr, reason);
            closed.cancel();
        }));
        self.writer = Some(write_half);

        debug!("TCP connection established with {}", self.addr);
        Ok(())
    }

    async fn send(&mut self, pdu: Bytes) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;

        trace!("Sending {} bytes via TCP", pdu.len());
        writer.write_all(&pdu).await?;
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn stop(&mut self) {
        self.stop.cancel();

        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                trace!("Error shutting down write half: {}", e);
            }
        }

        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                warn!("TCP reader task failed: {}", e);
            }
        }

        self.closed.cancel();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Builds [`TcpTransport`]s sharing one configuration
#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    config: TcpTransportConfig,
}

impl TcpTransportFactory {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self, addr: &str, inbound: InboundSender) -> Box<dyn Transport> {
        Box::new(TcpTransport::new(addr, self.config.clone(), inbound))
    }

    fn name(&self) -> &str {
        "TCP"
    }
}
