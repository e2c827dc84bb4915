//! Tunnel client library - Public API
//!
//! Create broadcast tunnels, publish into them and listen to them over a
//! connection that survives broker restarts.
//!
//! ```no_run
//! use tunnel_client::{ClientConfig, TunnelClient};
//!
//! # async fn run() -> Result<(), tunnel_client::ClientError> {
//! let client = TunnelClient::connect(ClientConfig::default()).await?;
//!
//! client.create_broadcast_tunnel("Bidule").await?;
//! client
//!     .listen_tunnel("Bidule", |msg| println!("{}: {}", msg.tunnel, msg.message))
//!     .await?;
//! client.publish_message("Bidule", "Hello world").await?;
//!
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
mod listeners;
mod pending;

pub use client::{ClientState, TunnelClient};
pub use config::{ClientConfig, ClientConfigBuilder, DEFAULT_SERVER_ADDR};
pub use error::ClientError;
pub use listeners::InboundMessage;

pub use tunnel_connection::{ReconnectConfig, TcpTransportConfig, TcpTransportFactory};
pub use tunnel_proto::{MessageBody, TransactionId, TunnelName, ValidationError};
pub use tunnel_transport::{
    InboundSender, Transport, TransportError, TransportFactory, TransportResult,
};
