//! Connection management over TCP
//!
//! Provides the reference [`Transport`](tunnel_transport::Transport) for the
//! tunnel client, the reconnection backoff used by its supervisor, and a
//! small framed TCP acceptor used to stand in for a broker in tests.

mod connection;
pub mod duration_ms;
pub mod reconnect;
pub mod server;
pub mod tcp;

pub use connection::CloseReason;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use server::{AcceptorEvent, PeerConnection, TcpAcceptor, TcpAcceptorConfig, TcpServerError};
pub use tcp::{TcpTransport, TcpTransportConfig, TcpTransportFactory};
