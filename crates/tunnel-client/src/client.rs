//! Tunnel client engine
//!
//! A [`TunnelClient`] owns one transport to the broker and runs three kinds of
//! background tasks, all tracked by a single [`TaskTracker`] and stopped by a
//! single [`CancellationToken`]:
//!
//! - the supervisor, which watches the transport and replaces it with a new
//!   one, after an exponential backoff, whenever the connection is lost;
//! - the inbound router, which decodes every PDU and resolves the waiting
//!   request (Ack/Nack) or queues the message for its tunnel;
//! - one dispatch task per listened tunnel, invoking the caller's callback.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::listeners::{Delivery, InboundMessage, Listeners};
use crate::pending::PendingAcks;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use tunnel_connection::{ReconnectManager, TcpTransportFactory};
use tunnel_proto::{Command, PduCodec, TransactionId, TunnelName};
use tunnel_transport::{
    InboundReceiver, InboundSender, Transport, TransportError, TransportFactory,
};

/// Connection state of a [`TunnelClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal
    Stopped,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Reconnecting => "reconnecting",
            ClientState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct Shared {
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    /// Empty until the first successful dial
    transport: Mutex<Option<Box<dyn Transport>>>,
    inbound: InboundSender,
    router: Mutex<Option<InboundReceiver>>,
    pending: PendingAcks,
    listeners: Listeners,
    state: watch::Sender<ClientState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    span: Span,
}

/// Tunnel client
pub struct TunnelClient {
    shared: Arc<Shared>,
}

impl TunnelClient {
    /// Connect to the broker over TCP
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let factory = Arc::new(TcpTransportFactory::new(config.transport.clone()));
        Self::connect_with(config, factory).await
    }

    /// Connect through transports built by `factory`
    pub async fn connect_with(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ClientError> {
        let client = Self::new(config, factory)?;
        client.start().await?;
        Ok(client)
    }

    /// Connect through transports built by `factory`, logging under `span`
    pub async fn connect_with_span(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
        span: Span,
    ) -> Result<Self, ClientError> {
        let client = Self::with_span(config, factory, span)?;
        client.start().await?;
        Ok(client)
    }

    /// Build a client in the `Disconnected` state without dialing
    pub fn new(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ClientError> {
        let span = info_span!("tunnel_client", server = %config.server_addr);
        Self::with_span(config, factory, span)
    }

    /// Build a client in the `Disconnected` state, logging under `span`
    pub fn with_span(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
        span: Span,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let (state, _) = watch::channel(ClientState::Disconnected);
        let (inbound, router) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                factory,
                transport: Mutex::new(None),
                inbound,
                router: Mutex::new(Some(router)),
                pending: PendingAcks::new(),
                listeners: Listeners::new(),
                state,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                span,
            }),
        })
    }

    /// Dial the broker and start the background tasks
    ///
    /// The initial dial is not retried: a failure is returned as
    /// [`ClientError::Dial`] and the client goes back to `Disconnected`, from
    /// where it may be started again. Starting a running client does nothing.
    pub async fn start(&self) -> Result<(), ClientError> {
        let shared = &self.shared;

        let mut claimed = false;
        shared.state.send_if_modified(|current| {
            if *current != ClientState::Disconnected {
                return false;
            }
            *current = ClientState::Connecting;
            claimed = true;
            true
        });
        if !claimed {
            return match self.state() {
                ClientState::Stopped => Err(ClientError::Stopped),
                _ => Ok(()),
            };
        }

        shared.start().instrument(shared.span.clone()).await
    }

    /// Stop every background task and close the connection
    ///
    /// Requests still waiting for an acknowledgement fail with
    /// [`ClientError::Stopped`]. Calling this again has no effect.
    pub async fn stop(&self) {
        let shared = &self.shared;
        if shared.cancel.is_cancelled() && self.state() == ClientState::Stopped {
            return;
        }

        async {
            info!("Stopping tunnel client");
            shared.cancel.cancel();
            shared.tracker.close();
            shared.tracker.wait().await;

            shared.stop_transport().await;

            debug!(
                pending = shared.pending.count(),
                listeners = shared.listeners.len(),
                "Releasing client state"
            );
            shared.pending.fail_all();
            shared.listeners.clear();
            shared.set_state(ClientState::Stopped);
            info!("Tunnel client stopped");
        }
        .instrument(shared.span.clone())
        .await
    }

    /// Create a broadcast tunnel named `name`
    pub async fn create_broadcast_tunnel(&self, name: &str) -> Result<(), ClientError> {
        let command = Command::create_tunnel(TransactionId::random(), name)?;
        self.request(command).await
    }

    /// Subscribe to tunnel `name`
    ///
    /// Once the broker acknowledges, `on_message` is called for every message
    /// of that tunnel, one at a time and in arrival order, until the client
    /// stops. The callback runs on the runtime and should not block.
    pub async fn listen_tunnel<F>(&self, name: &str, on_message: F) -> Result<(), ClientError>
    where
        F: FnMut(InboundMessage) + Send + 'static,
    {
        let tunnel = TunnelName::new(name)?;
        if self.shared.cancel.is_cancelled() {
            return Err(ClientError::Stopped);
        }

        // Released on any early return, including the caller dropping this future.
        let (reservation, messages) = self.shared.listeners.reserve(&tunnel)?;
        let command = Command::ListenTunnel {
            transaction_id: TransactionId::random(),
            name: tunnel.clone(),
        };

        self.request(command).await?;
        if self.shared.cancel.is_cancelled() {
            return Err(ClientError::Stopped);
        }

        reservation.commit();
        self.shared.tracker.spawn(
            dispatch_messages(tunnel, messages, self.shared.cancel.clone(), on_message)
                .instrument(self.shared.span.clone()),
        );
        Ok(())
    }

    /// Publish `message` into tunnel `tunnel`
    pub async fn publish_message(&self, tunnel: &str, message: &str) -> Result<(), ClientError> {
        let command = Command::publish_message(TransactionId::random(), tunnel, message)?;
        self.request(command).await
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    pub fn server_addr(&self) -> &str {
        &self.shared.config.server_addr
    }

    /// Send `command` and wait for its acknowledgement
    async fn request(&self, command: Command) -> Result<(), ClientError> {
        let shared = &self.shared;
        if shared.cancel.is_cancelled() {
            return Err(ClientError::Stopped);
        }

        let transaction_id = command.transaction_id();
        let info = command.info();
        let ack_timeout = shared.config.ack_timeout;

        // Registered before sending so an immediate reply cannot be missed.
        let mut waiter = shared.pending.register(transaction_id)?;
        let pdu = PduCodec::encode(&command);

        let exchange = async {
            debug!(%transaction_id, command = %info, "Sending command");
            match shared.transport.lock().await.as_mut() {
                Some(transport) => transport.send(pdu).await,
                None => Err(TransportError::NotConnected),
            }
            .map_err(ClientError::Transport)?;

            match tokio::time::timeout(ack_timeout, waiter.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::Timeout(ack_timeout)),
            }
        };

        let result = async {
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => Err(ClientError::Stopped),
                result = exchange => result,
            }
        }
        .instrument(shared.span.clone())
        .await;

        shared.span.in_scope(|| match &result {
            Ok(()) => debug!(%transaction_id, command = %info, "Command acknowledged"),
            Err(e) => warn!(%transaction_id, command = %info, error = %e, "Command failed"),
        });

        result
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    /// Initial dial, then spawn the router and the supervisor
    async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut transport = self
            .factory
            .create(&self.config.server_addr, self.inbound.clone());

        debug!(transport = self.factory.name(), "Connecting to tunnel server");
        let dialed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Stopped),
            result = transport.connect() => result.map_err(ClientError::Dial),
        };

        if let Err(e) = dialed {
            warn!(error = %e, "Failed to connect to tunnel server");
            transport.stop().await;
            self.set_state(ClientState::Disconnected);
            return Err(e);
        }

        let closed = transport.closed();
        let mut current = self.transport.lock().await;
        if self.cancel.is_cancelled() {
            drop(current);
            transport.stop().await;
            return Err(ClientError::Stopped);
        }
        *current = Some(transport);
        self.set_state(ClientState::Connected);

        if let Some(inbound) = self.router.lock().await.take() {
            self.tracker
                .spawn(route_inbound(self.clone(), inbound).instrument(self.span.clone()));
        }
        self.tracker
            .spawn(supervise(self.clone(), closed).instrument(self.span.clone()));
        drop(current);

        info!("Connected to tunnel server");
        Ok(())
    }

    async fn stop_transport(&self) {
        if let Some(transport) = self.transport.lock().await.as_mut() {
            transport.stop().await;
        }
    }

    fn set_state(&self, next: ClientState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == ClientState::Stopped {
                return false;
            }
            debug!(from = %current, to = %next, "Client state changed");
            *current = next;
            true
        });
    }

    /// Route one inbound PDU
    fn dispatch(&self, pdu: &[u8]) {
        let command = match PduCodec::decode(pdu) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, len = pdu.len(), "Dropping malformed PDU");
                return;
            }
        };

        match command {
            Command::Ack { transaction_id } => self.resolve(transaction_id, true),
            Command::Nack { transaction_id } => self.resolve(transaction_id, false),
            Command::ReceiveMessage {
                transaction_id,
                tunnel,
                message,
            } => {
                let name = tunnel.clone();
                let delivery = self.listeners.deliver(InboundMessage {
                    transaction_id,
                    tunnel,
                    message,
                });
                match delivery {
                    Delivery::Delivered => {}
                    Delivery::UnknownTunnel => {
                        debug!(tunnel = %name, "Dropping message for unknown tunnel")
                    }
                    Delivery::Closed => {
                        debug!(tunnel = %name, "Dropping message, tunnel dispatch ended")
                    }
                }
            }
            other => warn!(
                transaction_id = %other.transaction_id(),
                command = %other.info(),
                "Dropping unexpected command"
            ),
        }
    }

    fn resolve(&self, transaction_id: TransactionId, acked: bool) {
        if !self.pending.resolve(transaction_id, acked) {
            debug!(%transaction_id, acked, "No pending request for acknowledgement");
        }
    }

    /// Dial until a new transport is up, or the client stops
    async fn reconnect(&self, backoff: &mut ReconnectManager) -> Option<CancellationToken> {
        loop {
            let attempt = backoff.attempt() + 1;
            let mut transport = self
                .factory
                .create(&self.config.server_addr, self.inbound.clone());

            debug!(attempt, "Reconnecting to tunnel server");
            let dialed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = transport.connect() => Some(result),
            };

            match dialed {
                None => {
                    transport.stop().await;
                    return None;
                }
                Some(Ok(())) => {
                    let closed = transport.closed();
                    let previous = self.transport.lock().await.replace(transport);
                    if let Some(mut previous) = previous {
                        previous.stop().await;
                    }

                    backoff.reset();
                    self.set_state(ClientState::Connected);
                    info!(attempt, "Reconnected to tunnel server");
                    return Some(closed);
                }
                Some(Err(e)) => {
                    warn!(attempt, error = %e, "Reconnection attempt failed");
                    transport.stop().await;
                    if backoff.wait(&self.cancel).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>, mut closed: CancellationToken) {
    let mut backoff = ReconnectManager::new(shared.config.reconnect.clone());

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = closed.cancelled() => {}
        }

        warn!("Connection to tunnel server lost");
        shared.set_state(ClientState::Reconnecting);
        shared.stop_transport().await;

        match shared.reconnect(&mut backoff).await {
            Some(next) => closed = next,
            None => break,
        }
    }

    shared.stop_transport().await;
    debug!("Supervisor exited");
}

async fn route_inbound(shared: Arc<Shared>, mut inbound: InboundReceiver) {
    loop {
        let pdu = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            pdu = inbound.recv() => match pdu {
                Some(pdu) => pdu,
                None => break,
            },
        };
        shared.dispatch(&pdu);
    }
    debug!("Inbound router exited");
}

async fn dispatch_messages<F>(
    tunnel: TunnelName,
    mut messages: mpsc::UnboundedReceiver<InboundMessage>,
    cancel: CancellationToken,
    mut on_message: F,
) where
    F: FnMut(InboundMessage),
{
    debug!(%tunnel, "Listening on tunnel");
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        on_message(message);
    }
    debug!(%tunnel, "Tunnel dispatch exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ClientState::Connected.to_string(), "connected");
        assert_eq!(ClientState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ClientState::Stopped.to_string(), "stopped");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_dial() {
        let config = ClientConfig {
            server_addr: String::new(),
            ..Default::default()
        };
        let result = TunnelClient::connect(config).await;
        assert!(matches!(result, Err(ClientError::ConfigError(_))));
    }
}
