//! Client against a minimal broker over loopback TCP

mod common;

use common::{eventually, init_tracing};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tunnel_client::{ClientConfig, ClientError, ClientState, TunnelClient};
use tunnel_connection::{AcceptorEvent, PeerConnection, TcpAcceptor, TcpAcceptorConfig};
use tunnel_proto::{Command, PduCodec, TransactionId};

struct TestBroker {
    acceptor: TcpAcceptor,
    accepted: Arc<AtomicUsize>,
    kick: mpsc::UnboundedSender<()>,
}

impl TestBroker {
    async fn start() -> Self {
        let (acceptor, events) = TcpAcceptor::bind(TcpAcceptorConfig::default())
            .await
            .unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (kick, kicks) = mpsc::unbounded_channel();

        tokio::spawn(run_broker(events, kicks, accepted.clone()));

        Self {
            acceptor,
            accepted,
            kick,
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig::builder()
            .server_addr(self.acceptor.local_addr().to_string())
            .ack_timeout(Duration::from_secs(2))
            .initial_backoff(Duration::from_millis(20))
            .build()
            .unwrap()
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Close every client connection from the broker side
    fn kick_all(&self) {
        self.kick.send(()).unwrap();
    }
}

/// Acknowledges requests for known tunnels and fans published messages out
/// to every listener of the tunnel
async fn run_broker(
    mut events: mpsc::UnboundedReceiver<AcceptorEvent>,
    mut kicks: mpsc::UnboundedReceiver<()>,
    accepted: Arc<AtomicUsize>,
) {
    let mut peers: Vec<PeerConnection> = Vec::new();
    let mut tunnels: HashSet<String> = HashSet::new();
    let mut listeners: Vec<(PeerConnection, String)> = Vec::new();

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            Some(()) = kicks.recv() => {
                for peer in &peers {
                    peer.close();
                }
                continue;
            }
        };

        match event {
            AcceptorEvent::Connected(peer) => {
                accepted.fetch_add(1, Ordering::SeqCst);
                peers.push(peer);
            }
            AcceptorEvent::Closed { id, .. } => {
                peers.retain(|p| p.id() != id);
                listeners.retain(|(p, _)| p.id() != id);
            }
            AcceptorEvent::Payload { id, payload } => {
                let Some(peer) = peers.iter().find(|p| p.id() == id).cloned() else {
                    continue;
                };
                let Ok(command) = PduCodec::decode(&payload) else {
                    continue;
                };
                let transaction_id = command.transaction_id();

                let granted = match &command {
                    Command::CreateTunnel { name, .. } => {
                        tunnels.insert(name.to_string());
                        true
                    }
                    Command::ListenTunnel { name, .. } if tunnels.contains(name.as_str()) => {
                        listeners.push((peer.clone(), name.to_string()));
                        true
                    }
                    Command::PublishMessage { tunnel, .. } => tunnels.contains(tunnel.as_str()),
                    _ => false,
                };

                let answer = if granted {
                    Command::ack(transaction_id)
                } else {
                    Command::nack(transaction_id)
                };
                let _ = peer.send(PduCodec::encode(&answer)).await;

                if let (true, Command::PublishMessage { tunnel, message, .. }) = (granted, &command)
                {
                    let delivery = Command::receive_message(
                        TransactionId::random(),
                        tunnel.as_str(),
                        message.as_str(),
                    )
                    .unwrap();
                    let pdu = PduCodec::encode(&delivery);
                    for (listener, name) in &listeners {
                        if name == tunnel.as_str() {
                            let _ = listener.send(pdu.clone()).await;
                        }
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn test_publish_reaches_listener() {
    init_tracing();
    let broker = TestBroker::start().await;
    let client = TunnelClient::connect(broker.config()).await.unwrap();

    client.create_broadcast_tunnel("Bidule").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .listen_tunnel("Bidule", move |msg| {
            let _ = tx.send(msg.message.to_string());
        })
        .await
        .unwrap();

    client.publish_message("Bidule", "Hello world").await.unwrap();
    client.publish_message("Bidule", "Second one").await.unwrap();

    for expected in ["Hello world", "Second one"] {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, expected);
    }

    client.stop().await;
    broker.acceptor.stop().await;
}

#[tokio::test]
async fn test_unknown_tunnel_is_rejected() {
    init_tracing();
    let broker = TestBroker::start().await;
    let client = TunnelClient::connect(broker.config()).await.unwrap();

    assert!(matches!(
        client.publish_message("Nowhere", "Hello").await,
        Err(ClientError::Rejected)
    ));
    assert!(matches!(
        client.listen_tunnel("Nowhere", |_| {}).await,
        Err(ClientError::Rejected)
    ));

    client.stop().await;
    broker.acceptor.stop().await;
}

#[tokio::test]
async fn test_message_fan_out_between_clients() {
    init_tracing();
    let broker = TestBroker::start().await;
    let publisher = TunnelClient::connect(broker.config()).await.unwrap();
    let subscriber = TunnelClient::connect(broker.config()).await.unwrap();

    publisher.create_broadcast_tunnel("News").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .listen_tunnel("News", move |msg| {
            let _ = tx.send((msg.tunnel.to_string(), msg.message.to_string()));
        })
        .await
        .unwrap();

    publisher.publish_message("News", "Breaking").await.unwrap();

    let (tunnel, message) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tunnel, "News");
    assert_eq!(message, "Breaking");

    publisher.stop().await;
    subscriber.stop().await;
    broker.acceptor.stop().await;
}

#[tokio::test]
async fn test_client_reconnects_after_broker_closes() {
    init_tracing();
    let broker = TestBroker::start().await;
    let client = TunnelClient::connect(broker.config()).await.unwrap();
    client.create_broadcast_tunnel("Bidule").await.unwrap();
    assert_eq!(broker.accepted(), 1);

    broker.kick_all();

    eventually("second connection", || broker.accepted() == 2).await;
    let mut state = client.watch_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == ClientState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    client.publish_message("Bidule", "After reconnect").await.unwrap();

    client.stop().await;
    broker.acceptor.stop().await;
}

#[tokio::test]
async fn test_idle_connection_is_redialed() {
    init_tracing();
    let broker = TestBroker::start().await;
    let config = ClientConfig {
        transport: tunnel_client::TcpTransportConfig {
            idle_timeout: Duration::from_millis(100),
            ..Default::default()
        },
        ..broker.config()
    };
    let client = TunnelClient::connect(config).await.unwrap();

    // The broker never speaks first, so the client gives the connection up.
    eventually("redial after idle timeout", || broker.accepted() >= 2).await;

    client.stop().await;
    assert_eq!(client.state(), ClientState::Stopped);
    broker.acceptor.stop().await;
}

#[tokio::test]
async fn test_dial_error_without_broker() {
    init_tracing();
    let broker = TestBroker::start().await;
    let config = broker.config();
    broker.acceptor.stop().await;
    drop(broker);

    let result = TunnelClient::connect(config).await;
    assert!(matches!(result, Err(ClientError::Dial(_))));
}
