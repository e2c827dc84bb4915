//! In-memory broker used to drive the client engine in tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tunnel_client::{
    ClientConfig, InboundSender, Transport, TransportError, TransportFactory, TransportResult,
};
use tunnel_proto::{Command, PduCodec, TransactionId};

/// How the scripted broker answers each request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
    /// Never answer
    Silent,
    /// Ack carrying another transaction id
    WrongId,
    /// Bytes that do not decode
    Garbage,
    /// A well-formed command that is not an acknowledgement
    Unrelated,
}

#[derive(Debug)]
pub struct ScriptedBroker {
    reply: Mutex<Reply>,
    failing_dials: AtomicUsize,
    dials: AtomicUsize,
    dial_times: Mutex<Vec<Instant>>,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<Command>>,
    current: Mutex<Option<(InboundSender, CancellationToken)>>,
}

impl ScriptedBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(Reply::Ack),
            failing_dials: AtomicUsize::new(0),
            dials: AtomicUsize::new(0),
            dial_times: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            current: Mutex::new(None),
        })
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn TransportFactory> {
        Arc::new(ScriptedFactory {
            broker: self.clone(),
        })
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    /// Make the next `count` dials fail
    pub fn fail_next_dials(&self, count: usize) {
        self.failing_dials.store(count, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Number of dials attempted so far, failed ones included
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// When each dial happened, on the tokio clock
    pub fn dial_times(&self) -> Vec<Instant> {
        self.dial_times.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliver a raw PDU on the live connection
    pub fn push(&self, pdu: Bytes) {
        if let Some((inbound, _)) = self.current.lock().unwrap().as_ref() {
            let _ = inbound.send(pdu);
        }
    }

    pub fn push_message(&self, tunnel: &str, message: &str) {
        let command = Command::receive_message(TransactionId::random(), tunnel, message).unwrap();
        self.push(PduCodec::encode(&command));
    }

    /// Simulate the broker going away
    pub fn drop_connection(&self) {
        if let Some((_, closed)) = self.current.lock().unwrap().as_ref() {
            closed.cancel();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, closed)| !closed.is_cancelled())
            .unwrap_or(false)
    }

    fn answer(&self, command: &Command) -> Option<Bytes> {
        let id = command.transaction_id();
        match *self.reply.lock().unwrap() {
            Reply::Ack => Some(PduCodec::encode(&Command::ack(id))),
            Reply::Nack => Some(PduCodec::encode(&Command::nack(id))),
            Reply::Silent => None,
            Reply::WrongId => {
                let mut other = TransactionId::random();
                while other == id {
                    other = TransactionId::random();
                }
                Some(PduCodec::encode(&Command::ack(other)))
            }
            Reply::Garbage => Some(Bytes::from_static(b"@short\n")),
            Reply::Unrelated => Some(PduCodec::encode(
                &Command::listen_tunnel(id, "Echo").unwrap(),
            )),
        }
    }
}

struct ScriptedFactory {
    broker: Arc<ScriptedBroker>,
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, _addr: &str, inbound: InboundSender) -> Box<dyn Transport> {
        Box::new(ScriptedTransport {
            broker: self.broker.clone(),
            inbound,
            closed: CancellationToken::new(),
            connected: false,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[derive(Debug)]
struct ScriptedTransport {
    broker: Arc<ScriptedBroker>,
    inbound: InboundSender,
    closed: CancellationToken,
    connected: bool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        self.broker.dials.fetch_add(1, Ordering::SeqCst);
        self.broker.dial_times.lock().unwrap().push(Instant::now());
        let failing = self
            .broker
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::ConnectionError(
                "connection refused".to_string(),
            ));
        }

        *self.broker.current.lock().unwrap() = Some((self.inbound.clone(), self.closed.clone()));
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, pdu: Bytes) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.closed.is_cancelled() || self.broker.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let command = PduCodec::decode(&pdu).expect("client sent an invalid PDU");
        let answer = self.broker.answer(&command);
        self.broker.sent.lock().unwrap().push(command);

        if let Some(answer) = answer {
            let _ = self.inbound.send(answer);
        }
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn stop(&mut self) {
        self.closed.cancel();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Short timeouts so failure paths finish quickly
pub fn test_config() -> ClientConfig {
    ClientConfig::builder()
        .server_addr("broker.test:19917")
        .ack_timeout(Duration::from_millis(200))
        .initial_backoff(Duration::from_millis(20))
        .build()
        .unwrap()
}

/// Poll `condition` until it holds, panicking after two seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
