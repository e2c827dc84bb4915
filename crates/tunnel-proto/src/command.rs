//! Protocol command types
//!
//! Every PDU carries exactly one [`Command`]. Names and message bodies are
//! stored as validated newtypes, so a `Command` value is valid by
//! construction and never needs to be checked again.
//!
//! | Command        | Indicator | Payload                  |
//! |----------------|-----------|--------------------------|
//! | Ack / Nack     | `@`       | `OK` / `KO`              |
//! | CreateTunnel   | `+`       | type byte + tunnel name  |
//! | ListenTunnel   | `#`       | tunnel name              |
//! | PublishMessage | `>`       | `<tunnel> <message>`     |
//! | ReceiveMessage | `<`       | `<tunnel> <message>`     |

use crate::id::TransactionId;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

pub const ACKNOWLEDGEMENT_INDICATOR: u8 = b'@';
pub const CREATE_TUNNEL_INDICATOR: u8 = b'+';
pub const LISTEN_TUNNEL_INDICATOR: u8 = b'#';
pub const PUBLISH_MESSAGE_INDICATOR: u8 = b'>';
pub const RECEIVE_MESSAGE_INDICATOR: u8 = b'<';

const ACK_MARKER: &[u8] = b"OK";
const NACK_MARKER: &[u8] = b"KO";
const SEPARATOR: u8 = b' ';

/// Field level validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid name")]
    InvalidName,

    #[error("invalid message")]
    InvalidMessage,

    #[error("invalid type")]
    InvalidType,
}

/// Errors raised while parsing a command payload
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid command indicator: unknown 0x{0:02x}")]
    UnknownIndicator(u8),

    #[error("invalid acknowledgement command: unknown data {0:?}")]
    UnknownAcknowledgement(String),

    #[error("invalid payload: missing tunnel type")]
    MissingTunnelType,

    #[error("invalid payload: missing tunnel name")]
    MissingTunnelName,

    #[error("invalid payload: missing separator, cannot determine values")]
    MissingSeparator,

    #[error("invalid {command} command: {source}")]
    Invalid {
        command: &'static str,
        source: ValidationError,
    },
}

/// Name of a tunnel: one or more ASCII letters or digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelName(String);

impl TunnelName {
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if is_valid_name(name.as_bytes()) {
            Ok(Self(name))
        } else {
            Err(ValidationError::InvalidName)
        }
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, ValidationError> {
        if !is_valid_name(bytes) {
            return Err(ValidationError::InvalidName);
        }
        // Only ASCII passed the check above.
        Ok(Self(String::from_utf8_lossy(bytes).into_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TunnelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Text published into a tunnel: one or more ASCII letters, digits or spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody(String);

impl MessageBody {
    pub fn new(message: impl Into<String>) -> Result<Self, ValidationError> {
        let message = message.into();
        if is_valid_message(message.as_bytes()) {
            Ok(Self(message))
        } else {
            Err(ValidationError::InvalidMessage)
        }
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, ValidationError> {
        if !is_valid_message(bytes) {
            return Err(ValidationError::InvalidMessage);
        }
        Ok(Self(String::from_utf8_lossy(bytes).into_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid_name(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(u8::is_ascii_alphanumeric)
}

fn is_valid_message(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == SEPARATOR)
}

/// Kind of tunnel requested by a `CreateTunnel` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TunnelKind {
    /// Every listener receives every message.
    Broadcast = 0x00,
}

impl TryFrom<u8> for TunnelKind {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(TunnelKind::Broadcast),
            _ => Err(ValidationError::InvalidType),
        }
    }
}

/// One protocol command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ack {
        transaction_id: TransactionId,
    },
    Nack {
        transaction_id: TransactionId,
    },
    CreateTunnel {
        transaction_id: TransactionId,
        name: TunnelName,
        kind: TunnelKind,
    },
    ListenTunnel {
        transaction_id: TransactionId,
        name: TunnelName,
    },
    PublishMessage {
        transaction_id: TransactionId,
        tunnel: TunnelName,
        message: MessageBody,
    },
    ReceiveMessage {
        transaction_id: TransactionId,
        tunnel: TunnelName,
        message: MessageBody,
    },
}

impl Command {
    pub fn ack(transaction_id: TransactionId) -> Self {
        Command::Ack { transaction_id }
    }

    pub fn nack(transaction_id: TransactionId) -> Self {
        Command::Nack { transaction_id }
    }

    /// Request a broadcast tunnel named `name`.
    pub fn create_tunnel(
        transaction_id: TransactionId,
        name: &str,
    ) -> Result<Self, ValidationError> {
        Ok(Command::CreateTunnel {
            transaction_id,
            name: TunnelName::new(name)?,
            kind: TunnelKind::Broadcast,
        })
    }

    pub fn listen_tunnel(
        transaction_id: TransactionId,
        name: &str,
    ) -> Result<Self, ValidationError> {
        Ok(Command::ListenTunnel {
            transaction_id,
            name: TunnelName::new(name)?,
        })
    }

    pub fn publish_message(
        transaction_id: TransactionId,
        tunnel: &str,
        message: &str,
    ) -> Result<Self, ValidationError> {
        Ok(Command::PublishMessage {
            transaction_id,
            tunnel: TunnelName::new(tunnel)?,
            message: MessageBody::new(message)?,
        })
    }

    pub fn receive_message(
        transaction_id: TransactionId,
        tunnel: &str,
        message: &str,
    ) -> Result<Self, ValidationError> {
        Ok(Command::ReceiveMessage {
            transaction_id,
            tunnel: TunnelName::new(tunnel)?,
            message: MessageBody::new(message)?,
        })
    }

    /// Parse the payload of a PDU into the command designated by `indicator`.
    pub fn parse(
        indicator: u8,
        transaction_id: TransactionId,
        payload: &[u8],
    ) -> Result<Self, CommandError> {
        match indicator {
            ACKNOWLEDGEMENT_INDICATOR => parse_acknowledgement(transaction_id, payload),
            CREATE_TUNNEL_INDICATOR => parse_create_tunnel(transaction_id, payload),
            LISTEN_TUNNEL_INDICATOR => parse_listen_tunnel(transaction_id, payload),
            PUBLISH_MESSAGE_INDICATOR => {
                let (tunnel, message) = parse_tunnel_message("publish_message", payload)?;
                Ok(Command::PublishMessage {
                    transaction_id,
                    tunnel,
                    message,
                })
            }
            RECEIVE_MESSAGE_INDICATOR => {
                let (tunnel, message) = parse_tunnel_message("receive_message", payload)?;
                Ok(Command::ReceiveMessage {
                    transaction_id,
                    tunnel,
                    message,
                })
            }
            other => Err(CommandError::UnknownIndicator(other)),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        match self {
            Command::Ack { transaction_id }
            | Command::Nack { transaction_id }
            | Command::CreateTunnel { transaction_id, .. }
            | Command::ListenTunnel { transaction_id, .. }
            | Command::PublishMessage { transaction_id, .. }
            | Command::ReceiveMessage { transaction_id, .. } => *transaction_id,
        }
    }

    pub fn indicator(&self) -> u8 {
        match self {
            Command::Ack { .. } | Command::Nack { .. } => ACKNOWLEDGEMENT_INDICATOR,
            Command::CreateTunnel { .. } => CREATE_TUNNEL_INDICATOR,
            Command::ListenTunnel { .. } => LISTEN_TUNNEL_INDICATOR,
            Command::PublishMessage { .. } => PUBLISH_MESSAGE_INDICATOR,
            Command::ReceiveMessage { .. } => RECEIVE_MESSAGE_INDICATOR,
        }
    }

    /// Wire payload, without indicator, id or delimiter.
    pub fn payload(&self) -> Bytes {
        match self {
            Command::Ack { .. } => Bytes::from_static(ACK_MARKER),
            Command::Nack { .. } => Bytes::from_static(NACK_MARKER),
            Command::CreateTunnel { name, kind, .. } => {
                let mut buf = BytesMut::with_capacity(1 + name.as_str().len());
                buf.put_u8(*kind as u8);
                buf.put_slice(name.as_str().as_bytes());
                buf.freeze()
            }
            Command::ListenTunnel { name, .. } => Bytes::copy_from_slice(name.as_str().as_bytes()),
            Command::PublishMessage {
                tunnel, message, ..
            }
            | Command::ReceiveMessage {
                tunnel, message, ..
            } => {
                let mut buf = BytesMut::with_capacity(tunnel.as_str().len() + 1 + message.len());
                buf.put_slice(tunnel.as_str().as_bytes());
                buf.put_u8(SEPARATOR);
                buf.put_slice(message.as_str().as_bytes());
                buf.freeze()
            }
        }
    }

    /// Short label used in logs.
    pub fn info(&self) -> String {
        match self {
            Command::Ack { .. } => "ACK".to_string(),
            Command::Nack { .. } => "NACK".to_string(),
            Command::CreateTunnel { name, .. } => format!("CREATE_TUNNEL({})", name),
            Command::ListenTunnel { name, .. } => format!("LISTEN_TUNNEL({})", name),
            Command::PublishMessage {
                tunnel, message, ..
            } => format!("PUBLISH_MESSAGE[{}]message_size({})", tunnel, message.len()),
            Command::ReceiveMessage {
                tunnel, message, ..
            } => format!("RECEIVE_MESSAGE[{}]message_size({})", tunnel, message.len()),
        }
    }
}

fn parse_acknowledgement(
    transaction_id: TransactionId,
    payload: &[u8],
) -> Result<Command, CommandError> {
    match payload {
        ACK_MARKER => Ok(Command::Ack { transaction_id }),
        NACK_MARKER => Ok(Command::Nack { transaction_id }),
        other => Err(CommandError::UnknownAcknowledgement(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

fn parse_create_tunnel(
    transaction_id: TransactionId,
    payload: &[u8],
) -> Result<Command, CommandError> {
    let (&kind, name) = payload
        .split_first()
        .ok_or(CommandError::MissingTunnelType)?;

    let invalid = |source| CommandError::Invalid {
        command: "create_tunnel",
        source,
    };
    let kind = TunnelKind::try_from(kind).map_err(invalid)?;
    let name = TunnelName::from_wire(name).map_err(invalid)?;

    Ok(Command::CreateTunnel {
        transaction_id,
        name,
        kind,
    })
}

fn parse_listen_tunnel(
    transaction_id: TransactionId,
    payload: &[u8],
) -> Result<Command, CommandError> {
    if payload.is_empty() {
        return Err(CommandError::MissingTunnelName);
    }

    let name = TunnelName::from_wire(payload).map_err(|source| CommandError::Invalid {
        command: "listen_tunnel",
        source,
    })?;

    Ok(Command::ListenTunnel {
        transaction_id,
        name,
    })
}

/// Split `<tunnel> <message>` on the first space.
fn parse_tunnel_message(
    command: &'static str,
    payload: &[u8],
) -> Result<(TunnelName, MessageBody), CommandError> {
    let separator = payload
        .iter()
        .position(|b| *b == SEPARATOR)
        .ok_or(CommandError::MissingSeparator)?;

    let invalid = |source| CommandError::Invalid { command, source };
    let tunnel = TunnelName::from_wire(&payload[..separator]).map_err(invalid)?;
    let message = MessageBody::from_wire(&payload[separator + 1..]).map_err(invalid)?;

    Ok((tunnel, message))
}
