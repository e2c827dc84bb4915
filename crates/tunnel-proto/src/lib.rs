//! Tunnel Protocol Definitions
//!
//! This crate defines the wire protocol spoken between a tunnel client and a
//! tunnel broker: transaction identifiers, the closed set of commands and the
//! PDU framing that carries exactly one command.
//!
//! ```text
//! ┌───────────┬──────────────────┬─────────────────┬───────────┐
//! │ indicator │ transaction id   │ payload         │ delimiter │
//! │ 1 byte    │ 8 bytes [a-z0-9] │ variable length │ '\n'      │
//! └───────────┴──────────────────┴─────────────────┴───────────┘
//! ```

pub mod codec;
pub mod command;
pub mod id;

pub use codec::{CodecError, FrameError, PduCodec, PduFramer};
pub use command::{
    Command, CommandError, MessageBody, TunnelKind, TunnelName, ValidationError,
    ACKNOWLEDGEMENT_INDICATOR, CREATE_TUNNEL_INDICATOR, LISTEN_TUNNEL_INDICATOR,
    PUBLISH_MESSAGE_INDICATOR, RECEIVE_MESSAGE_INDICATOR,
};
pub use id::{TransactionId, TransactionIdError};

/// Byte terminating every PDU. Never valid inside a name or a message.
pub const DELIMITER: u8 = b'\n';

/// Smallest valid PDU: indicator + transaction id + delimiter.
pub const MIN_PDU_LEN: usize = 1 + id::TRANSACTION_ID_LEN + 1;
