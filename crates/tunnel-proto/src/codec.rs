//! Codec for encoding/decoding tunnel PDUs

use crate::command::{Command, CommandError};
use crate::id::{TransactionId, TRANSACTION_ID_LEN};
use crate::{DELIMITER, MIN_PDU_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid payload length: cannot be less than 10 bytes (got {0})")]
    TooShort(usize),

    #[error("invalid payload delimiter 0x{0:02x}, expected '\\n'")]
    InvalidDelimiter(u8),

    #[error("invalid transaction id")]
    InvalidTransactionId,

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl CodecError {
    /// Returns true if the PDU envelope itself was broken, as opposed to its payload
    pub fn is_framing(&self) -> bool {
        !matches!(self, CodecError::Command(_))
    }
}

/// PDU codec
pub struct PduCodec;

impl PduCodec {
    /// Encode a command to one PDU
    ///
    /// Format: [indicator: u8][transaction id: 8 bytes][payload][delimiter]
    pub fn encode(cmd: &Command) -> Bytes {
        let payload = cmd.payload();
        let mut buf = BytesMut::with_capacity(MIN_PDU_LEN + payload.len());
        buf.put_u8(cmd.indicator());
        buf.put_slice(cmd.transaction_id().as_bytes());
        buf.put_slice(&payload);
        buf.put_u8(DELIMITER);
        buf.freeze()
    }

    /// Decode exactly one PDU, delimiter included
    pub fn decode(pdu: &[u8]) -> Result<Command, CodecError> {
        if pdu.len() < MIN_PDU_LEN {
            return Err(CodecError::TooShort(pdu.len()));
        }

        let last = pdu[pdu.len() - 1];
        if last != DELIMITER {
            return Err(CodecError::InvalidDelimiter(last));
        }

        let indicator = pdu[0];
        let transaction_id = TransactionId::from_bytes(&pdu[1..1 + TRANSACTION_ID_LEN])
            .map_err(|_| CodecError::InvalidTransactionId)?;
        let payload = &pdu[1 + TRANSACTION_ID_LEN..pdu.len() - 1];

        Ok(Command::parse(indicator, transaction_id, payload)?)
    }
}

/// Stream framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: more than {0} bytes without delimiter")]
    FrameTooLarge(usize),
}

/// Splits a byte stream into PDUs on the delimiter
///
/// Yielded frames keep their trailing delimiter so they can be handed to
/// [`PduCodec::decode`] unchanged.
#[derive(Debug, Clone)]
pub struct PduFramer {
    max_frame_len: usize,
    /// Bytes already scanned for a delimiter in the current buffer
    scanned: usize,
}

impl PduFramer {
    /// Default maximum PDU size (64KB)
    pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

    pub fn new() -> Self {
        Self::with_max_frame_len(Self::DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            scanned: 0,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for PduFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PduFramer {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match buf[self.scanned..].iter().position(|b| *b == DELIMITER) {
            Some(offset) => {
                let end = self.scanned + offset + 1;
                self.scanned = 0;
                if end > self.max_frame_len {
                    return Err(FrameError::FrameTooLarge(self.max_frame_len));
                }
                Ok(Some(buf.split_to(end).freeze()))
            }
            None => {
                self.scanned = buf.len();
                if buf.len() > self.max_frame_len {
                    return Err(FrameError::FrameTooLarge(self.max_frame_len));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for PduFramer {
    type Error = FrameError;

    fn encode(&mut self, pdu: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.extend_from_slice(&pdu);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> TransactionId {
        "abcd1234".parse().unwrap()
    }

    #[test]
    fn test_encode() {
        let pdu = PduCodec::encode(&Command::listen_tunnel(id(), "Bidule").unwrap());
        assert_eq!(pdu, Bytes::from_static(b"#abcd1234Bidule\n"));

        let pdu = PduCodec::encode(&Command::ack(id()));
        assert_eq!(pdu, Bytes::from_static(b"@abcd1234OK\n"));
    }

    #[test]
    fn test_round_trip_every_variant() {
        let commands = vec![
            Command::ack(TransactionId::random()),
            Command::nack(TransactionId::random()),
            Command::create_tunnel(TransactionId::random(), "Valid1").unwrap(),
            Command::listen_tunnel(TransactionId::random(), "X").unwrap(),
            Command::publish_message(TransactionId::random(), "News", "hello  world ").unwrap(),
            Command::receive_message(TransactionId::random(), "News", " leading space").unwrap(),
        ];

        for cmd in commands {
            let decoded = PduCodec::decode(&PduCodec::encode(&cmd)).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn test_decode_errors() {
        let cases: Vec<(&[u8], CodecError)> = vec![
            (&b""[..], CodecError::TooShort(0)),
            (&b"=MyData\n"[..], CodecError::TooShort(8)),
            (&b"@abcd1234\r"[..], CodecError::InvalidDelimiter(b'\r')),
            (&b"@abcd123_OK\n"[..], CodecError::InvalidTransactionId),
            (&b"@ABCD1234OK\n"[..], CodecError::InvalidTransactionId),
            (
                &b"=abcd1234data\n"[..],
                CodecError::Command(CommandError::UnknownIndicator(b'=')),
            ),
            (
                &b"@abcd1234NO\n"[..],
                CodecError::Command(CommandError::UnknownAcknowledgement("NO".to_string())),
            ),
            (
                &b"#abcd1234\n"[..],
                CodecError::Command(CommandError::MissingTunnelName),
            ),
        ];

        for (pdu, expected) in cases {
            assert_eq!(PduCodec::decode(pdu), Err(expected));
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(CodecError::TooShort(3).is_framing());
        assert!(CodecError::InvalidDelimiter(b'x').is_framing());
        assert!(CodecError::InvalidTransactionId.is_framing());
        assert!(!CodecError::Command(CommandError::MissingSeparator).is_framing());
    }

    #[test]
    fn test_framer_splits_stream() {
        let mut framer = PduFramer::new();
        let mut buf = BytesMut::from(&b"@abcd1234OK\n#abcd1234Bid"[..]);

        let first = framer.decode(&mut buf).unwrap();
        assert_eq!(first, Some(Bytes::from_static(b"@abcd1234OK\n")));

        assert_eq!(framer.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"ule\n");
        let second = framer.decode(&mut buf).unwrap();
        assert_eq!(second, Some(Bytes::from_static(b"#abcd1234Bidule\n")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_framer_rejects_oversized_frame() {
        let mut framer = PduFramer::with_max_frame_len(16);
        let mut buf = BytesMut::from(&[b'a'; 32][..]);

        let result = framer.decode(&mut buf);
        assert!(matches!(result, Err(FrameError::FrameTooLarge(16))));
    }
}
