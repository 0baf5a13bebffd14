//! Message stream utilities.
//!
//! The [`Decoder`] is the frame parser: it consumes append-only byte chunks
//! from the transport and yields whole protocol messages, or typed errors.
//! A frame with a bad checksum or a malformed body is consumed and skipped;
//! the stream stays usable. A wrong magic or an oversized length prefix is
//! fatal: nothing downstream of it can be trusted.
use std::io;

use thiserror::Error;

use bitcoin::consensus::{encode, Decodable};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::network::message::CommandString;
use bitcoin::network::Magic;

use gold_types::messages::p2p::{NetworkMessage, RawNetworkMessage, MAX_MSG_SIZE};

/// Size of a frame header: magic, command, payload length, checksum.
const HEADER_SIZE: usize = 24;

/// A framing error.
#[derive(Error, Debug)]
pub enum Error {
    /// The frame carries a foreign network magic. Fatal.
    #[error("invalid message magic {0}")]
    Magic(Magic),
    /// The length prefix exceeds the maximum message size. Fatal.
    #[error("frame of {0} bytes exceeds the maximum message size")]
    Oversized(u32),
    /// The command string is not valid ASCII. The frame is skipped.
    #[error("malformed command string: {0}")]
    Command(encode::Error),
    /// The payload checksum doesn't match. The frame is skipped.
    #[error("invalid checksum for `{command}` frame")]
    Checksum {
        /// Command of the offending frame.
        command: String,
    },
    /// The payload body doesn't parse. The frame is skipped.
    #[error("malformed `{command}` payload: {error}")]
    Payload {
        /// Command of the offending frame.
        command: String,
        /// Underlying decode error.
        error: encode::Error,
    },
}

impl Error {
    /// Whether the stream can continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Magic(_) | Self::Oversized(_))
    }
}

/// Message stream decoder.
///
/// Used to turn a byte stream into network messages.
#[derive(Debug)]
pub struct Decoder {
    unparsed: Vec<u8>,
    magic: Magic,
}

impl Decoder {
    /// Create a new stream decoder for the given network magic.
    pub fn new(capacity: usize, magic: Magic) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
            magic,
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next message. Returns [`None`] if a whole
    /// frame isn't buffered yet.
    pub fn decode_next(&mut self) -> Result<Option<RawNetworkMessage>, Error> {
        if self.unparsed.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = Magic::from_bytes(
            self.unparsed[..4]
                .try_into()
                .expect("slice is four bytes long"),
        );
        if magic != self.magic {
            return Err(Error::Magic(magic));
        }

        let length = u32::from_le_bytes(
            self.unparsed[16..20]
                .try_into()
                .expect("slice is four bytes long"),
        );
        if length as u64 > MAX_MSG_SIZE {
            return Err(Error::Oversized(length));
        }

        let total = HEADER_SIZE + length as usize;
        if self.unparsed.len() < total {
            return Ok(None);
        }

        // A whole frame is buffered. Whatever happens below, it is consumed.
        let command = CommandString::consensus_decode(&mut &self.unparsed[4..16]);
        let checksum: [u8; 4] = self.unparsed[20..24]
            .try_into()
            .expect("slice is four bytes long");
        let frame: Vec<u8> = self.unparsed.drain(..total).collect();
        let payload = &frame[HEADER_SIZE..];

        let command = match command {
            Ok(command) => command,
            Err(error) => return Err(Error::Command(error)),
        };

        let expected = sha256d::Hash::hash(payload);
        if checksum != expected[..4] {
            return Err(Error::Checksum {
                command: command.to_string(),
            });
        }

        match NetworkMessage::decode(&command, payload) {
            Ok(payload) => Ok(Some(RawNetworkMessage { magic, payload })),
            Err(error) => Err(Error::Payload {
                command: command.to_string(),
                error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gold_types::messages::p2p::serialize_consensus;
    use gold_types::network::Network;

    fn frame(payload: NetworkMessage) -> Vec<u8> {
        serialize_consensus(&RawNetworkMessage {
            magic: Network::Mainnet.magic(),
            payload,
        })
    }

    fn decoder() -> Decoder {
        Decoder::new(1024, Network::Mainnet.magic())
    }

    #[test]
    fn test_decodes_whole_frames() {
        let mut decoder = decoder();

        decoder.input(&frame(NetworkMessage::Ping(Some(42))));
        decoder.input(&frame(NetworkMessage::GetAddr));

        assert!(matches!(
            decoder.decode_next().unwrap().map(|m| m.payload),
            Some(NetworkMessage::Ping(Some(42)))
        ));
        assert!(matches!(
            decoder.decode_next().unwrap().map(|m| m.payload),
            Some(NetworkMessage::GetAddr)
        ));
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn test_waits_for_partial_frames() {
        let mut decoder = decoder();
        let bytes = frame(NetworkMessage::Ping(Some(7)));

        decoder.input(&bytes[..10]);
        assert!(decoder.decode_next().unwrap().is_none());

        decoder.input(&bytes[10..]);
        assert!(decoder.decode_next().unwrap().is_some());
    }

    #[test]
    fn test_wrong_magic_is_fatal() {
        let mut decoder = decoder();
        let mut bytes = frame(NetworkMessage::GetAddr);
        bytes[0] ^= 0xFF;

        decoder.input(&bytes);
        let err = decoder.decode_next().unwrap_err();

        assert!(matches!(err, Error::Magic(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bad_checksum_skips_frame_and_continues() {
        let mut decoder = decoder();
        let mut bad = frame(NetworkMessage::Ping(Some(1)));
        let last = bad.len() - 1;
        bad[last] ^= 0xFF; // corrupt the payload
        decoder.input(&bad);
        decoder.input(&frame(NetworkMessage::GetAddr));

        let err = decoder.decode_next().unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
        assert!(!err.is_fatal());

        // The stream recovers on the next frame.
        assert!(matches!(
            decoder.decode_next().unwrap().map(|m| m.payload),
            Some(NetworkMessage::GetAddr)
        ));
    }

    #[test]
    fn test_unknown_command_is_skippable() {
        let mut decoder = decoder();

        decoder.input(&frame(NetworkMessage::Unknown {
            command: CommandString::try_from_static("filterload").unwrap(),
            payload: vec![1, 2, 3],
        }));

        assert!(matches!(
            decoder.decode_next().unwrap().map(|m| m.payload),
            Some(NetworkMessage::Unknown { .. })
        ));
    }
}
