//! Peer-to-peer wire messages.
//!
//! Framing: 4-byte network magic, 12-byte null-padded command, 4-byte
//! little-endian payload length, 4-byte checksum (first four bytes of the
//! double-SHA256 of the payload), payload.

use std::io::{self, Read};

use bitcoin::consensus::{
    encode::{self, CheckedData},
    Decodable, Encodable,
};
use bitcoin::network::message::CommandString;
use bitcoin::network::message_blockdata::{GetBlocksMessage, GetHeadersMessage};
use bitcoin::network::message_network::VersionMessage;
use bitcoin::network::{Address, Magic};
use bitcoin::{BlockHash, Transaction, Txid};

use crate::block::{Block, BlockHeader};
use crate::consensus::{HeadersWrapper, VecWrapper};

/// Maximum size of a message payload, in bytes.
pub const MAX_MSG_SIZE: u64 = 5_000_000;

/// Wire type id of a transaction inventory entry.
const INV_TYPE_TX: u32 = 1;
/// Wire type id of a block inventory entry.
const INV_TYPE_BLOCK: u32 = 2;

/// An object announcement, as carried by `inv` and `getdata` messages.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Inventory {
    /// A transaction, by txid.
    Tx(Txid),
    /// A block, by block hash.
    Block(BlockHash),
}

impl Encodable for Inventory {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        match self {
            Inventory::Tx(txid) => {
                len += INV_TYPE_TX.consensus_encode(w)?;
                len += txid.consensus_encode(w)?;
            }
            Inventory::Block(hash) => {
                len += INV_TYPE_BLOCK.consensus_encode(w)?;
                len += hash.consensus_encode(w)?;
            }
        }
        Ok(len)
    }
}

impl Decodable for Inventory {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let kind = u32::consensus_decode(r)?;

        match kind {
            INV_TYPE_TX => Ok(Inventory::Tx(Txid::consensus_decode(r)?)),
            INV_TYPE_BLOCK => Ok(Inventory::Block(BlockHash::consensus_decode(r)?)),
            _ => Err(encode::Error::ParseFailed("unknown inventory type")),
        }
    }
}

/// Raw message which is sent between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNetworkMessage {
    pub magic: Magic,
    pub payload: NetworkMessage,
}

/// A message payload, tagged by command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    /// VERSION method. Opens the handshake.
    Version(VersionMessage),

    /// VERACK method. Acknowledges a received version.
    Verack,

    /// ADDR method. Gossips peer addresses with last-seen times.
    Addr(Vec<(u32, Address)>),

    /// GETADDR method. Requests an `addr` sample.
    GetAddr,

    /// INV method. Announces transaction and block hashes.
    Inv(Vec<Inventory>),

    /// GETDATA method. Requests payloads for announced hashes.
    GetData(Vec<Inventory>),

    /// GETBLOCKS method. Requests block inventories above a locator.
    GetBlocks(GetBlocksMessage),

    /// GETHEADERS method. Requests headers above a locator.
    GetHeaders(GetHeadersMessage),

    /// HEADERS method. Serves block headers.
    Headers(Vec<BlockHeader>),

    /// BLOCK method. A full block payload.
    Block(Block),

    /// TX method. A transaction payload.
    Tx(Transaction),

    /// PING method. The nonce is absent for protocol versions at or below
    /// BIP 0031.
    Ping(Option<u32>),

    /// PONG method. Echoes a ping nonce.
    Pong(u32),

    /// ALERT method. Network alert payload, passed through opaquely.
    Alert(Vec<u8>),

    /// Any other message.
    Unknown {
        /// The command of this message.
        command: CommandString,
        /// The payload of this message.
        payload: Vec<u8>,
    },
}

impl NetworkMessage {
    pub fn cmd(&self) -> &'static str {
        match *self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::GetBlocks(_) => "getblocks",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::Alert(_) => "alert",

            _ => "unknown",
        }
    }

    /// Return the CommandString for the message command.
    pub fn command(&self) -> CommandString {
        match self {
            NetworkMessage::Unknown { command, .. } => command.clone(),
            _ => CommandString::try_from_static(self.cmd()).expect("cmd returns valid commands"),
        }
    }

    /// Decode a payload body for the given command. Unrecognized commands
    /// yield [`NetworkMessage::Unknown`], never an error.
    pub fn decode(command: &CommandString, payload: &[u8]) -> Result<Self, encode::Error> {
        let mut cursor = io::Cursor::new(payload);

        let message = match command.to_string().as_str() {
            "version" => NetworkMessage::Version(Decodable::consensus_decode(&mut cursor)?),
            "verack" => NetworkMessage::Verack,
            "addr" => NetworkMessage::Addr(Decodable::consensus_decode(&mut cursor)?),
            "getaddr" => NetworkMessage::GetAddr,
            "inv" => NetworkMessage::Inv(VecWrapper::consensus_decode(&mut cursor)?.0),
            "getdata" => NetworkMessage::GetData(VecWrapper::consensus_decode(&mut cursor)?.0),
            "getblocks" => NetworkMessage::GetBlocks(Decodable::consensus_decode(&mut cursor)?),
            "getheaders" => NetworkMessage::GetHeaders(Decodable::consensus_decode(&mut cursor)?),
            "headers" => NetworkMessage::Headers(HeadersWrapper::consensus_decode(&mut cursor)?.0),
            "block" => NetworkMessage::Block(Decodable::consensus_decode(&mut cursor)?),
            "tx" => NetworkMessage::Tx(Decodable::consensus_decode(&mut cursor)?),
            "ping" => {
                if payload.is_empty() {
                    NetworkMessage::Ping(None)
                } else {
                    NetworkMessage::Ping(Some(Decodable::consensus_decode(&mut cursor)?))
                }
            }
            "pong" => NetworkMessage::Pong(Decodable::consensus_decode(&mut cursor)?),
            "alert" => NetworkMessage::Alert(payload.to_vec()),
            _ => NetworkMessage::Unknown {
                command: command.clone(),
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }

    /// Serialize the payload body, without framing.
    pub fn serialize_payload(&self) -> Vec<u8> {
        match self {
            NetworkMessage::Version(msg) => serialize_consensus(msg),
            NetworkMessage::Verack | NetworkMessage::GetAddr => Vec::new(),
            NetworkMessage::Addr(addrs) => serialize_consensus(addrs),
            NetworkMessage::Inv(inv) => serialize_consensus(&VecWrapper(inv.to_vec())),
            NetworkMessage::GetData(inv) => serialize_consensus(&VecWrapper(inv.to_vec())),
            NetworkMessage::GetBlocks(msg) => serialize_consensus(msg),
            NetworkMessage::GetHeaders(msg) => serialize_consensus(msg),
            NetworkMessage::Headers(headers) => {
                serialize_consensus(&HeadersWrapper(headers.to_vec()))
            }
            NetworkMessage::Block(block) => serialize_consensus(block),
            NetworkMessage::Tx(tx) => serialize_consensus(tx),
            NetworkMessage::Ping(Some(nonce)) => serialize_consensus(nonce),
            NetworkMessage::Ping(None) => Vec::new(),
            NetworkMessage::Pong(nonce) => serialize_consensus(nonce),
            NetworkMessage::Alert(payload) => payload.clone(),
            NetworkMessage::Unknown { payload, .. } => payload.clone(),
        }
    }
}

impl RawNetworkMessage {
    /// Return the CommandString for the message command.
    pub fn command(&self) -> CommandString {
        self.payload.command()
    }
}

pub fn serialize_consensus<T: Encodable + ?Sized>(data: &T) -> Vec<u8> {
    let mut encoder = Vec::new();
    let len = data
        .consensus_encode(&mut encoder)
        .expect("in-memory writers don't error");
    debug_assert_eq!(len, encoder.len());
    encoder
}

impl Encodable for RawNetworkMessage {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.magic.consensus_encode(w)?;
        len += self.command().consensus_encode(w)?;
        len += CheckedData(self.payload.serialize_payload()).consensus_encode(w)?;

        Ok(len)
    }
}

impl Decodable for RawNetworkMessage {
    fn consensus_decode_from_finite_reader<R: io::Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        let magic = Decodable::consensus_decode(r)?;
        let command = CommandString::consensus_decode(r)?;
        let raw_payload = CheckedData::consensus_decode(r)?.0;

        let payload = NetworkMessage::decode(&command, &raw_payload)?;

        Ok(RawNetworkMessage { magic, payload })
    }

    #[inline]
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Self::consensus_decode_from_finite_reader(r.take(MAX_MSG_SIZE).by_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VERSION_AUX_POW;
    use crate::network::Network;
    use bitcoin::consensus::{deserialize, serialize};
    use bitcoin::hashes::Hash;
    use bitcoin::network::constants::ServiceFlags;
    use bitcoin::hash_types::TxMerkleNode;

    fn raw(payload: NetworkMessage) -> RawNetworkMessage {
        RawNetworkMessage {
            magic: Network::Mainnet.magic(),
            payload,
        }
    }

    fn roundtrip(payload: NetworkMessage) {
        let msg = raw(payload);
        let decoded: RawNetworkMessage = deserialize(&serialize(&msg)).unwrap();

        assert_eq!(decoded, msg);
    }

    fn header() -> BlockHeader {
        BlockHeader {
            version: 2,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce: 2_083_236_893,
            aux_pow: None,
        }
    }

    #[test]
    fn test_empty_payload_roundtrips() {
        roundtrip(NetworkMessage::Verack);
        roundtrip(NetworkMessage::GetAddr);
        roundtrip(NetworkMessage::Ping(None));
    }

    #[test]
    fn test_version_roundtrips() {
        roundtrip(NetworkMessage::Version(VersionMessage {
            version: 70001,
            services: ServiceFlags::NETWORK,
            timestamp: 1_700_000_000,
            receiver: Address::new(&([10, 0, 0, 1], 8121).into(), ServiceFlags::NONE),
            sender: Address::new(&([10, 0, 0, 2], 8121).into(), ServiceFlags::NETWORK),
            nonce: 812_121,
            user_agent: "/gold:0.1.0/".to_owned(),
            start_height: 240_000,
            relay: true,
        }));
    }

    #[test]
    fn test_ping_pong_roundtrips() {
        roundtrip(NetworkMessage::Ping(Some(812_190_342)));
        roundtrip(NetworkMessage::Pong(812_190_342));
    }

    #[test]
    fn test_inventory_roundtrips() {
        roundtrip(NetworkMessage::Inv(vec![
            Inventory::Tx(Txid::all_zeros()),
            Inventory::Block(BlockHash::all_zeros()),
        ]));
        roundtrip(NetworkMessage::GetData(vec![Inventory::Block(
            BlockHash::all_zeros(),
        )]));
    }

    #[test]
    fn test_getblocks_roundtrips() {
        roundtrip(NetworkMessage::GetBlocks(GetBlocksMessage {
            version: 70001,
            locator_hashes: vec![BlockHash::all_zeros()],
            stop_hash: BlockHash::all_zeros(),
        }));
        roundtrip(NetworkMessage::GetHeaders(GetHeadersMessage {
            version: 70001,
            locator_hashes: vec![BlockHash::all_zeros()],
            stop_hash: BlockHash::all_zeros(),
        }));
    }

    #[test]
    fn test_headers_roundtrips() {
        let mut aux = header();
        aux.version |= VERSION_AUX_POW;
        aux.aux_pow = Some(vec![7; 32]);

        roundtrip(NetworkMessage::Headers(vec![header(), aux]));
    }

    #[test]
    fn test_headers_payload_layout() {
        // One plain header: varint count, 80 bytes, varint zero tx count.
        let payload = NetworkMessage::Headers(vec![header()]).serialize_payload();

        assert_eq!(payload.len(), 1 + 80 + 1);
        assert_eq!(payload[0], 1);
        assert_eq!(payload[payload.len() - 1], 0);
    }

    #[test]
    fn test_addr_roundtrips() {
        let addr = Address::new(&([10, 0, 0, 1], 8121).into(), ServiceFlags::NETWORK);
        roundtrip(NetworkMessage::Addr(vec![(1_700_000_000, addr)]));
    }

    #[test]
    fn test_alert_roundtrips() {
        roundtrip(NetworkMessage::Alert(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn test_unknown_command_roundtrips() {
        roundtrip(NetworkMessage::Unknown {
            command: CommandString::try_from_static("mempool").unwrap(),
            payload: vec![],
        });
    }

    #[test]
    fn test_inventory_wire_type_ids() {
        let tx = serialize_consensus(&Inventory::Tx(Txid::all_zeros()));
        let block = serialize_consensus(&Inventory::Block(BlockHash::all_zeros()));

        assert_eq!(tx[0], 1);
        assert_eq!(block[0], 2);
        assert_eq!(tx.len(), 36);
    }
}
