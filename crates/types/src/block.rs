//! Block and block header structures.
//!
//! Headers use the canonical 80-byte layout. Headers produced on merge-mined
//! networks set [`VERSION_AUX_POW`] in their version field and carry an
//! auxiliary proof-of-work blob appended after the 80 bytes.

use std::io;

use bitcoin::consensus::{encode, Decodable, Encodable};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::hash_types::TxMerkleNode;
use bitcoin::{BlockHash, Transaction};

/// Version bit signalling the presence of an auxiliary proof-of-work.
pub const VERSION_AUX_POW: i32 = 1 << 8;

/// A block header.
///
/// The header hash covers the 80-byte base layout only, never the auxiliary
/// proof-of-work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version.
    pub version: i32,
    /// Hash of the previous block in the chain.
    pub prev_blockhash: BlockHash,
    /// Root of the transaction merkle tree.
    pub merkle_root: TxMerkleNode,
    /// Block timestamp, as seconds since epoch.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
    /// Merge-mined auxiliary proof-of-work, present iff the version carries
    /// [`VERSION_AUX_POW`].
    pub aux_pow: Option<Vec<u8>>,
}

impl BlockHeader {
    /// Whether this header announces an auxiliary proof-of-work.
    pub fn has_aux_pow(&self) -> bool {
        self.version & VERSION_AUX_POW != 0
    }

    /// Compute the header hash over the canonical 80-byte layout.
    pub fn block_hash(&self) -> BlockHash {
        let mut base = Vec::with_capacity(80);
        self.encode_base(&mut base)
            .expect("in-memory writers don't error");

        BlockHash::from_raw_hash(sha256d::Hash::hash(&base))
    }

    fn encode_base<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.version.consensus_encode(w)?;
        len += self.prev_blockhash.consensus_encode(w)?;
        len += self.merkle_root.consensus_encode(w)?;
        len += self.time.consensus_encode(w)?;
        len += self.bits.consensus_encode(w)?;
        len += self.nonce.consensus_encode(w)?;

        Ok(len)
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.encode_base(w)?;

        if self.has_aux_pow() {
            match &self.aux_pow {
                Some(aux) => len += aux.consensus_encode(w)?,
                None => len += Vec::<u8>::new().consensus_encode(w)?,
            }
        }
        Ok(len)
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let version = i32::consensus_decode(r)?;
        let prev_blockhash = BlockHash::consensus_decode(r)?;
        let merkle_root = TxMerkleNode::consensus_decode(r)?;
        let time = u32::consensus_decode(r)?;
        let bits = u32::consensus_decode(r)?;
        let nonce = u32::consensus_decode(r)?;

        let aux_pow = if version & VERSION_AUX_POW != 0 {
            Some(Vec::<u8>::consensus_decode(r)?)
        } else {
            None
        };

        Ok(BlockHeader {
            version,
            prev_blockhash,
            merkle_root,
            time,
            bits,
            nonce,
            aux_pow,
        })
    }
}

/// A full block: header plus transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// The block header.
    pub header: BlockHeader,
    /// Transactions in consensus order.
    pub txdata: Vec<Transaction>,
}

impl Block {
    /// The hash of this block, ie. the hash of its header.
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

impl Encodable for Block {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.header.consensus_encode(w)?;
        len += self.txdata.consensus_encode(w)?;

        Ok(len)
    }
}

impl Decodable for Block {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Block {
            header: BlockHeader::consensus_decode(r)?,
            txdata: Vec::<Transaction>::consensus_decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::consensus::{deserialize, serialize};

    fn header(version: i32) -> BlockHeader {
        BlockHeader {
            version,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: 42,
            aux_pow: None,
        }
    }

    #[test]
    fn test_header_base_layout_is_80_bytes() {
        let bytes = serialize(&header(2));

        assert_eq!(bytes.len(), 80);
    }

    #[test]
    fn test_header_hash_ignores_aux_pow() {
        let plain = header(2 | VERSION_AUX_POW);
        let mut with_aux = plain.clone();
        with_aux.aux_pow = Some(vec![0xab; 64]);

        assert_eq!(plain.block_hash(), with_aux.block_hash());
    }

    #[test]
    fn test_aux_pow_header_roundtrip() {
        let mut h = header(2 | VERSION_AUX_POW);
        h.aux_pow = Some(vec![1, 2, 3, 4]);

        let decoded: BlockHeader = deserialize(&serialize(&h)).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn test_plain_header_roundtrip() {
        let h = header(2);
        let decoded: BlockHeader = deserialize(&serialize(&h)).unwrap();

        assert_eq!(decoded, h);
        assert_eq!(decoded.aux_pow, None);
    }
}
