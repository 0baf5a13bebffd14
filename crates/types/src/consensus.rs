//! Consensus encoding helpers for collections that the wire codec carries
//! but the `bitcoin` crate has no encoding for.

use std::io;

use bitcoin::consensus::encode::{self, VarInt};
use bitcoin::consensus::{Decodable, Encodable};

use crate::block::BlockHeader;

/// Upper bound on decoded collection lengths. Prevents a hostile length
/// prefix from forcing a huge allocation.
const MAX_VEC_LEN: u64 = 50_000;

/// A length-prefixed vector of consensus-encodable items.
pub(crate) struct VecWrapper<T>(pub Vec<T>);

impl<T: Encodable> Encodable for VecWrapper<T> {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = VarInt(self.0.len() as u64).consensus_encode(w)?;

        for item in &self.0 {
            len += item.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl<T: Decodable> Decodable for VecWrapper<T> {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let count = VarInt::consensus_decode(r)?.0;

        if count > MAX_VEC_LEN {
            return Err(encode::Error::ParseFailed("oversized vector"));
        }

        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(T::consensus_decode(r)?);
        }
        Ok(VecWrapper(items))
    }
}

/// The `headers` message payload: each header is followed by a varint
/// transaction count, which is always zero. Auxiliary proof-of-work, when a
/// header carries one, is encoded by the header itself and thus precedes the
/// trailing zero.
pub(crate) struct HeadersWrapper(pub Vec<BlockHeader>);

impl Encodable for HeadersWrapper {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = VarInt(self.0.len() as u64).consensus_encode(w)?;

        for header in &self.0 {
            len += header.consensus_encode(w)?;
            len += VarInt(0).consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl Decodable for HeadersWrapper {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let count = VarInt::consensus_decode(r)?.0;

        if count > MAX_VEC_LEN {
            return Err(encode::Error::ParseFailed("oversized headers message"));
        }

        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            headers.push(BlockHeader::consensus_decode(r)?);
            // Transaction count. Zero on the wire, tolerated otherwise.
            VarInt::consensus_decode(r)?;
        }
        Ok(HeadersWrapper(headers))
    }
}
