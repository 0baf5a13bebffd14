//! In-memory chain store.
//!
//! Backs the node until a persistent store is wired in, and doubles as the
//! store used by the protocol tests. Appends enforce previous-hash linkage
//! only; full consensus checking stays outside the store interface.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bitcoin::{BlockHash, Transaction, Txid};
use tracing::debug;

use gold_types::{Block, BlockHeader};

use crate::{ChainStore, Error};

#[derive(Debug, Default)]
struct Inner {
    /// Main chain, by height.
    chain: Vec<(BlockHash, BlockHeader)>,
    /// Block hash to height.
    heights: HashMap<BlockHash, usize>,
    /// Full blocks, for the ones we have bodies for.
    blocks: HashMap<BlockHash, Block>,
    /// Confirmed transactions.
    confirmed: HashMap<Txid, Transaction>,
    /// Unconfirmed transactions received from the network.
    unconfirmed: HashMap<Txid, Transaction>,
}

/// An in-memory [`ChainStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, header: BlockHeader) -> Result<i64, Error> {
        let mut inner = self.inner.write().expect("lock is not poisoned");
        let hash = header.block_hash();

        if inner.heights.contains_key(&hash) {
            return Err(Error::DuplicateBlock(hash));
        }
        if let Some((tip, _)) = inner.chain.last() {
            if header.prev_blockhash != *tip {
                return Err(Error::Orphan {
                    hash,
                    prev: header.prev_blockhash,
                });
            }
        }
        let height = inner.chain.len();

        inner.heights.insert(hash, height);
        inner.chain.push((hash, header));

        debug!(target: "chain", "Stored block {} at height {}", hash, height);

        Ok(height as i64)
    }
}

impl ChainStore for MemoryStore {
    fn height(&self) -> i64 {
        let inner = self.inner.read().expect("lock is not poisoned");

        inner.chain.len() as i64 - 1
    }

    fn locator(&self) -> Vec<BlockHash> {
        let inner = self.inner.read().expect("lock is not poisoned");
        let mut locator = Vec::new();

        if inner.chain.is_empty() {
            return locator;
        }

        let mut height = inner.chain.len() as i64 - 1;
        let mut step = 1;

        while height > 0 {
            locator.push(inner.chain[height as usize].0);

            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        locator.push(inner.chain[0].0);

        locator
    }

    fn block(&self, hash: &BlockHash) -> Option<Block> {
        let inner = self.inner.read().expect("lock is not poisoned");

        inner.blocks.get(hash).cloned()
    }

    fn tx(&self, txid: &Txid) -> Option<Transaction> {
        let inner = self.inner.read().expect("lock is not poisoned");

        inner
            .confirmed
            .get(txid)
            .or_else(|| inner.unconfirmed.get(txid))
            .cloned()
    }

    fn block_height(&self, hash: &BlockHash) -> Option<i64> {
        let inner = self.inner.read().expect("lock is not poisoned");

        inner.heights.get(hash).map(|h| *h as i64)
    }

    fn headers_after(&self, height: i64, max: usize) -> Vec<BlockHeader> {
        let inner = self.inner.read().expect("lock is not poisoned");
        let start = (height + 1).max(0) as usize;

        inner
            .chain
            .iter()
            .skip(start)
            .take(max)
            .map(|(_, header)| header.clone())
            .collect()
    }

    fn hashes_after(&self, height: i64, max: usize) -> Vec<BlockHash> {
        let inner = self.inner.read().expect("lock is not poisoned");
        let start = (height + 1).max(0) as usize;

        inner
            .chain
            .iter()
            .skip(start)
            .take(max)
            .map(|(hash, _)| *hash)
            .collect()
    }

    fn import_header(&self, header: BlockHeader) -> Result<i64, Error> {
        self.append(header)
    }

    fn import_block(&self, block: Block) -> Result<i64, Error> {
        let height = self.append(block.header.clone())?;
        let hash = block.block_hash();

        let mut inner = self.inner.write().expect("lock is not poisoned");
        for tx in &block.txdata {
            let txid = tx.txid();

            inner.unconfirmed.remove(&txid);
            inner.confirmed.insert(txid, tx.clone());
        }
        inner.blocks.insert(hash, block);

        Ok(height)
    }

    fn import_tx(&self, tx: Transaction) {
        let mut inner = self.inner.write().expect("lock is not poisoned");

        inner.unconfirmed.insert(tx.txid(), tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::hash_types::TxMerkleNode;

    fn genesis() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_368_576_000,
            bits: 0x1d00ffff,
            nonce: 0,
            aux_pow: None,
        }
    }

    fn next_header(prev: &BlockHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: prev.block_hash(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: prev.time + 120,
            bits: prev.bits,
            nonce,
            aux_pow: None,
        }
    }

    fn store_with(n: usize) -> (MemoryStore, Vec<BlockHeader>) {
        let store = MemoryStore::new();
        let mut headers = vec![genesis()];

        for i in 1..n {
            let next = next_header(&headers[i - 1], i as u32);
            headers.push(next);
        }
        for header in &headers {
            store.import_header(header.clone()).unwrap();
        }
        (store, headers)
    }

    #[test]
    fn test_empty_store_has_height_minus_one() {
        let store = MemoryStore::new();

        assert_eq!(store.height(), -1);
        assert!(store.locator().is_empty());
    }

    #[test]
    fn test_import_enforces_linkage() {
        let store = MemoryStore::new();
        let g = genesis();

        store.import_header(g.clone()).unwrap();

        let orphan = next_header(&next_header(&g, 1), 2);
        assert!(matches!(
            store.import_header(orphan),
            Err(Error::Orphan { .. })
        ));
        assert!(matches!(
            store.import_header(g),
            Err(Error::DuplicateBlock(_))
        ));
    }

    #[test]
    fn test_headers_after_is_ascending_and_bounded() {
        let (store, headers) = store_with(8);

        let after = store.headers_after(2, 3);
        assert_eq!(after.len(), 3);
        assert_eq!(after[0], headers[3]);
        assert_eq!(after[2], headers[5]);

        assert!(store.headers_after(7, 10).is_empty());
    }

    #[test]
    fn test_locator_starts_at_tip_and_ends_at_genesis() {
        let (store, headers) = store_with(32);
        let locator = store.locator();

        assert_eq!(locator.first(), Some(&headers[31].block_hash()));
        assert_eq!(locator.last(), Some(&headers[0].block_hash()));
        // Gaps grow after the first ten entries.
        assert!(locator.len() < 32);
    }

    #[test]
    fn test_block_height_lookup() {
        let (store, headers) = store_with(4);

        assert_eq!(store.block_height(&headers[2].block_hash()), Some(2));
        assert_eq!(store.block_height(&BlockHash::all_zeros()), None);
    }
}
