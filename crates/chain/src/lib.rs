//! Chain store interface consumed by the peer-to-peer layer.
//!
//! The store is the authoritative block and transaction repository.
//! Consensus rule checking happens behind this interface; the session engine
//! only performs lookups and hands payloads over for ingestion.

use bitcoin::{BlockHash, Transaction, Txid};
use thiserror::Error;

use gold_types::{Block, BlockHeader};

pub use memory::MemoryStore;

mod memory;

/// An error returned by the chain store append path.
#[derive(Error, Debug)]
pub enum Error {
    /// The block doesn't connect to our main chain.
    #[error("block {hash} is orphan: previous block {prev} is not our tip")]
    Orphan {
        /// Hash of the rejected block.
        hash: BlockHash,
        /// The previous-block hash it claimed.
        prev: BlockHash,
    },
    /// The block is already stored.
    #[error("block {0} is already known")]
    DuplicateBlock(BlockHash),
}

/// Authoritative block and transaction repository.
///
/// Lookups are expected to be cheap, cache-backed and non-blocking: they are
/// called from the reactor thread.
pub trait ChainStore: Clone + Send + Sync {
    /// Current best height. `-1` when the chain is empty.
    fn height(&self) -> i64;

    /// Block locator: hashes from the tip backwards, with exponentially
    /// growing gaps, ending at the lowest stored block.
    fn locator(&self) -> Vec<BlockHash>;

    /// Look up a block on the main chain by hash.
    fn block(&self, hash: &BlockHash) -> Option<Block>;

    /// Look up a transaction by id. Covers both confirmed transactions and
    /// the unconfirmed table.
    fn tx(&self, txid: &Txid) -> Option<Transaction>;

    /// Height of the given block on the main chain, if present.
    fn block_height(&self, hash: &BlockHash) -> Option<i64>;

    /// Up to `max` headers strictly above the given height, ascending.
    fn headers_after(&self, height: i64, max: usize) -> Vec<BlockHeader>;

    /// Up to `max` block hashes strictly above the given height, ascending.
    fn hashes_after(&self, height: i64, max: usize) -> Vec<BlockHash>;

    /// Append a header to the chain. The first header appended to an empty
    /// store becomes the genesis.
    fn import_header(&self, header: BlockHeader) -> Result<i64, Error>;

    /// Append a full block to the chain.
    fn import_block(&self, block: Block) -> Result<i64, Error>;

    /// Record an unconfirmed transaction.
    fn import_tx(&self, tx: Transaction);
}
