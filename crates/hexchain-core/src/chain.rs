//! Ledger-reader capability and an in-memory ledger.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::block::HexBlock;
use crate::config::ChainConfig;
use crate::hash::Hash;
use crate::header::HexHeader;
use crate::state::WorldState;

/// Read access to the ledger, as consumed by validation and the network.
///
/// Implementations must be safe to share across validator threads and
/// peer tasks.
pub trait ChainReader: Send + Sync {
    fn header_by_hash(&self, hash: &Hash) -> Option<HexHeader>;

    /// First header recorded at `number`. A mesh can hold several blocks
    /// per height; use hash lookups when identity matters.
    fn header_by_number(&self, number: u64) -> Option<HexHeader>;

    fn block_by_hash(&self, hash: &Hash) -> Option<HexBlock>;

    /// True when the full block (not just the header) is stored.
    fn has_block(&self, hash: &Hash) -> bool;

    fn has_block_and_state(&self, hash: &Hash, number: u64) -> bool;

    /// Post-execution state of the block with `hash`.
    fn state_of(&self, hash: &Hash) -> Option<Arc<WorldState>>;

    fn config(&self) -> &ChainConfig;

    fn current_header(&self) -> HexHeader;

    fn genesis_hash(&self) -> Hash;

    /// Up to `limit` known header hashes, most recent first.
    fn recent_hashes(&self, _limit: usize) -> Vec<Hash> {
        Vec::new()
    }
}

/// Write access used by a node to import validated data.
///
/// Execution is out of scope: imported blocks carry the state the caller
/// computed for them.
pub trait ChainWriter: Send + Sync {
    fn import_header(&self, header: HexHeader) -> Hash;

    fn import_block(&self, block: HexBlock, state: WorldState) -> Hash;
}

#[derive(Default)]
struct Inner {
    headers: HashMap<Hash, HexHeader>,
    blocks: HashMap<Hash, HexBlock>,
    states: HashMap<Hash, Arc<WorldState>>,
    by_number: BTreeMap<u64, Vec<Hash>>,
    order: Vec<Hash>,
}

/// Thread-safe in-memory ledger.
pub struct MemoryChain {
    config: ChainConfig,
    genesis: Hash,
    inner: RwLock<Inner>,
    head: RwLock<HexHeader>,
}

impl MemoryChain {
    /// Create a ledger holding only `genesis` and its state.
    pub fn new(config: ChainConfig, genesis: HexBlock, genesis_state: WorldState) -> Self {
        let genesis_hash = genesis.hash();
        let head = genesis.header().clone();
        let chain = Self {
            config,
            genesis: genesis_hash,
            inner: RwLock::new(Inner::default()),
            head: RwLock::new(head),
        };
        chain.insert_block(genesis);
        chain.insert_state(genesis_hash, genesis_state);
        chain
    }

    /// Record a header. The head advances when the header is higher.
    pub fn insert_header(&self, header: HexHeader) -> Hash {
        let hash = header.hash();
        let number = header.number;
        {
            let mut inner = self.inner.write();
            if inner.headers.contains_key(&hash) {
                return hash;
            }
            inner.by_number.entry(number).or_default().push(hash);
            inner.order.push(hash);
            inner.headers.insert(hash, header.clone());
        }
        let mut head = self.head.write();
        if number > head.number {
            *head = header;
        }
        debug!(%hash, number, "header stored");
        hash
    }

    /// Record a full block and its header.
    pub fn insert_block(&self, block: HexBlock) -> Hash {
        let hash = self.insert_header(block.header().clone());
        self.inner.write().blocks.insert(hash, block);
        hash
    }

    pub fn insert_state(&self, hash: Hash, state: WorldState) {
        self.inner.write().states.insert(hash, Arc::new(state));
    }

    /// Move the head to a stored header. Returns false if unknown.
    pub fn set_head(&self, hash: &Hash) -> bool {
        let Some(header) = self.inner.read().headers.get(hash).cloned() else {
            return false;
        };
        *self.head.write() = header;
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChainReader for MemoryChain {
    fn header_by_hash(&self, hash: &Hash) -> Option<HexHeader> {
        self.inner.read().headers.get(hash).cloned()
    }

    fn header_by_number(&self, number: u64) -> Option<HexHeader> {
        let inner = self.inner.read();
        let hash = inner.by_number.get(&number)?.first()?;
        inner.headers.get(hash).cloned()
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<HexBlock> {
        self.inner.read().blocks.get(hash).cloned()
    }

    fn has_block(&self, hash: &Hash) -> bool {
        self.inner.read().blocks.contains_key(hash)
    }

    fn has_block_and_state(&self, hash: &Hash, number: u64) -> bool {
        let inner = self.inner.read();
        inner
            .blocks
            .get(hash)
            .is_some_and(|b| b.number() == number)
            && inner.states.contains_key(hash)
    }

    fn state_of(&self, hash: &Hash) -> Option<Arc<WorldState>> {
        self.inner.read().states.get(hash).cloned()
    }

    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn current_header(&self) -> HexHeader {
        self.head.read().clone()
    }

    fn genesis_hash(&self) -> Hash {
        self.genesis
    }

    fn recent_hashes(&self, limit: usize) -> Vec<Hash> {
        self.inner.read().order.iter().rev().take(limit).copied().collect()
    }
}

impl ChainWriter for MemoryChain {
    fn import_header(&self, header: HexHeader) -> Hash {
        self.insert_header(header)
    }

    fn import_block(&self, block: HexBlock, state: WorldState) -> Hash {
        let hash = self.insert_block(block);
        self.insert_state(hash, state);
        hash
    }
}
