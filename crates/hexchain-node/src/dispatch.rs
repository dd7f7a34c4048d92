//! Validation dispatcher.
//!
//! Drains the protocol's inbound queues, validates what arrives and stores
//! what passes. Headers are verified in parallel batches; blocks one at a
//! time, since full validation needs the merged state of their parents.
//!
//! Items that fail only because something they build on is missing are
//! parked in an orphan pool keyed by that hash and retried once it is
//! imported. The missing item is requested from the peer that sent the
//! orphan.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hexchain_consensus::{BatchVerdict, BlockValidator, CancelSignal, ValidationError};
use hexchain_core::{ChainReader, ChainWriter, Hash, HexBlock, HexHeader};
use hexchain_protocols::{Inbound, InboundQueues, MeshProtocol, PeerEvent, PeerId, PeerState};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Headers taken from the queue per verification batch.
const HEADER_BATCH: usize = 256;

/// Orphans held per kind before new ones are dropped.
const ORPHAN_CAPACITY: usize = 512;

const FETCH_QUEUE: usize = 64;

/// Tally of one dispatch step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub imported: Vec<Hash>,
    pub rejected: usize,
    /// Parked until a missing parent or parent state arrives.
    pub deferred: usize,
    /// Already known locally.
    pub skipped: usize,
    pub cancelled: usize,
}

impl DispatchReport {
    fn absorb(&mut self, other: DispatchReport) {
        self.imported.extend(other.imported);
        self.rejected += other.rejected;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
        self.cancelled += other.cancelled;
    }
}

/// Items waiting on a hash they reference.
struct OrphanPool<T> {
    waiting: HashMap<Hash, Vec<Inbound<T>>>,
    len: usize,
    capacity: usize,
}

impl<T> OrphanPool<T> {
    fn new(capacity: usize) -> Self {
        Self {
            waiting: HashMap::new(),
            len: 0,
            capacity,
        }
    }

    /// Park `item` until `missing` is imported. Returns `None` when the pool
    /// is full, otherwise whether `missing` was not already awaited.
    fn park(&mut self, missing: Hash, item: Inbound<T>) -> Option<bool> {
        if self.len >= self.capacity {
            return None;
        }
        self.len += 1;
        let waiters = self.waiting.entry(missing).or_default();
        waiters.push(item);
        Some(waiters.len() == 1)
    }

    fn release(&mut self, imported: &Hash) -> Vec<Inbound<T>> {
        let released = self.waiting.remove(imported).unwrap_or_default();
        self.len -= released.len();
        released
    }

    fn len(&self) -> usize {
        self.len
    }
}

pub(crate) struct Dispatcher {
    chain: Arc<dyn ChainReader>,
    writer: Arc<dyn ChainWriter>,
    validator: Arc<BlockValidator>,
    protocol: Arc<MeshProtocol>,
    /// Subscribed at construction so no connection made before `run` is missed.
    events: broadcast::Receiver<PeerEvent>,
    workers: usize,
    cancel: CancelSignal,
    header_orphans: OrphanPool<HexHeader>,
    block_orphans: OrphanPool<HexBlock>,
    fetched_headers: (mpsc::Sender<Inbound<HexHeader>>, mpsc::Receiver<Inbound<HexHeader>>),
    fetched_blocks: (mpsc::Sender<Inbound<HexBlock>>, mpsc::Receiver<Inbound<HexBlock>>),
}

impl Dispatcher {
    pub(crate) fn new(
        chain: Arc<dyn ChainReader>,
        writer: Arc<dyn ChainWriter>,
        validator: Arc<BlockValidator>,
        protocol: Arc<MeshProtocol>,
        workers: usize,
    ) -> Self {
        Self {
            events: protocol.subscribe_events(),
            chain,
            writer,
            validator,
            protocol,
            workers: workers.max(1),
            cancel: CancelSignal::new(),
            header_orphans: OrphanPool::new(ORPHAN_CAPACITY),
            block_orphans: OrphanPool::new(ORPHAN_CAPACITY),
            fetched_headers: mpsc::channel(FETCH_QUEUE),
            fetched_blocks: mpsc::channel(FETCH_QUEUE),
        }
    }

    /// Cancels any in-flight header batch; later batches come back
    /// cancelled too.
    pub(crate) fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub(crate) async fn run(mut self, mut queues: InboundQueues, mut stop: watch::Receiver<bool>) {
        info!("Validation dispatcher started ({} workers)", self.workers);

        loop {
            tokio::select! {
                Some(first) = queues.headers.recv() => {
                    let mut batch = vec![first];
                    while batch.len() < HEADER_BATCH {
                        match queues.headers.try_recv() {
                            Ok(next) => batch.push(next),
                            Err(_) => break,
                        }
                    }
                    self.handle_headers(batch).await;
                }
                Some(fetched) = self.fetched_headers.1.recv() => {
                    self.handle_headers(vec![fetched]).await;
                }
                Some(block) = queues.blocks.recv() => {
                    self.handle_block(block).await;
                }
                Some(fetched) = self.fetched_blocks.1.recv() => {
                    self.handle_block(fetched).await;
                }
                Some(proof) = queues.proofs.recv() => {
                    self.handle_proof(proof.from, proof.item.block);
                }
                event = self.events.recv() => match event {
                    Ok(PeerEvent { peer, state: PeerState::Active }) => {
                        if let Err(e) = self.protocol.send_mesh_state(peer).await {
                            debug!("Could not send mesh state to {}: {}", peer, e);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dispatcher missed {} peer events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = stop.changed() => break,
            }
        }
        info!("Validation dispatcher stopped");
    }

    /// Verify, import and announce a batch of headers, retrying any that
    /// were waiting on a header imported along the way.
    pub(crate) async fn handle_headers(&mut self, incoming: Vec<Inbound<HexHeader>>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut seen = HashSet::new();
        let mut pending: Vec<Inbound<HexHeader>> = incoming
            .into_iter()
            .filter(|inbound| {
                let hash = inbound.item.hash();
                let fresh = seen.insert(hash) && self.chain.header_by_hash(&hash).is_none();
                if !fresh {
                    report.skipped += 1;
                }
                fresh
            })
            .collect();

        while !pending.is_empty() {
            let headers: Vec<HexHeader> = pending.iter().map(|i| i.item.clone()).collect();
            let engine = Arc::clone(self.validator.engine());
            let workers = self.workers;
            let cancel = self.cancel.clone();
            let verdicts = match tokio::task::spawn_blocking(move || {
                engine.verify_headers(&headers, workers, &cancel)
            })
            .await
            {
                Ok(verdicts) => verdicts,
                Err(e) => {
                    error!("Header verification task failed: {}", e);
                    report.cancelled += pending.len();
                    break;
                }
            };

            let mut released = Vec::new();
            for (inbound, verdict) in pending.into_iter().zip(verdicts) {
                let hash = inbound.item.hash();
                match verdict {
                    BatchVerdict::Accepted => {
                        self.writer.import_header(inbound.item.clone());
                        self.protocol.broadcast_header(&inbound.item).await;
                        debug!(%hash, number = inbound.item.number, "Imported header");
                        report.imported.push(hash);
                        released.extend(self.header_orphans.release(&hash));
                    }
                    BatchVerdict::Rejected(e) if e.is_retryable() => {
                        if self.defer_header(inbound, &e) {
                            report.deferred += 1;
                        } else {
                            report.rejected += 1;
                        }
                    }
                    BatchVerdict::Rejected(e) => {
                        self.reject(inbound.from, "header", hash, &e).await;
                        report.rejected += 1;
                    }
                    BatchVerdict::Cancelled => report.cancelled += 1,
                }
            }
            pending = released;
        }

        self.protocol.set_head(self.chain.current_header().hash());
        if !report.imported.is_empty() {
            info!(
                "Imported {} headers ({} rejected, {} deferred)",
                report.imported.len(),
                report.rejected,
                report.deferred
            );
        }
        report
    }

    /// Validate, store and flood one block, then retry blocks that were
    /// waiting on it.
    pub(crate) async fn handle_block(&mut self, inbound: Inbound<HexBlock>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut queue = vec![inbound];

        while let Some(inbound) = queue.pop() {
            let hash = inbound.item.hash();
            let validator = Arc::clone(&self.validator);
            let block = inbound.item.clone();
            let verdict = tokio::task::spawn_blocking(move || validator.validate_block(&block)).await;

            match verdict {
                Ok(Ok(outcome)) => {
                    if !outcome.conflicts.is_empty() {
                        info!(%hash, conflicts = outcome.conflicts.len(), "Merged conflicting parent states");
                    }
                    self.writer.import_block(inbound.item.clone(), outcome.state);
                    self.protocol.broadcast_block(&inbound.item).await;
                    self.protocol
                        .broadcast_proof(hash, &inbound.item.header().proof)
                        .await;
                    debug!(%hash, number = inbound.item.number(), "Imported block");
                    report.imported.push(hash);

                    queue.extend(self.block_orphans.release(&hash));
                    let waiting_headers = self.header_orphans.release(&hash);
                    if !waiting_headers.is_empty() {
                        report.absorb(self.handle_headers(waiting_headers).await);
                    }
                }
                Ok(Err(ValidationError::KnownBlock(_))) => report.skipped += 1,
                Ok(Err(e)) if e.is_retryable() => {
                    if self.defer_block(inbound, &e) {
                        report.deferred += 1;
                    } else {
                        report.rejected += 1;
                    }
                }
                Ok(Err(e)) => {
                    self.reject(inbound.from, "block", hash, &e).await;
                    report.rejected += 1;
                }
                Err(e) => {
                    error!("Block validation task failed: {}", e);
                    report.cancelled += 1;
                }
            }
        }

        self.protocol.set_head(self.chain.current_header().hash());
        report
    }

    /// Fetch the header of an announced proof's block when it is unknown.
    fn handle_proof(&self, from: PeerId, block: Hash) {
        if self.chain.header_by_hash(&block).is_some() {
            trace!(%block, "Proof for known header");
            return;
        }
        debug!(%block, peer = %from, "Proof for unknown header, fetching");
        self.fetch_header(from, block);
    }

    fn defer_header(&mut self, inbound: Inbound<HexHeader>, e: &ValidationError) -> bool {
        let Some(missing) = e.waiting_on() else {
            warn!(
                peer = %inbound.from,
                hash = %inbound.item.hash(),
                category = %e.category(),
                "Dropped header with nothing to wait for: {}",
                e
            );
            return false;
        };
        let from = inbound.from;
        match self.header_orphans.park(missing, inbound) {
            Some(first) => {
                debug!(%missing, peer = %from, "Header deferred: {}", e);
                if first {
                    self.fetch_header(from, missing);
                }
                true
            }
            None => {
                warn!(
                    "Orphan header pool full ({}), dropping header from {}",
                    self.header_orphans.len(),
                    from
                );
                false
            }
        }
    }

    fn defer_block(&mut self, inbound: Inbound<HexBlock>, e: &ValidationError) -> bool {
        let Some(missing) = e.waiting_on() else {
            warn!(
                peer = %inbound.from,
                hash = %inbound.item.hash(),
                category = %e.category(),
                "Dropped block with nothing to wait for: {}",
                e
            );
            return false;
        };
        let from = inbound.from;
        match self.block_orphans.park(missing, inbound) {
            Some(first) => {
                debug!(%missing, peer = %from, "Block deferred: {}", e);
                if first {
                    self.fetch_block(from, missing);
                }
                true
            }
            None => {
                warn!(
                    "Orphan block pool full ({}), dropping block from {}",
                    self.block_orphans.len(),
                    from
                );
                false
            }
        }
    }

    fn fetch_header(&self, from: PeerId, hash: Hash) {
        let protocol = Arc::clone(&self.protocol);
        let sink = self.fetched_headers.0.clone();
        tokio::spawn(async move {
            match protocol.request_header(from, hash).await {
                Ok(Some(header)) => {
                    let _ = sink.send(Inbound { from, item: header }).await;
                }
                Ok(None) => debug!(%hash, peer = %from, "Peer does not have requested header"),
                Err(e) => debug!(%hash, peer = %from, "Header fetch failed: {}", e),
            }
        });
    }

    fn fetch_block(&self, from: PeerId, hash: Hash) {
        let protocol = Arc::clone(&self.protocol);
        let sink = self.fetched_blocks.0.clone();
        tokio::spawn(async move {
            match protocol.request_block(from, hash).await {
                Ok(Some(block)) => {
                    let _ = sink.send(Inbound { from, item: block }).await;
                }
                Ok(None) => debug!(%hash, peer = %from, "Peer does not have requested block"),
                Err(e) => debug!(%hash, peer = %from, "Block fetch failed: {}", e),
            }
        });
    }

    async fn reject(&self, from: PeerId, kind: &str, hash: Hash, e: &ValidationError) {
        warn!(
            peer = %from,
            %hash,
            category = %e.category(),
            "Rejected {}: {}",
            kind,
            e
        );
        if e.implicates_sender() {
            self.protocol.disconnect(from, "sent invalid proof").await;
        }
    }
}
