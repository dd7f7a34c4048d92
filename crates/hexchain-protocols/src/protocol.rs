//! The mesh network protocol.
//!
//! # Ownership
//!
//! [`MeshProtocol`] is the only owner of the peer table. Peer tasks hold an
//! `Arc` of the protocol and mutate peers through its methods; nothing else
//! holds a reference into the table. Writes to a peer go through that
//! peer's bounded outbound queue, drained by a dedicated writer task, so the
//! table lock is never held across socket I/O.
//!
//! # Tasks
//!
//! ```text
//!   per peer:   reader ──> handle_message ──> inbound queues (try_send)
//!               writer <── outbound queue  <── send_to / broadcast_*
//!   background: heartbeat (NeighborUpdate to all), sweep (expire requests)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hexchain_core::{ChainReader, Hash, HexBlock, HexCoordinate, HexHeader, HexaProof};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::ProtocolConfig;
use crate::error::{NetworkError, RequestError, Result};
use crate::message::{
    read_frame, write_frame, BlockResponse, HeaderResponse, MeshMessage, MeshStateSummary,
    NeighborUpdate, ProofAnnouncement, Request, Status,
};
use crate::peer::{PeerEvent, PeerId, PeerLifecycle, PeerRecord, PeerState};
use crate::request::{RequestTable, Response};
use crate::stats::{ProtocolStats, StatsSnapshot};

/// Hashes advertised per mesh-state summary.
const MESH_STATE_LIMIT: usize = 1024;

const EVENT_CAPACITY: usize = 256;

/// An item received from a peer, awaiting validation.
#[derive(Debug, Clone)]
pub struct Inbound<T> {
    pub from: PeerId,
    pub item: T,
}

/// Receiving ends of the bounded queues feeding the validator.
pub struct InboundQueues {
    pub blocks: mpsc::Receiver<Inbound<HexBlock>>,
    pub headers: mpsc::Receiver<Inbound<HexHeader>>,
    pub proofs: mpsc::Receiver<Inbound<ProofAnnouncement>>,
}

struct PeerEntry {
    record: PeerRecord,
    /// Refreshed on every inbound message under the table's read lock.
    last_seen: parking_lot::Mutex<std::time::Instant>,
    outbound: mpsc::Sender<MeshMessage>,
    requests: Arc<RequestTable>,
    /// Set to stop the peer's reader and writer.
    kick: watch::Sender<bool>,
}

impl PeerEntry {
    fn snapshot(&self) -> PeerRecord {
        let mut record = self.record.clone();
        record.last_seen = *self.last_seen.lock();
        record
    }
}

struct LocalView {
    position: HexCoordinate,
    head: Hash,
}

pub struct MeshProtocol {
    config: ProtocolConfig,
    chain: Arc<dyn ChainReader>,
    genesis: Hash,
    local: parking_lot::RwLock<LocalView>,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    next_peer: AtomicU64,
    blocks_tx: mpsc::Sender<Inbound<HexBlock>>,
    headers_tx: mpsc::Sender<Inbound<HexHeader>>,
    proofs_tx: mpsc::Sender<Inbound<ProofAnnouncement>>,
    events: broadcast::Sender<PeerEvent>,
    shutdown: watch::Sender<bool>,
    stats: ProtocolStats,
}

impl MeshProtocol {
    /// Create a protocol instance at `position`, advertising the ledger's
    /// current head and genesis.
    pub fn new(
        config: ProtocolConfig,
        chain: Arc<dyn ChainReader>,
        position: HexCoordinate,
    ) -> (Arc<Self>, InboundQueues) {
        let (blocks_tx, blocks) = mpsc::channel(config.block_queue_capacity.max(1));
        let (headers_tx, headers) = mpsc::channel(config.header_queue_capacity.max(1));
        let (proofs_tx, proofs) = mpsc::channel(config.proof_queue_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let protocol = Arc::new(Self {
            genesis: chain.genesis_hash(),
            local: parking_lot::RwLock::new(LocalView {
                position,
                head: chain.current_header().hash(),
            }),
            config,
            chain,
            peers: RwLock::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            blocks_tx,
            headers_tx,
            proofs_tx,
            events,
            shutdown,
            stats: ProtocolStats::default(),
        });
        (protocol, InboundQueues { blocks, headers, proofs })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn genesis(&self) -> Hash {
        self.genesis
    }

    pub fn local_position(&self) -> HexCoordinate {
        self.local.read().position
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Lifecycle transitions of every peer, including ones that never
    /// become active.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn publish(&self, peer: PeerId, state: PeerState) {
        // No subscribers is fine.
        let _ = self.events.send(PeerEvent { peer, state });
    }

    fn local_status(&self) -> Status {
        let local = self.local.read();
        Status {
            protocol_version: self.config.protocol_version,
            network_id: self.config.network_id,
            head: local.head,
            genesis: self.genesis,
            position: local.position,
        }
    }

    // ---- Connections ----

    /// Accept connections until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Mesh P2P listening on {}", listener.local_addr()?);
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("Incoming mesh connection from {}", addr);
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = this.connect(stream).await {
                                warn!("Connection from {} refused: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        Ok(())
    }

    /// Dial a peer over TCP and run the handshake.
    pub async fn dial(self: &Arc<Self>, addr: impl ToSocketAddrs) -> Result<PeerId> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        self.connect(stream).await
    }

    /// Run the handshake over `stream` and, on success, register the peer
    /// and spawn its reader and writer tasks.
    pub async fn connect<S>(self: &Arc<Self>, stream: S) -> Result<PeerId>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if *self.shutdown.borrow() {
            return Err(NetworkError::ShuttingDown);
        }
        let id = PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed));
        let mut lifecycle = PeerLifecycle::new();
        self.publish(id, PeerState::Connecting);

        let (mut reader, mut writer) = tokio::io::split(stream);
        let remote = match self.handshake(id, &mut lifecycle, &mut reader, &mut writer).await {
            Ok(status) => status,
            Err(e) => {
                ProtocolStats::bump(&self.stats.handshake_failures, 1);
                lifecycle.advance(PeerState::Disconnected)?;
                self.publish(id, PeerState::Disconnected);
                warn!("Handshake with {} failed: {}", id, e);
                return Err(e);
            }
        };
        lifecycle.advance(PeerState::Active)?;

        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_queue_capacity.max(1));
        let (kick, kick_rx) = watch::channel(false);
        let record = PeerRecord::new(id, remote.position, remote.head, self.local_position());
        info!(
            "Peer {} active at {} (distance {})",
            id, record.position, record.distance
        );
        let entry = PeerEntry {
            last_seen: parking_lot::Mutex::new(record.last_seen),
            record,
            outbound,
            requests: Arc::new(RequestTable::new(self.config.max_concurrent_requests)),
            kick,
        };
        self.peers.write().await.insert(id, entry);
        self.publish(id, PeerState::Active);

        tokio::spawn(Arc::clone(self).run_writer(id, writer, outbound_rx, kick_rx.clone()));
        tokio::spawn(Arc::clone(self).run_reader(id, reader, kick_rx));

        // Shutdown may have drained the table before this peer was added.
        if *self.shutdown.borrow() {
            self.disconnect(id, "shutting down").await;
            return Err(NetworkError::ShuttingDown);
        }
        Ok(id)
    }

    async fn handshake<R, W>(
        &self,
        id: PeerId,
        lifecycle: &mut PeerLifecycle,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<Status>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        lifecycle.advance(PeerState::Handshaking)?;
        self.publish(id, PeerState::Handshaking);

        let ours = self.local_status();
        let max = self.config.max_frame_len;
        let exchange = async {
            write_frame(writer, &MeshMessage::Status(ours.clone()), max).await?;
            read_frame(reader, max).await
        };
        let limit = self.config.handshake_timeout;
        let msg = tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| NetworkError::HandshakeTimeout(limit))??;

        let theirs = match msg {
            MeshMessage::Status(status) => status,
            other => {
                return Err(NetworkError::UnexpectedMessage {
                    expected: "status",
                    got: other.name(),
                })
            }
        };
        check_status(&ours, &theirs)?;
        debug!("Status from {}: {:?}", id, theirs);
        Ok(theirs)
    }

    async fn run_writer<W>(
        self: Arc<Self>,
        peer: PeerId,
        mut writer: W,
        mut queue: mpsc::Receiver<MeshMessage>,
        mut kick: watch::Receiver<bool>,
    ) where
        W: AsyncWrite + Unpin,
    {
        let max = self.config.max_frame_len;
        loop {
            tokio::select! {
                msg = queue.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = write_frame(&mut writer, &msg, max).await {
                        warn!("Write to {} failed: {}", peer, e);
                        self.disconnect(peer, "write failed").await;
                        break;
                    }
                }
                _ = kick.changed() => break,
            }
        }
        let _ = writer.shutdown().await;
        trace!("Writer for {} stopped", peer);
    }

    async fn run_reader<R>(self: Arc<Self>, peer: PeerId, mut reader: R, mut kick: watch::Receiver<bool>)
    where
        R: AsyncRead + Unpin,
    {
        let mut shutdown = self.shutdown.subscribe();
        let max = self.config.max_frame_len;
        let reason = loop {
            tokio::select! {
                _ = kick.changed() => break "closed locally".to_string(),
                _ = shutdown.changed() => break "shutting down".to_string(),
                frame = read_frame(&mut reader, max) => match frame {
                    Ok(msg) => self.handle_message(peer, msg).await,
                    Err(NetworkError::ConnectionClosed) => break "closed by remote".to_string(),
                    Err(e) => {
                        if e.is_decode_failure() {
                            ProtocolStats::bump(&self.stats.decode_failures, 1);
                        }
                        break e.to_string();
                    }
                },
            }
        };
        self.disconnect(peer, &reason).await;
    }

    /// Remove a peer, fail its pending requests and stop its tasks. False if
    /// the peer was already gone.
    pub async fn disconnect(&self, peer: PeerId, reason: &str) -> bool {
        let entry = self.peers.write().await.remove(&peer);
        match entry {
            Some(entry) => {
                self.retire(entry, reason);
                true
            }
            None => false,
        }
    }

    fn retire(&self, entry: PeerEntry, reason: &str) {
        let failed = entry.requests.close();
        let _ = entry.kick.send(true);
        ProtocolStats::bump(&self.stats.peers_disconnected, 1);
        self.publish(entry.record.id, PeerState::Disconnected);
        info!(
            "Peer {} disconnected ({}), {} pending requests failed",
            entry.record.id, reason, failed
        );
    }

    // ---- Inbound ----

    async fn handle_message(self: &Arc<Self>, peer: PeerId, msg: MeshMessage) {
        trace!(peer = %peer, kind = msg.name(), "Received message");
        self.touch(peer, None).await;

        match msg {
            MeshMessage::Status(_) => debug!("Ignoring repeated status from {}", peer),
            MeshMessage::NeighborUpdate(update) => self.touch(peer, Some(update)).await,
            MeshMessage::Block(block) => self.enqueue(
                &self.blocks_tx,
                Inbound { from: peer, item: block },
                &self.stats.blocks_dropped,
                "block",
            ),
            MeshMessage::Header(header) => self.enqueue(
                &self.headers_tx,
                Inbound { from: peer, item: header },
                &self.stats.headers_dropped,
                "header",
            ),
            MeshMessage::Proof(proof) => self.enqueue(
                &self.proofs_tx,
                Inbound { from: peer, item: proof },
                &self.stats.proofs_dropped,
                "proof",
            ),
            MeshMessage::BlockRequest(req) => {
                let block = self.chain.block_by_hash(&req.hash);
                let reply = MeshMessage::BlockResponse(BlockResponse { id: req.id, block });
                if let Err(e) = self.send_to(peer, reply).await {
                    debug!("Could not answer block request from {}: {}", peer, e);
                }
            }
            MeshMessage::HeaderRequest(req) => {
                let header = self.chain.header_by_hash(&req.hash);
                let reply = MeshMessage::HeaderResponse(HeaderResponse { id: req.id, header });
                if let Err(e) = self.send_to(peer, reply).await {
                    debug!("Could not answer header request from {}: {}", peer, e);
                }
            }
            MeshMessage::BlockResponse(resp) => {
                self.complete(peer, resp.id, Response::Block(resp.block)).await
            }
            MeshMessage::HeaderResponse(resp) => {
                self.complete(peer, resp.id, Response::Header(resp.header)).await
            }
            MeshMessage::MeshState(summary) => self.reconcile(peer, summary),
        }
    }

    /// Refresh `last_seen`, and the position and head when an update is given.
    async fn touch(&self, peer: PeerId, update: Option<NeighborUpdate>) {
        let Some(update) = update else {
            if let Some(entry) = self.peers.read().await.get(&peer) {
                *entry.last_seen.lock() = std::time::Instant::now();
            }
            return;
        };

        let local = self.local_position();
        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(&peer) else {
            return;
        };
        *entry.last_seen.get_mut() = std::time::Instant::now();
        entry.record.update(update.position, update.head, local);
        debug!(
            "Peer {} moved to {} (distance {})",
            peer, update.position, entry.record.distance
        );
    }

    fn enqueue<T>(&self, queue: &mpsc::Sender<Inbound<T>>, item: Inbound<T>, dropped: &AtomicU64, kind: &str) {
        let from = item.from;
        match queue.try_send(item) {
            Ok(()) => trace!("Queued {} from {}", kind, from),
            Err(TrySendError::Full(_)) => {
                ProtocolStats::bump(dropped, 1);
                warn!("Inbound {} queue full, dropped {} from {}", kind, kind, from);
            }
            Err(TrySendError::Closed(_)) => {
                ProtocolStats::bump(dropped, 1);
                debug!("Inbound {} queue closed, dropped {} from {}", kind, kind, from);
            }
        }
    }

    async fn complete(&self, peer: PeerId, id: u64, response: Response) {
        let requests = self.peers.read().await.get(&peer).map(|e| Arc::clone(&e.requests));
        let resolved = requests.is_some_and(|table| table.resolve(id, response));
        if !resolved {
            debug!("Ignoring unsolicited response {} from {}", id, peer);
        }
    }

    /// Fetch what a peer advertises and the local ledger lacks.
    fn reconcile(self: &Arc<Self>, peer: PeerId, summary: MeshStateSummary) {
        let limit = self.config.max_concurrent_requests;
        let blocks: Vec<Hash> = summary
            .known_blocks
            .iter()
            .filter(|h| !self.chain.has_block(h))
            .take(limit)
            .copied()
            .collect();
        let headers: Vec<Hash> = summary
            .known_headers
            .iter()
            .filter(|h| !summary.known_blocks.contains(h) && self.chain.header_by_hash(h).is_none())
            .take(limit - blocks.len())
            .copied()
            .collect();
        if blocks.is_empty() && headers.is_empty() {
            trace!("Mesh state from {} holds nothing new", peer);
            return;
        }

        debug!(
            "Fetching {} blocks and {} headers advertised by {}",
            blocks.len(),
            headers.len(),
            peer
        );
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut fetches = JoinSet::new();
            for hash in blocks {
                let this = Arc::clone(&this);
                fetches.spawn(async move { this.fetch_block(peer, hash).await });
            }
            for hash in headers {
                let this = Arc::clone(&this);
                fetches.spawn(async move { this.fetch_header(peer, hash).await });
            }
            while fetches.join_next().await.is_some() {}
        });
    }

    async fn fetch_block(&self, peer: PeerId, hash: Hash) {
        match self.request_block(peer, hash).await {
            Ok(Some(block)) => self.enqueue(
                &self.blocks_tx,
                Inbound { from: peer, item: block },
                &self.stats.blocks_dropped,
                "block",
            ),
            Ok(None) => debug!("{} no longer has block {}", peer, hash),
            Err(e) => debug!("Fetching block {} from {} failed: {}", hash, peer, e),
        }
    }

    async fn fetch_header(&self, peer: PeerId, hash: Hash) {
        match self.request_header(peer, hash).await {
            Ok(Some(header)) => self.enqueue(
                &self.headers_tx,
                Inbound { from: peer, item: header },
                &self.stats.headers_dropped,
                "header",
            ),
            Ok(None) => debug!("{} no longer has header {}", peer, hash),
            Err(e) => debug!("Fetching header {} from {} failed: {}", hash, peer, e),
        }
    }

    // ---- Outbound ----

    /// Queue `msg` for one peer without waiting for the socket.
    pub async fn send_to(&self, peer: PeerId, msg: MeshMessage) -> Result<()> {
        let outbound = self
            .peers
            .read()
            .await
            .get(&peer)
            .map(|e| e.outbound.clone())
            .ok_or(NetworkError::UnknownPeer(peer))?;
        self.push(peer, &outbound, msg)
    }

    fn push(&self, peer: PeerId, outbound: &mpsc::Sender<MeshMessage>, msg: MeshMessage) -> Result<()> {
        match outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                ProtocolStats::bump(&self.stats.outbound_dropped, 1);
                warn!("Outbound queue to {} full, dropped {}", peer, msg.name());
                Err(NetworkError::OutboundFull(peer))
            }
            Err(TrySendError::Closed(_)) => Err(NetworkError::UnknownPeer(peer)),
        }
    }

    async fn broadcast_where<F>(&self, msg: MeshMessage, filter: F) -> usize
    where
        F: Fn(&PeerRecord) -> bool,
    {
        let targets: Vec<(PeerId, mpsc::Sender<MeshMessage>)> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|e| e.record.state == PeerState::Active && filter(&e.record))
                .map(|e| (e.record.id, e.outbound.clone()))
                .collect()
        };
        let kind = msg.name();
        let mut sent = 0;
        for (peer, outbound) in targets {
            if self.push(peer, &outbound, msg.clone()).is_ok() {
                sent += 1;
            }
        }
        trace!("Broadcast {} to {} peers", kind, sent);
        sent
    }

    /// Push a block to every peer within the flood radius, which includes
    /// all direct neighbors.
    pub async fn broadcast_block(&self, block: &HexBlock) -> usize {
        let radius = self.config.flood_radius;
        self.broadcast_where(MeshMessage::Block(block.clone()), |p| p.distance <= radius)
            .await
    }

    /// Announce a header to every active peer.
    pub async fn broadcast_header(&self, header: &HexHeader) -> usize {
        self.broadcast_where(MeshMessage::Header(header.clone()), |_| true)
            .await
    }

    /// Send a proof to direct neighbors only.
    pub async fn broadcast_proof(&self, block: Hash, proof: &HexaProof) -> usize {
        let announcement = ProofAnnouncement {
            block,
            proof: proof.clone(),
        };
        self.broadcast_where(MeshMessage::Proof(announcement), |p| p.is_direct_neighbor)
            .await
    }

    /// Advertise recently known hashes to `peer`.
    pub async fn send_mesh_state(&self, peer: PeerId) -> Result<()> {
        let recent = self.chain.recent_hashes(MESH_STATE_LIMIT);
        let summary = MeshStateSummary {
            known_blocks: recent.iter().filter(|h| self.chain.has_block(h)).copied().collect(),
            known_headers: recent.into_iter().collect(),
        };
        self.send_to(peer, MeshMessage::MeshState(summary)).await
    }

    // ---- Requests ----

    pub async fn request_block(&self, peer: PeerId, hash: Hash) -> Result<Option<HexBlock>> {
        match self.request(peer, hash, MeshMessage::BlockRequest).await? {
            Response::Block(block) => Ok(block),
            Response::Header(_) => Err(RequestError::UnexpectedResponse.into()),
        }
    }

    pub async fn request_header(&self, peer: PeerId, hash: Hash) -> Result<Option<HexHeader>> {
        match self.request(peer, hash, MeshMessage::HeaderRequest).await? {
            Response::Header(header) => Ok(header),
            Response::Block(_) => Err(RequestError::UnexpectedResponse.into()),
        }
    }

    async fn request(
        &self,
        peer: PeerId,
        hash: Hash,
        wrap: fn(Request) -> MeshMessage,
    ) -> Result<Response> {
        let (requests, outbound) = {
            let peers = self.peers.read().await;
            let entry = peers.get(&peer).ok_or(NetworkError::UnknownPeer(peer))?;
            (Arc::clone(&entry.requests), entry.outbound.clone())
        };

        let deadline = Instant::now() + self.config.request_timeout;
        let (id, response) = requests.register(deadline)?;
        if let Err(e) = self.push(peer, &outbound, wrap(Request { id, hash })) {
            requests.cancel(id);
            return Err(e);
        }
        trace!("Request {} for {} sent to {}", id, hash, peer);

        match response.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RequestError::PeerDisconnected.into()),
        }
    }

    /// Requests to `peer` still awaiting a response.
    pub async fn pending_requests(&self, peer: PeerId) -> usize {
        self.peers
            .read()
            .await
            .get(&peer)
            .map_or(0, |e| e.requests.len())
    }

    // ---- Local view ----

    /// Move the local node and recompute every peer's distance.
    pub async fn set_local_position(&self, position: HexCoordinate) {
        self.local.write().position = position;
        let mut peers = self.peers.write().await;
        for entry in peers.values_mut() {
            entry.record.relocate(position);
        }
        info!("Local position set to {}", position);
    }

    pub fn set_head(&self, head: Hash) {
        self.local.write().head = head;
    }

    pub async fn peer(&self, id: PeerId) -> Option<PeerRecord> {
        self.peers.read().await.get(&id).map(PeerEntry::snapshot)
    }

    /// Snapshot of all peers, ordered by id.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> =
            self.peers.read().await.values().map(PeerEntry::snapshot).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Peers at distance 1.
    pub async fn neighbors(&self) -> Vec<PeerRecord> {
        let mut records = self.peers().await;
        records.retain(|r| r.is_direct_neighbor);
        records
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    // ---- Background tasks ----

    /// Spawn the heartbeat and sweep tasks. Both stop on [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let this = Arc::clone(self);
            let period = self.config.heartbeat_interval;
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                this.every(period, "heartbeat", shutdown, |p| async move {
                    p.heartbeat().await;
                })
                .await
            })
        };
        let sweep = {
            let this = Arc::clone(self);
            let period = self.config.sweep_interval;
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                this.every(period, "sweep", shutdown, |p| async move {
                    p.sweep().await;
                })
                .await
            })
        };
        vec![heartbeat, sweep]
    }

    async fn every<F, Fut>(
        self: Arc<Self>,
        period: Duration,
        name: &str,
        mut shutdown: watch::Receiver<bool>,
        mut tick: F,
    ) where
        F: FnMut(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        // Shut down before this task was started.
        if *shutdown.borrow_and_update() {
            debug!("{} task stopped", name);
            return;
        }
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(Arc::clone(&self)).await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("{} task stopped", name);
    }

    /// Send the local position and head to every peer.
    pub async fn heartbeat(&self) -> usize {
        let update = {
            let local = self.local.read();
            NeighborUpdate {
                position: local.position,
                head: local.head,
            }
        };
        self.broadcast_where(MeshMessage::NeighborUpdate(update), |_| true)
            .await
    }

    /// Fail every request past its deadline. Returns how many expired.
    pub async fn sweep(&self) -> usize {
        let tables: Vec<(PeerId, Arc<RequestTable>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, e)| (*id, Arc::clone(&e.requests)))
            .collect();

        let now = Instant::now();
        let mut expired = 0;
        for (peer, table) in tables {
            let n = table.expire(now);
            if n > 0 {
                warn!("Expired {} stale requests to {}", n, peer);
            }
            expired += n;
        }
        ProtocolStats::bump(&self.stats.requests_expired, expired as u64);
        expired
    }

    /// Stop background tasks and disconnect every peer, failing their
    /// pending requests.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let drained: Vec<PeerEntry> = self
            .peers
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let count = drained.len();
        for entry in drained {
            self.retire(entry, "shutting down");
        }
        info!("Mesh protocol shut down, {} peers disconnected", count);
    }
}

fn check_status(ours: &Status, theirs: &Status) -> Result<()> {
    if theirs.protocol_version != ours.protocol_version {
        return Err(NetworkError::VersionMismatch {
            ours: ours.protocol_version,
            theirs: theirs.protocol_version,
        });
    }
    if theirs.network_id != ours.network_id {
        return Err(NetworkError::NetworkMismatch {
            ours: ours.network_id,
            theirs: theirs.network_id,
        });
    }
    if theirs.genesis != ours.genesis {
        return Err(NetworkError::GenesisMismatch {
            ours: ours.genesis,
            theirs: theirs.genesis,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexchain_core::{HexaProof, MemoryChain, ChainConfig, ValidatorId, WorldState};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::time::sleep;

    const MAX: u32 = 16 * 1024 * 1024;
    const WAIT: Duration = Duration::from_secs(5);

    fn ledger() -> Arc<MemoryChain> {
        let genesis = HexBlock::genesis(1_000, ValidatorId::default());
        Arc::new(MemoryChain::new(ChainConfig::default(), genesis, WorldState::new()))
    }

    fn child_of(parent: Hash, q: i64) -> HexHeader {
        let mut h = HexHeader::genesis(1_001, ValidatorId::default());
        h.number = 1;
        h.position = HexCoordinate::new(q, 0);
        h.parent_hashes[3] = Some(parent);
        h.neighbor_count = 1;
        h
    }

    fn protocol(config: ProtocolConfig) -> (Arc<MeshProtocol>, InboundQueues, Arc<MemoryChain>) {
        let chain = ledger();
        let (p, queues) = MeshProtocol::new(config, chain.clone(), HexCoordinate::ORIGIN);
        (p, queues, chain)
    }

    fn status_at(p: &MeshProtocol, position: HexCoordinate) -> Status {
        Status {
            protocol_version: p.config().protocol_version,
            network_id: p.config().network_id,
            head: p.genesis(),
            genesis: p.genesis(),
            position,
        }
    }

    /// Connect a hand-driven peer that completes the handshake.
    async fn raw_peer(p: &Arc<MeshProtocol>, position: HexCoordinate) -> (PeerId, DuplexStream) {
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        write_frame(&mut theirs, &MeshMessage::Status(status_at(p, position)), MAX)
            .await
            .unwrap();
        let id = p.connect(ours).await.unwrap();
        let greeting = read_frame(&mut theirs, MAX).await.unwrap();
        assert_eq!(greeting.name(), "status");
        (id, theirs)
    }

    async fn wait_for_peers(p: &MeshProtocol, count: usize) {
        tokio::time::timeout(WAIT, async {
            while p.peer_count().await != count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer count never settled");
    }

    fn drain_events(rx: &mut broadcast::Receiver<PeerEvent>) -> Vec<PeerState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            states.push(event.state);
        }
        states
    }

    #[tokio::test]
    async fn handshake_activates_both_sides() {
        let (a, _qa, _) = protocol(ProtocolConfig::default());
        let chain_b = ledger();
        let (b, _qb) = MeshProtocol::new(ProtocolConfig::default(), chain_b, HexCoordinate::new(1, 0));

        let (x, y) = tokio::io::duplex(64 * 1024);
        let (ra, rb) = tokio::join!(a.connect(x), b.connect(y));
        let (ida, idb) = (ra.unwrap(), rb.unwrap());

        let seen_by_a = a.peer(ida).await.unwrap();
        assert_eq!(seen_by_a.position, HexCoordinate::new(1, 0));
        assert!(seen_by_a.is_direct_neighbor);
        assert_eq!(seen_by_a.state, PeerState::Active);
        assert_eq!(b.peer(idb).await.unwrap().position, HexCoordinate::ORIGIN);
        assert_eq!(a.neighbors().await.len(), 1);
    }

    #[tokio::test]
    async fn network_mismatch_never_activates() {
        let (p, _q, _) = protocol(ProtocolConfig::default().with_network_id(1));
        let mut events = p.subscribe_events();

        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let mut status = status_at(&p, HexCoordinate::new(1, 0));
        status.network_id = 2;
        write_frame(&mut theirs, &MeshMessage::Status(status), MAX).await.unwrap();

        let err = p.connect(ours).await.unwrap_err();
        assert!(matches!(err, NetworkError::NetworkMismatch { ours: 1, theirs: 2 }));
        assert!(err.is_handshake_failure());
        assert_eq!(
            drain_events(&mut events),
            vec![PeerState::Connecting, PeerState::Handshaking, PeerState::Disconnected]
        );
        assert_eq!(p.peer_count().await, 0);
        assert_eq!(p.stats().handshake_failures, 1);
    }

    #[tokio::test]
    async fn genesis_and_version_are_checked() {
        let (p, _q, _) = protocol(ProtocolConfig::default());

        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let mut status = status_at(&p, HexCoordinate::new(1, 0));
        status.genesis = Hash([7; 32]);
        write_frame(&mut theirs, &MeshMessage::Status(status), MAX).await.unwrap();
        assert!(matches!(
            p.connect(ours).await,
            Err(NetworkError::GenesisMismatch { .. })
        ));

        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let mut status = status_at(&p, HexCoordinate::new(1, 0));
        status.protocol_version = 9;
        write_frame(&mut theirs, &MeshMessage::Status(status), MAX).await.unwrap();
        assert!(matches!(
            p.connect(ours).await,
            Err(NetworkError::VersionMismatch { ours: 1, theirs: 9 })
        ));
        assert_eq!(p.stats().handshake_failures, 2);
    }

    #[tokio::test]
    async fn silent_peer_times_out_in_handshake() {
        let config = ProtocolConfig::default().with_handshake_timeout(Duration::from_millis(50));
        let (p, _q, _) = protocol(config);
        let (ours, _theirs) = tokio::io::duplex(64 * 1024);

        let err = p.connect(ours).await.unwrap_err();
        assert!(matches!(err, NetworkError::HandshakeTimeout(d) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn first_message_must_be_status() {
        let (p, _q, _) = protocol(ProtocolConfig::default());
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let update = NeighborUpdate {
            position: HexCoordinate::ORIGIN,
            head: Hash::ZERO,
        };
        write_frame(&mut theirs, &MeshMessage::NeighborUpdate(update), MAX).await.unwrap();

        let err = p.connect(ours).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::UnexpectedMessage {
                expected: "status",
                got: "neighbor-update"
            }
        ));
    }

    #[tokio::test]
    async fn requests_are_answered_from_the_ledger() {
        let (a, _qa, _) = protocol(ProtocolConfig::default());
        let (b, _qb, chain_b) = protocol(ProtocolConfig::default());
        let block = HexBlock::new(child_of(b.genesis(), 1), Vec::new(), None);
        let hash = chain_b.insert_block(block.clone());

        let (x, y) = tokio::io::duplex(64 * 1024);
        let (ra, rb) = tokio::join!(a.connect(x), b.connect(y));
        let (to_b, _) = (ra.unwrap(), rb.unwrap());

        assert_eq!(a.request_block(to_b, hash).await.unwrap(), Some(block.clone()));
        assert_eq!(
            a.request_header(to_b, hash).await.unwrap().map(|h| h.hash()),
            Some(hash)
        );
        assert_eq!(a.request_block(to_b, Hash([9; 32])).await.unwrap(), None);
        assert_eq!(a.pending_requests(to_b).await, 0);
    }

    #[tokio::test]
    async fn unanswered_request_times_out_once() {
        let config = ProtocolConfig::default().with_request_timeout(Duration::from_millis(100));
        let (p, _q, _) = protocol(config);
        let (peer, mut theirs) = raw_peer(&p, HexCoordinate::new(1, 0)).await;
        let tasks = p.start();

        let err = p.request_header(peer, Hash([3; 32])).await.unwrap_err();
        assert!(matches!(err, NetworkError::Request(RequestError::TimedOut)));
        assert_eq!(p.stats().requests_expired, 1);
        assert_eq!(p.pending_requests(peer).await, 0);

        // The request reached the wire; a late answer is ignored.
        let sent = read_frame(&mut theirs, MAX).await.unwrap();
        let MeshMessage::HeaderRequest(req) = sent else {
            panic!("expected a header request, got {}", sent.name());
        };
        let late = MeshMessage::HeaderResponse(HeaderResponse { id: req.id, header: None });
        write_frame(&mut theirs, &late, MAX).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(p.peer_count().await, 1);

        p.shutdown().await;
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn background_tasks_see_an_early_shutdown() {
        let (p, _q, _) = protocol(ProtocolConfig::default());
        // Neither task has been polled when the signal goes out.
        let tasks = p.start();
        p.shutdown().await;
        tokio::time::timeout(WAIT, async {
            for task in tasks {
                task.await.unwrap();
            }
        })
        .await
        .expect("background task outlived shutdown");

        let late = p.start();
        tokio::time::timeout(WAIT, async {
            for task in late {
                task.await.unwrap();
            }
        })
        .await
        .expect("task started after shutdown kept running");
    }

    #[tokio::test]
    async fn plain_traffic_only_needs_a_read_lock() {
        let (p, _q, _) = protocol(ProtocolConfig::default());
        let (peer, _theirs) = raw_peer(&p, HexCoordinate::new(1, 0)).await;
        let before = p.peer(peer).await.unwrap().last_seen;
        sleep(Duration::from_millis(5)).await;

        let reader = p.peers.read().await;
        tokio::time::timeout(WAIT, p.touch(peer, None))
            .await
            .expect("touch waited for the write lock");
        drop(reader);
        assert!(p.peer(peer).await.unwrap().last_seen > before);

        let moved = NeighborUpdate {
            position: HexCoordinate::new(2, 0),
            head: p.genesis(),
        };
        p.touch(peer, Some(moved)).await;
        let record = p.peer(peer).await.unwrap();
        assert_eq!(record.distance, 2);
        assert!(!record.is_direct_neighbor);
    }

    #[tokio::test]
    async fn full_inbound_queue_sheds() {
        let (p, mut queues, _) = protocol(ProtocolConfig::default().with_inbound_capacity(1));
        let (_, mut theirs) = raw_peer(&p, HexCoordinate::new(1, 0)).await;

        for q in 1..=3 {
            let header = child_of(p.genesis(), q);
            write_frame(&mut theirs, &MeshMessage::Header(header), MAX).await.unwrap();
        }
        tokio::time::timeout(WAIT, async {
            while p.stats().headers_dropped < 2 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let kept = queues.headers.try_recv().unwrap();
        assert_eq!(kept.item.position, HexCoordinate::new(1, 0));
        assert!(queues.headers.try_recv().is_err());
        assert_eq!(p.stats().headers_dropped, 2);
    }

    #[tokio::test]
    async fn decode_failure_disconnects_only_that_peer() {
        let (p, _q, _) = protocol(ProtocolConfig::default());
        let (bad, mut bad_stream) = raw_peer(&p, HexCoordinate::new(1, 0)).await;
        let (good, _good_stream) = raw_peer(&p, HexCoordinate::new(0, 1)).await;
        let mut events = p.subscribe_events();

        bad_stream.write_all(&[0, 0, 0, 2, 0xff, 0]).await.unwrap();
        wait_for_peers(&p, 1).await;

        assert!(p.peer(bad).await.is_none());
        assert!(p.peer(good).await.is_some());
        assert_eq!(p.stats().decode_failures, 1);
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent {
                peer: bad,
                state: PeerState::Disconnected
            }
        );
        // The bad peer's stream is closed from our side.
        assert!(matches!(
            read_frame(&mut bad_stream, MAX).await,
            Err(NetworkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn broadcast_reach_follows_distance() {
        let (p, _q, _) = protocol(ProtocolConfig::default().with_flood_radius(3));
        let (near, mut near_stream) = raw_peer(&p, HexCoordinate::new(1, 0)).await;
        let (_mid, _mid_stream) = raw_peer(&p, HexCoordinate::new(3, -1)).await;
        let (_far, _far_stream) = raw_peer(&p, HexCoordinate::new(4, 0)).await;

        let block = HexBlock::new(child_of(p.genesis(), 1), Vec::new(), None);
        assert_eq!(p.broadcast_block(&block).await, 2);
        assert_eq!(p.broadcast_header(block.header()).await, 3);
        let proof = HexaProof::new(Vec::new(), Vec::new(), 1_001, Vec::new());
        assert_eq!(p.broadcast_proof(block.hash(), &proof).await, 1);

        let kinds: Vec<&str> = [
            read_frame(&mut near_stream, MAX).await.unwrap(),
            read_frame(&mut near_stream, MAX).await.unwrap(),
            read_frame(&mut near_stream, MAX).await.unwrap(),
        ]
        .iter()
        .map(|m| m.name())
        .collect();
        assert_eq!(kinds, vec!["block", "header", "proof"]);
        assert!(p.peer(near).await.unwrap().is_direct_neighbor);
    }

    #[tokio::test]
    async fn neighbor_update_moves_the_peer() {
        let (p, _q, _) = protocol(ProtocolConfig::default());
        let (peer, mut theirs) = raw_peer(&p, HexCoordinate::new(3, 0)).await;
        assert!(p.neighbors().await.is_empty());

        let update = NeighborUpdate {
            position: HexCoordinate::new(0, -1),
            head: Hash([5; 32]),
        };
        write_frame(&mut theirs, &MeshMessage::NeighborUpdate(update), MAX).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while p.neighbors().await.is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let record = p.peer(peer).await.unwrap();
        assert_eq!(record.head, Hash([5; 32]));
        assert_eq!(record.distance, 1);

        p.set_local_position(HexCoordinate::new(5, 5)).await;
        assert!(p.neighbors().await.is_empty());
        assert_eq!(p.local_position(), HexCoordinate::new(5, 5));
    }

    #[tokio::test]
    async fn heartbeat_announces_position_and_head() {
        let (p, _q, _) = protocol(ProtocolConfig::default());
        let (_, mut theirs) = raw_peer(&p, HexCoordinate::new(1, 0)).await;
        p.set_head(Hash([4; 32]));

        assert_eq!(p.heartbeat().await, 1);
        let msg = read_frame(&mut theirs, MAX).await.unwrap();
        assert_eq!(
            msg,
            MeshMessage::NeighborUpdate(NeighborUpdate {
                position: HexCoordinate::ORIGIN,
                head: Hash([4; 32]),
            })
        );
    }

    #[tokio::test]
    async fn shutdown_fails_pending_requests() {
        let (p, _q, _) = protocol(ProtocolConfig::default());
        let (peer, _theirs) = raw_peer(&p, HexCoordinate::new(1, 0)).await;

        let waiting = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.request_block(peer, Hash([8; 32])).await })
        };
        tokio::time::timeout(WAIT, async {
            while p.pending_requests(peer).await == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        p.shutdown().await;
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(NetworkError::Request(RequestError::PeerDisconnected))));
        assert_eq!(p.peer_count().await, 0);
        assert_eq!(p.stats().peers_disconnected, 1);

        let (ours, _) = tokio::io::duplex(1024);
        assert!(matches!(p.connect(ours).await, Err(NetworkError::ShuttingDown)));
    }

    #[tokio::test]
    async fn mesh_state_fetches_missing_headers() {
        let (p, mut queues, _) = protocol(ProtocolConfig::default());
        let (_, mut theirs) = raw_peer(&p, HexCoordinate::new(1, 0)).await;
        let header = child_of(p.genesis(), 1);
        let hash = header.hash();

        let summary = MeshStateSummary {
            known_blocks: Default::default(),
            known_headers: [hash, p.genesis()].into_iter().collect(),
        };
        write_frame(&mut theirs, &MeshMessage::MeshState(summary), MAX).await.unwrap();

        // Only the unknown header is requested.
        let asked = read_frame(&mut theirs, MAX).await.unwrap();
        let MeshMessage::HeaderRequest(req) = asked else {
            panic!("expected a header request, got {}", asked.name());
        };
        assert_eq!(req.hash, hash);
        let reply = MeshMessage::HeaderResponse(HeaderResponse {
            id: req.id,
            header: Some(header.clone()),
        });
        write_frame(&mut theirs, &reply, MAX).await.unwrap();

        let fetched = tokio::time::timeout(WAIT, queues.headers.recv()).await.unwrap().unwrap();
        assert_eq!(fetched.item, header);
    }

    #[tokio::test]
    async fn mesh_state_advertises_the_ledger() {
        let (p, _q, chain) = protocol(ProtocolConfig::default());
        let header_only = chain.insert_header(child_of(p.genesis(), 1));
        let (peer, mut theirs) = raw_peer(&p, HexCoordinate::new(1, 0)).await;

        p.send_mesh_state(peer).await.unwrap();
        let MeshMessage::MeshState(summary) = read_frame(&mut theirs, MAX).await.unwrap() else {
            panic!("expected a mesh state summary");
        };
        assert!(summary.known_blocks.contains(&p.genesis()));
        assert!(!summary.known_blocks.contains(&header_only));
        assert!(summary.known_headers.contains(&header_only));
        assert!(matches!(
            p.send_to(PeerId(99), MeshMessage::MeshState(MeshStateSummary::default())).await,
            Err(NetworkError::UnknownPeer(PeerId(99)))
        ));
    }
}
