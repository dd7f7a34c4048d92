//! Counters for events the protocol sheds or fails.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ProtocolStats {
    pub(crate) blocks_dropped: AtomicU64,
    pub(crate) headers_dropped: AtomicU64,
    pub(crate) proofs_dropped: AtomicU64,
    pub(crate) outbound_dropped: AtomicU64,
    pub(crate) requests_expired: AtomicU64,
    pub(crate) decode_failures: AtomicU64,
    pub(crate) handshake_failures: AtomicU64,
    pub(crate) peers_disconnected: AtomicU64,
}

/// Point-in-time copy of [`ProtocolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub blocks_dropped: u64,
    pub headers_dropped: u64,
    pub proofs_dropped: u64,
    pub outbound_dropped: u64,
    pub requests_expired: u64,
    pub decode_failures: u64,
    pub handshake_failures: u64,
    pub peers_disconnected: u64,
}

impl ProtocolStats {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            blocks_dropped: load(&self.blocks_dropped),
            headers_dropped: load(&self.headers_dropped),
            proofs_dropped: load(&self.proofs_dropped),
            outbound_dropped: load(&self.outbound_dropped),
            requests_expired: load(&self.requests_expired),
            decode_failures: load(&self.decode_failures),
            handshake_failures: load(&self.handshake_failures),
            peers_disconnected: load(&self.peers_disconnected),
        }
    }
}
