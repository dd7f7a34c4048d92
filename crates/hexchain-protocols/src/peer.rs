//! Peer identity, lifecycle and the per-peer record.

use std::time::Instant;

use hexchain_core::{Hash, HexCoordinate};

use crate::error::{NetworkError, Result};

/// Locally assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Disconnected,
}

impl PeerState {
    /// Legal moves: `Connecting -> Handshaking -> Active`, and any live
    /// state to `Disconnected`, which is terminal.
    pub fn can_transition_to(self, next: PeerState) -> bool {
        matches!(
            (self, next),
            (PeerState::Connecting, PeerState::Handshaking)
                | (PeerState::Handshaking, PeerState::Active)
                | (
                    PeerState::Connecting | PeerState::Handshaking | PeerState::Active,
                    PeerState::Disconnected
                )
        )
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Active => write!(f, "Active"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// The state machine of one connection.
#[derive(Debug)]
pub struct PeerLifecycle {
    state: PeerState,
}

impl Default for PeerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerLifecycle {
    pub fn new() -> Self {
        Self {
            state: PeerState::Connecting,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn advance(&mut self, next: PeerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(NetworkError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Published on every lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEvent {
    pub peer: PeerId,
    pub state: PeerState,
}

/// What the protocol knows about an active peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub position: HexCoordinate,
    pub head: Hash,
    /// Hex distance from the local position.
    pub distance: u64,
    pub is_direct_neighbor: bool,
    pub last_seen: Instant,
    pub state: PeerState,
}

impl PeerRecord {
    pub(crate) fn new(id: PeerId, position: HexCoordinate, head: Hash, local: HexCoordinate) -> Self {
        let mut record = Self {
            id,
            position,
            head,
            distance: 0,
            is_direct_neighbor: false,
            last_seen: Instant::now(),
            state: PeerState::Active,
        };
        record.relocate(local);
        record
    }

    /// Recompute distance and neighbor flag against the local position.
    pub(crate) fn relocate(&mut self, local: HexCoordinate) {
        self.distance = self.position.distance(&local);
        self.is_direct_neighbor = self.distance == 1;
    }

    pub(crate) fn update(&mut self, position: HexCoordinate, head: Hash, local: HexCoordinate) {
        self.position = position;
        self.head = head;
        self.relocate(local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        let mut l = PeerLifecycle::new();
        l.advance(PeerState::Handshaking).unwrap();
        l.advance(PeerState::Active).unwrap();
        l.advance(PeerState::Disconnected).unwrap();
        assert_eq!(l.state(), PeerState::Disconnected);
    }

    #[test]
    fn lifecycle_rejects_shortcuts_and_resurrection() {
        let mut l = PeerLifecycle::new();
        assert!(matches!(
            l.advance(PeerState::Active),
            Err(NetworkError::InvalidTransition {
                from: PeerState::Connecting,
                to: PeerState::Active
            })
        ));
        l.advance(PeerState::Disconnected).unwrap();
        for next in [PeerState::Connecting, PeerState::Handshaking, PeerState::Active, PeerState::Disconnected] {
            assert!(l.advance(next).is_err(), "{next}");
        }
    }

    #[test]
    fn record_tracks_distance() {
        let mut r = PeerRecord::new(PeerId(1), HexCoordinate::new(1, 0), Hash::ZERO, HexCoordinate::ORIGIN);
        assert_eq!(r.distance, 1);
        assert!(r.is_direct_neighbor);

        r.update(HexCoordinate::new(3, -1), Hash([1; 32]), HexCoordinate::ORIGIN);
        assert_eq!(r.distance, 3);
        assert!(!r.is_direct_neighbor);

        r.relocate(HexCoordinate::new(2, -1));
        assert_eq!(r.distance, 1);
        assert!(r.is_direct_neighbor);
        assert_eq!(PeerId(4).to_string(), "peer-4");
    }
}
