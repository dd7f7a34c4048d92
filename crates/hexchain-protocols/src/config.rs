//! Network protocol tunables.

use std::time::Duration;

/// Configuration for a [`MeshProtocol`](crate::MeshProtocol).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Peers on a different network id are refused at handshake.
    pub network_id: u64,
    pub protocol_version: u32,

    /// Time allowed for the remote status message to arrive.
    pub handshake_timeout: Duration,
    /// Interval between neighbor-update broadcasts.
    pub heartbeat_interval: Duration,
    /// Age after which a pending request is failed.
    pub request_timeout: Duration,
    /// Interval between sweeps of the request tables.
    pub sweep_interval: Duration,

    /// Blocks are pushed to peers at most this many cells away.
    pub flood_radius: u64,

    pub block_queue_capacity: usize,
    pub header_queue_capacity: usize,
    pub proof_queue_capacity: usize,
    /// Frames buffered per peer before outbound messages are shed.
    pub outbound_queue_capacity: usize,
    /// In-flight requests per peer.
    pub max_concurrent_requests: usize,
    /// Largest accepted frame body in bytes.
    pub max_frame_len: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            network_id: 1337,
            protocol_version: 1,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
            flood_radius: 3,
            block_queue_capacity: 100,
            header_queue_capacity: 100,
            proof_queue_capacity: 100,
            outbound_queue_capacity: 256,
            max_concurrent_requests: 100,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

impl ProtocolConfig {
    #[must_use]
    pub fn with_network_id(mut self, network_id: u64) -> Self {
        self.network_id = network_id;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the request timeout and sweep at a quarter of it, so a request
    /// fails no later than 1.25x the timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self.sweep_interval = timeout / 4;
        self
    }

    #[must_use]
    pub fn with_flood_radius(mut self, radius: u64) -> Self {
        self.flood_radius = radius;
        self
    }

    /// Set the capacity of all three inbound queues.
    #[must_use]
    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.block_queue_capacity = capacity;
        self.header_queue_capacity = capacity;
        self.proof_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ProtocolConfig::default();
        assert_eq!(c.network_id, 1337);
        assert_eq!(c.handshake_timeout, Duration::from_secs(10));
        assert_eq!(c.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(c.request_timeout, Duration::from_secs(30));
        assert_eq!(c.flood_radius, 3);
        assert_eq!(c.block_queue_capacity, 100);
    }

    #[test]
    fn request_timeout_drives_sweep() {
        let c = ProtocolConfig::default().with_request_timeout(Duration::from_millis(200));
        assert_eq!(c.sweep_interval, Duration::from_millis(50));
    }
}
