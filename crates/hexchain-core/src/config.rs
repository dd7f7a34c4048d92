//! Chain-level validation parameters.

use std::path::Path;
use std::time::Duration;

use hexchain_topology::NEIGHBOR_SLOTS;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the resolver settles two parents writing different values to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The parent with the numerically lowest hash wins.
    #[default]
    LowestHashWins,
    /// The parent that comes first in merge order (nearest the origin) wins.
    MergeOrderWins,
}

/// Validation thresholds shared by every node on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Upper bound on parents per header (at most 6).
    pub max_neighbors: u8,
    /// Finality threshold for non-genesis headers.
    pub min_neighbors: u8,
    /// Largest allowed `candidate.number - parent.number`.
    pub max_depth_gap: u64,
    /// Seconds a header's time may run ahead of the local clock.
    pub max_future_skew_secs: u64,
    /// Headers visited per parent when searching for a common ancestor.
    pub ancestor_search_limit: usize,
    pub conflict_policy: ConflictPolicy,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_neighbors: NEIGHBOR_SLOTS as u8,
            min_neighbors: 3,
            max_depth_gap: 10,
            max_future_skew_secs: 15,
            ancestor_search_limit: 1024,
            conflict_policy: ConflictPolicy::LowestHashWins,
        }
    }
}

impl ChainConfig {
    pub fn max_future_skew(&self) -> Duration {
        Duration::from_secs(self.max_future_skew_secs)
    }

    /// Neighbors required for a header at `number`.
    ///
    /// Headers below the finality height (`number < min_neighbors`) are
    /// exempt; the structural rule of at least one parent still applies.
    pub fn required_neighbors(&self, number: u64) -> u8 {
        if number < self.min_neighbors as u64 {
            0
        } else {
            self.min_neighbors
        }
    }

    /// Check that the thresholds are mutually consistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_neighbors == 0 || self.max_neighbors as usize > NEIGHBOR_SLOTS {
            return Err(Error::InvalidConfig(format!(
                "max_neighbors must be in 1..={}, got {}",
                NEIGHBOR_SLOTS, self.max_neighbors
            )));
        }
        if self.min_neighbors == 0 || self.min_neighbors > self.max_neighbors {
            return Err(Error::InvalidConfig(format!(
                "min_neighbors must be in 1..={}, got {}",
                self.max_neighbors, self.min_neighbors
            )));
        }
        if self.max_depth_gap == 0 {
            return Err(Error::InvalidConfig("max_depth_gap must be positive".into()));
        }
        if self.ancestor_search_limit == 0 {
            return Err(Error::InvalidConfig(
                "ancestor_search_limit must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
