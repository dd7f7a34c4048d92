//! Full block validation: header, body and merged state.

use std::sync::Arc;

use hexchain_core::{transactions_root, withdrawals_root, ChainReader, HexBlock};
use tracing::debug;

use crate::engine::ConsensusEngine;
use crate::error::{BodyError, ValidationError};
use crate::resolver::{MergeOutcome, StateResolver};

/// Validates complete blocks before they are handed to execution.
pub struct BlockValidator {
    chain: Arc<dyn ChainReader>,
    engine: Arc<dyn ConsensusEngine>,
    resolver: StateResolver,
}

impl BlockValidator {
    pub fn new(chain: Arc<dyn ChainReader>, engine: Arc<dyn ConsensusEngine>) -> Self {
        Self {
            resolver: StateResolver::new(chain.clone()),
            chain,
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ConsensusEngine> {
        &self.engine
    }

    /// Reject known blocks, then check header, body and merged state in
    /// that order. Returns the merged parent state on success.
    pub fn validate_block(&self, block: &HexBlock) -> Result<MergeOutcome, ValidationError> {
        let hash = block.hash();
        if self.chain.has_block(&hash) {
            return Err(ValidationError::KnownBlock(hash));
        }

        self.engine.verify_header(block.header())?;
        validate_body(block)?;
        let outcome = self.resolver.resolve(block.header())?;

        debug!(%hash, conflicts = outcome.conflicts.len(), "block valid");
        Ok(outcome)
    }
}

/// Body commitments declared in the header must match the body.
pub fn validate_body(block: &HexBlock) -> Result<(), BodyError> {
    let header = block.header();

    let got = transactions_root(block.transactions());
    if got != header.tx_root {
        return Err(BodyError::TxRootMismatch {
            got,
            want: header.tx_root,
        });
    }

    if let Some(want) = header.withdrawals_root {
        let withdrawals = block.withdrawals().ok_or(BodyError::MissingWithdrawals)?;
        let got = withdrawals_root(withdrawals);
        if got != want {
            return Err(BodyError::WithdrawalsRootMismatch { got, want });
        }
    }
    Ok(())
}
