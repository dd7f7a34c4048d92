//! Parallel batch verification with cooperative cancellation.
//!
//! Headers are verified on a dedicated rayon pool sized to the requested
//! worker count. The work split depends on scheduling but the returned
//! verdicts are always in input order.
//!
//! # Cancellation
//!
//! Once [`CancelSignal::cancel`] is observed, workers start no new header
//! and discard any verdict that completes after the signal. Verdicts
//! recorded before the signal are kept; every other entry is reported as
//! [`BatchVerdict::Cancelled`], never left undefined.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hexchain_core::HexHeader;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::ValidationError;

/// Batches report progress every this many headers.
const PROGRESS_INTERVAL: usize = 100;

/// Shared cancellation flag for a batch.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome for one header of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchVerdict {
    Accepted,
    Rejected(ValidationError),
    /// Not verified, or verified only after cancellation.
    Cancelled,
}

impl BatchVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BatchVerdict::Accepted)
    }

    pub fn error(&self) -> Option<&ValidationError> {
        match self {
            BatchVerdict::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

/// Run `verify` over `headers` on up to `workers` threads.
pub fn verify_batch<F>(
    headers: &[HexHeader],
    workers: usize,
    cancel: &CancelSignal,
    verify: F,
) -> Vec<BatchVerdict>
where
    F: Fn(&HexHeader) -> Result<(), ValidationError> + Sync,
{
    let total = headers.len();
    if total == 0 {
        return Vec::new();
    }

    let completed = AtomicUsize::new(0);
    let check = |header: &HexHeader| {
        if cancel.is_cancelled() {
            return BatchVerdict::Cancelled;
        }
        let verdict = match verify(header) {
            Ok(()) => BatchVerdict::Accepted,
            Err(e) => BatchVerdict::Rejected(e),
        };
        if cancel.is_cancelled() {
            return BatchVerdict::Cancelled;
        }

        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
        if done % PROGRESS_INTERVAL == 0 {
            info!("Verified hexagonal headers: {}/{}", done, total);
        }
        verdict
    };
    let run = || headers.par_iter().map(check).collect::<Vec<_>>();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.clamp(1, total))
        .build();
    let verdicts = match pool {
        Ok(pool) => pool.install(run),
        Err(e) => {
            warn!("Batch pool unavailable, using the global pool: {}", e);
            run()
        }
    };

    if cancel.is_cancelled() {
        let kept = verdicts.iter().filter(|v| **v != BatchVerdict::Cancelled).count();
        info!("Batch cancelled: {} of {} verdicts kept", kept, total);
    }
    verdicts
}
