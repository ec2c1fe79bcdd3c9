//! Transaction assignment with restart handling.
//!
//! Every mutating operation builds its locks and transaction in a `prepare`
//! step, then asks the store to assign the transaction. The first attempt does
//! not wait for congestion. On a restart the locks from that attempt are
//! dropped, the caller waits for the contention to clear, the transaction is
//! aborted, and `prepare` runs again with a fresh transaction; later attempts
//! skip the congestion throttle. Structural failures abort and return.

use tracing::debug;

use crate::error::Result;
use crate::mount::MountInner;
use crate::stats::ZplStats;
use crate::store::{AssignOutcome, Transaction, TxWait};
use crate::types::Txg;

/// Locks and an assigned transaction ready for mutation.
pub(crate) struct Assigned<L> {
    pub locks: L,
    pub tx: Transaction,
    pub txg: Txg,
}

impl MountInner {
    /// Runs `prepare` until its transaction is assigned. `prepare` sees the
    /// wait mode of the attempt it is building.
    pub(crate) fn assign_with_retry<L, F>(&self, op: &'static str, mut prepare: F) -> Result<Assigned<L>>
    where
        F: FnMut(TxWait) -> Result<(L, Transaction)>,
    {
        let mut wait = TxWait::NoWait;
        let mut attempt = 0u32;
        loop {
            let (locks, mut tx) = prepare(wait)?;
            match self.store.tx_assign(&mut tx, wait) {
                Ok(AssignOutcome::Assigned(txg)) => {
                    if attempt > 0 {
                        debug!(op, attempt, txg, "transaction assigned after restart");
                    }
                    return Ok(Assigned { locks, tx, txg });
                }
                Ok(AssignOutcome::Restart) => {
                    drop(locks);
                    self.store.tx_wait(&tx);
                    self.store.tx_abort(tx);
                    ZplStats::bump(&self.stats.tx_restarts);
                    attempt += 1;
                    debug!(op, attempt, "transaction restart");
                    wait = TxWait::Waited;
                }
                Err(e) => {
                    self.store.tx_abort(tx);
                    drop(locks);
                    debug!(op, error = %e, "transaction assignment failed");
                    return Err(e.into());
                }
            }
        }
    }
}
