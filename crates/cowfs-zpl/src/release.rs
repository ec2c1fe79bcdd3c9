//! Deferred node release.
//!
//! Dropping the last hold on a node may start a transaction. Holds released
//! from a thread that has a transaction assigned are queued here instead and
//! dropped by a dedicated worker thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Result, ZplError};
use crate::node::NodeRef;

enum ReleaseTask {
    Release(NodeRef),
    /// Acknowledged once every task queued before it has run.
    Drain(oneshot::Sender<()>),
}

/// Handle to the release worker.
pub(crate) struct Releaser {
    sender: mpsc::UnboundedSender<ReleaseTask>,
    released: Arc<AtomicU64>,
}

impl Releaser {
    pub(crate) fn start() -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ReleaseTask>();
        let released = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&released);
        std::thread::Builder::new()
            .name("cowfs-release".into())
            .spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    match task {
                        ReleaseTask::Release(node) => {
                            debug!(object = %node.id(), "deferred release");
                            drop(node);
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        ReleaseTask::Drain(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .map_err(|e| ZplError::Internal(format!("spawning release worker: {}", e)))?;
        Ok(Self { sender, released })
    }

    /// Queues `node` for release on the worker thread.
    pub(crate) fn defer(&self, node: NodeRef) {
        if let Err(mpsc::error::SendError(task)) = self.sender.send(ReleaseTask::Release(node)) {
            warn!("release worker gone, releasing inline");
            drop(task);
        }
    }

    /// Blocks until every release queued so far has run.
    pub(crate) fn drain(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(ReleaseTask::Drain(ack)).is_ok() {
            let _ = done.blocking_recv();
        }
    }

    pub(crate) fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}
