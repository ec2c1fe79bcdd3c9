//! Transactional object store interface.
//!
//! A [`Transaction`] collects intents (holds) for every object it may touch,
//! is assigned to a transaction group, stages its changes, and is committed
//! exactly once. Assignment may ask the caller to back off and retry with a
//! fresh transaction.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StoreResult;
use crate::types::{Attr, ObjectId, Txg};

/// How `tx_assign` behaves when the open transaction group is congested.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxWait {
    /// Report contention with [`AssignOutcome::Restart`]; used while locks are held.
    NoWait,
    /// Block until the transaction can be assigned.
    Wait,
    /// Caller already waited once after a restart; skip the congestion throttle.
    Waited,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AssignOutcome {
    Assigned(Txg),
    Restart,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    PlainFile,
    Directory,
    /// Bookkeeping map (master node, unlinked set).
    Map,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxState {
    Open,
    Assigned(Txg),
    Committed,
    Aborted,
}

/// What a transaction intends to do to one object. `None` targets an object
/// the transaction will create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxHold {
    Write {
        object: Option<ObjectId>,
        offset: u64,
        len: u64,
    },
    Free {
        object: ObjectId,
        offset: u64,
        len: u64,
    },
    Attrs {
        object: ObjectId,
    },
    AttrsCreate {
        bytes: u64,
    },
    Map {
        object: Option<ObjectId>,
        add: bool,
        name: Option<Vec<u8>>,
    },
}

impl TxHold {
    fn estimated_bytes(&self) -> u64 {
        match self {
            TxHold::Write { len, .. } => *len,
            TxHold::Free { .. } => 0,
            TxHold::Attrs { .. } => 512,
            TxHold::AttrsCreate { bytes } => *bytes,
            TxHold::Map { .. } => 512,
        }
    }

    pub fn object(&self) -> Option<ObjectId> {
        match self {
            TxHold::Write { object, .. } | TxHold::Map { object, .. } => *object,
            TxHold::Free { object, .. } | TxHold::Attrs { object } => Some(*object),
            TxHold::AttrsCreate { .. } => None,
        }
    }
}

/// One change staged by a transaction, applied at commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StagedChange {
    Create {
        object: ObjectId,
        kind: ObjectType,
        block_size: u64,
    },
    Free {
        object: ObjectId,
    },
    Write {
        object: ObjectId,
        offset: u64,
        data: Bytes,
    },
    Truncate {
        object: ObjectId,
        size: u64,
    },
    SetBlockSize {
        object: ObjectId,
        block_size: u64,
    },
    Attrs {
        object: ObjectId,
        attrs: Vec<Attr>,
        /// Store-wide staging order.
        seq: u64,
    },
    MapAdd {
        object: ObjectId,
        name: Vec<u8>,
        value: u64,
    },
    MapRemove {
        object: ObjectId,
        name: Vec<u8>,
    },
}

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// One atomic unit of change.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    state: TxState,
    holds: Vec<TxHold>,
    netfree: bool,
    staged: Vec<StagedChange>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            state: TxState::Open,
            holds: Vec::new(),
            netfree: false,
            staged: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn txg(&self) -> Option<Txg> {
        match self.state {
            TxState::Assigned(txg) => Some(txg),
            _ => None,
        }
    }

    pub fn holds(&self) -> &[TxHold] {
        &self.holds
    }

    fn hold(&mut self, hold: TxHold) {
        debug_assert_eq!(self.state, TxState::Open, "intent declared after assignment");
        self.holds.push(hold);
    }

    pub fn hold_write(&mut self, object: Option<ObjectId>, offset: u64, len: u64) {
        self.hold(TxHold::Write {
            object,
            offset,
            len,
        });
    }

    pub fn hold_free(&mut self, object: ObjectId, offset: u64, len: u64) {
        self.hold(TxHold::Free {
            object,
            offset,
            len,
        });
    }

    pub fn hold_attrs(&mut self, object: ObjectId) {
        self.hold(TxHold::Attrs { object });
    }

    pub fn hold_attrs_create(&mut self, bytes: u64) {
        self.hold(TxHold::AttrsCreate { bytes });
    }

    pub fn hold_map(&mut self, object: Option<ObjectId>, add: bool, name: Option<&[u8]>) {
        self.hold(TxHold::Map {
            object,
            add,
            name: name.map(|n| n.to_vec()),
        });
    }

    /// The transaction frees more than it allocates; exempt from space checks.
    pub fn mark_netfree(&mut self) {
        self.netfree = true;
    }

    pub fn is_netfree(&self) -> bool {
        self.netfree
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.holds.iter().map(TxHold::estimated_bytes).sum()
    }

    pub fn staged(&self) -> &[StagedChange] {
        &self.staged
    }

    /// Records an assignment-state transition. For store implementations.
    pub fn set_state(&mut self, state: TxState) {
        self.state = state;
    }

    /// Adds a change to the write set. For store implementations.
    pub fn stage(&mut self, change: StagedChange) {
        self.staged.push(change);
    }

    /// Drains the write set at commit. For store implementations.
    pub fn take_staged(&mut self) -> Vec<StagedChange> {
        std::mem::take(&mut self.staged)
    }

    /// Looks up the latest staged directory-map change for `(object, name)`.
    /// `Some(Some(v))` means added with value `v`, `Some(None)` removed.
    pub fn staged_map_entry(&self, object: ObjectId, name: &[u8]) -> Option<Option<u64>> {
        self.staged.iter().rev().find_map(|c| match c {
            StagedChange::MapAdd {
                object: o,
                name: n,
                value,
            } if *o == object && n.as_slice() == name => Some(Some(*value)),
            StagedChange::MapRemove { object: o, name: n } if *o == object && n.as_slice() == name => {
                Some(None)
            }
            _ => None,
        })
    }

    /// Whether the object is created (and not freed again) by this transaction.
    pub fn creates(&self, object: ObjectId) -> bool {
        let mut created = false;
        for c in &self.staged {
            match c {
                StagedChange::Create { object: o, .. } if *o == object => created = true,
                StagedChange::Free { object: o } if *o == object => created = false,
                _ => {}
            }
        }
        created
    }

    pub fn frees(&self, object: ObjectId) -> bool {
        self.staged
            .iter()
            .any(|c| matches!(c, StagedChange::Free { object: o } if *o == object))
    }
}

/// One entry of a directory map with its stable iteration cookie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub name: Vec<u8>,
    pub value: u64,
    pub cookie: u64,
}

/// The transactional, copy-on-write object store.
pub trait ObjectStore: Send + Sync {
    fn tx_create(&self) -> Transaction {
        Transaction::new()
    }

    /// Assigns the transaction to the open transaction group.
    fn tx_assign(&self, tx: &mut Transaction, wait: TxWait) -> StoreResult<AssignOutcome>;

    /// Blocks until the contention that caused a restart has cleared.
    fn tx_wait(&self, tx: &Transaction);

    fn tx_abort(&self, tx: Transaction);

    /// Applies every staged change atomically and returns the transaction group.
    fn tx_commit(&self, tx: Transaction) -> StoreResult<Txg>;

    fn object_alloc(&self, tx: &mut Transaction, kind: ObjectType, block_size: u64) -> StoreResult<ObjectId>;

    /// Creates an object with a caller-chosen id (log replay).
    fn object_claim(
        &self,
        tx: &mut Transaction,
        object: ObjectId,
        kind: ObjectType,
        block_size: u64,
    ) -> StoreResult<()>;

    fn object_free(&self, tx: &mut Transaction, object: ObjectId) -> StoreResult<()>;

    fn object_exists(&self, object: ObjectId) -> bool;

    fn block_size(&self, object: ObjectId) -> StoreResult<u64>;

    fn set_block_size(&self, tx: &mut Transaction, object: ObjectId, block_size: u64) -> StoreResult<()>;

    /// Reads `len` bytes at `offset`; holes read as zeros.
    fn read(&self, object: ObjectId, offset: u64, len: usize) -> StoreResult<Vec<u8>>;

    fn write(&self, tx: &mut Transaction, object: ObjectId, offset: u64, data: &[u8]) -> StoreResult<()>;

    /// Hands out a buffer the caller fills before assigning it without a copy.
    fn request_buffer(&self, len: usize) -> BytesMut {
        BytesMut::with_capacity(len)
    }

    /// Writes a previously requested buffer, taking ownership of it.
    fn assign_buffer(&self, tx: &mut Transaction, object: ObjectId, offset: u64, buf: Bytes) -> StoreResult<()>;

    /// Discards data at and beyond `offset`.
    fn free_range(&self, tx: &mut Transaction, object: ObjectId, offset: u64) -> StoreResult<()>;

    /// Bulk attribute update.
    fn attrs_update(&self, tx: &mut Transaction, object: ObjectId, attrs: &[Attr]) -> StoreResult<()>;

    /// Bulk attribute lookup; sees changes staged in `tx` when given.
    fn attrs_lookup(&self, object: ObjectId, tx: Option<&Transaction>) -> StoreResult<Vec<Attr>>;

    fn map_add(&self, tx: &mut Transaction, object: ObjectId, name: &[u8], value: u64) -> StoreResult<()>;

    fn map_remove(&self, tx: &mut Transaction, object: ObjectId, name: &[u8]) -> StoreResult<()>;

    fn map_lookup(&self, object: ObjectId, name: &[u8], tx: Option<&Transaction>) -> StoreResult<Option<u64>>;

    /// Committed entries with `cookie >= from`, in cookie order.
    fn map_list(&self, object: ObjectId, from: u64, limit: usize) -> StoreResult<Vec<MapEntry>>;

    fn map_count(&self, object: ObjectId) -> StoreResult<u64>;

    /// Hint that the object will be read soon.
    fn prefetch(&self, object: ObjectId);

    /// Closes the open transaction group and makes it durable.
    fn sync(&self) -> StoreResult<Txg>;

    fn synced_txg(&self) -> Txg;
}
