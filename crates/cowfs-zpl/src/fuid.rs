//! Table of ephemeral (mapped) identities.
//!
//! Ids above [`MAXUID`] come from an external identity mapper. Every such id
//! stored in a node is registered here; the table is rewritten inside the
//! transaction that first stores the id.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Result, ZplError};
use crate::store::{ObjectStore, Transaction};
use crate::types::{Attr, ObjectId, MAXUID};

/// Space reserved in a transaction that rewrites the table.
const FUID_HOLD_BYTES: u64 = 4096;

pub fn is_ephemeral(id: u32) -> bool {
    id > MAXUID
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct FuidDomain {
    ids: BTreeSet<u32>,
}

#[derive(Default)]
struct FuidState {
    domain: FuidDomain,
    dirty: bool,
}

pub(crate) struct FuidTable {
    object: ObjectId,
    state: Mutex<FuidState>,
}

impl FuidTable {
    pub(crate) fn load(store: &dyn ObjectStore, object: ObjectId) -> Result<Self> {
        let size = store
            .attrs_lookup(object, None)?
            .into_iter()
            .find_map(|a| match a {
                Attr::Size(s) => Some(s),
                _ => None,
            })
            .unwrap_or(0);
        let domain = if size == 0 {
            FuidDomain::default()
        } else {
            let bytes = store.read(object, 0, size as usize)?;
            bincode::deserialize(&bytes).map_err(|e| ZplError::Internal(format!("fuid table: {}", e)))?
        };
        Ok(Self {
            object,
            state: Mutex::new(FuidState { domain, dirty: false }),
        })
    }

    /// Records `id` if it is ephemeral and new. Marks the table dirty.
    pub(crate) fn register(&self, id: u32) {
        if !is_ephemeral(id) {
            return;
        }
        let mut st = self.state.lock();
        if st.domain.ids.insert(id) {
            st.dirty = true;
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.state.lock().domain.ids.contains(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().domain.ids.len()
    }

    pub(crate) fn txhold(&self, tx: &mut Transaction) {
        tx.hold_write(Some(self.object), 0, FUID_HOLD_BYTES);
        tx.hold_attrs(self.object);
    }

    /// Writes the table within `tx` and clears the dirty flag.
    pub(crate) fn sync(&self, store: &dyn ObjectStore, tx: &mut Transaction) -> Result<()> {
        let mut st = self.state.lock();
        if !st.dirty {
            return Ok(());
        }
        let bytes = bincode::serialize(&st.domain).map_err(|e| ZplError::Internal(format!("fuid table: {}", e)))?;
        store.write(tx, self.object, 0, &bytes)?;
        store.free_range(tx, self.object, bytes.len() as u64)?;
        store.attrs_update(tx, self.object, &[Attr::Size(bytes.len() as u64)])?;
        st.dirty = false;
        Ok(())
    }
}
