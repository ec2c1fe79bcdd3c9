//! In-memory object store.
//!
//! Transactions stage their changes and apply them to the live object set at
//! commit. Committed changes become durable only when their transaction group
//! syncs; [`MemoryObjectStore::crash_image`] returns a store holding durable
//! state alone, which is what a remount after power loss would see.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    AssignOutcome, MapEntry, ObjectStore, ObjectType, StagedChange, Transaction, TxState, TxWait,
};
use crate::types::{Attr, AttrId, ObjectId, Txg};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// Pool capacity; assignments that would exceed it fail with ENOSPC.
    pub capacity_bytes: u64,
    /// Estimated dirty bytes per transaction group before writers are throttled.
    pub dirty_limit_bytes: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 1 << 30,
            dirty_limit_bytes: 64 << 20,
        }
    }
}

/// Mutation points where a fault can be injected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultPoint {
    MapAdd,
    MapRemove,
    Write,
    /// Reads fail with a checksum error.
    Read,
}

impl FaultPoint {
    fn name(&self) -> &'static str {
        match self {
            FaultPoint::MapAdd => "map_add",
            FaultPoint::MapRemove => "map_remove",
            FaultPoint::Write => "write",
            FaultPoint::Read => "read",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub assigns: u64,
    pub restarts: u64,
    pub commits: u64,
    pub aborts: u64,
    pub syncs: u64,
    pub prefetches: u64,
}

/// Bytes per data chunk. Chunks never written read as zeros.
const CHUNK_SIZE: u64 = 64 * 1024;

/// Sparse object contents keyed by chunk index.
#[derive(Clone, Debug, Default)]
struct ObjectData {
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl ObjectData {
    /// Bytes actually held.
    fn allocated(&self) -> u64 {
        self.chunks.values().map(|c| c.len() as u64).sum()
    }

    /// Returns the change in held bytes.
    fn write(&mut self, offset: u64, data: &[u8]) -> i64 {
        let mut delta = 0i64;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let (idx, within) = (pos / CHUNK_SIZE, (pos % CHUNK_SIZE) as usize);
            let n = (CHUNK_SIZE as usize - within).min(data.len() - done);
            let chunk = self.chunks.entry(idx).or_default();
            if chunk.len() < within + n {
                delta += (within + n - chunk.len()) as i64;
                chunk.resize(within + n, 0);
            }
            chunk[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        delta
    }

    /// Drops everything at or past `size`. Returns the change in held bytes.
    fn truncate(&mut self, size: u64) -> i64 {
        let before = self.allocated();
        let idx = size / CHUNK_SIZE;
        let within = (size % CHUNK_SIZE) as usize;
        let first_gone = if within == 0 { idx } else { idx + 1 };
        self.chunks.split_off(&first_gone);
        if within > 0 {
            if let Some(chunk) = self.chunks.get_mut(&idx) {
                chunk.truncate(within);
            }
        }
        self.allocated() as i64 - before as i64
    }

    fn read(&self, offset: u64, out: &mut [u8]) {
        let end = offset + out.len() as u64;
        let first = offset / CHUNK_SIZE;
        let last = end.div_ceil(CHUNK_SIZE);
        for (idx, chunk) in self.chunks.range(first..last) {
            let base = idx * CHUNK_SIZE;
            let from = offset.max(base);
            let to = end.min(base + chunk.len() as u64);
            if from < to {
                let src = &chunk[(from - base) as usize..(to - base) as usize];
                let dst = (from - offset) as usize;
                out[dst..dst + src.len()].copy_from_slice(src);
            }
        }
    }
}

#[derive(Clone, Debug)]
struct MemObject {
    kind: ObjectType,
    block_size: u64,
    data: ObjectData,
    attrs: BTreeMap<AttrId, Attr>,
    /// Staging sequence of the value held for each attribute.
    attr_seq: BTreeMap<AttrId, u64>,
    map: BTreeMap<Vec<u8>, (u64, u64)>,
    order: BTreeMap<u64, Vec<u8>>,
    next_cookie: u64,
}

impl MemObject {
    fn new(kind: ObjectType, block_size: u64) -> Self {
        Self {
            kind,
            block_size,
            data: ObjectData::default(),
            attrs: BTreeMap::new(),
            attr_seq: BTreeMap::new(),
            map: BTreeMap::new(),
            order: BTreeMap::new(),
            next_cookie: 1,
        }
    }
}

type Objects = BTreeMap<ObjectId, MemObject>;

/// Applies one change; returns the change in stored data bytes.
fn apply(objects: &mut Objects, change: &StagedChange) -> i64 {
    match change {
        StagedChange::Create {
            object,
            kind,
            block_size,
        } => {
            objects.insert(*object, MemObject::new(*kind, *block_size));
            0
        }
        StagedChange::Free { object } => objects
            .remove(object)
            .map(|o| -(o.data.allocated() as i64))
            .unwrap_or(0),
        StagedChange::Write {
            object,
            offset,
            data,
        } => match objects.get_mut(object) {
            Some(obj) => obj.data.write(*offset, data),
            None => 0,
        },
        StagedChange::Truncate { object, size } => match objects.get_mut(object) {
            Some(obj) => obj.data.truncate(*size),
            None => 0,
        },
        StagedChange::SetBlockSize { object, block_size } => {
            if let Some(obj) = objects.get_mut(object) {
                obj.block_size = *block_size;
            }
            0
        }
        StagedChange::Attrs { object, attrs, seq } => {
            if let Some(obj) = objects.get_mut(object) {
                // Transactions may commit out of staging order; the value
                // staged last wins.
                for attr in attrs {
                    let held = obj.attr_seq.entry(attr.id()).or_insert(0);
                    if *seq >= *held {
                        *held = *seq;
                        obj.attrs.insert(attr.id(), attr.clone());
                    }
                }
            }
            0
        }
        StagedChange::MapAdd {
            object,
            name,
            value,
        } => {
            if let Some(obj) = objects.get_mut(object) {
                let cookie = obj.next_cookie;
                obj.next_cookie += 1;
                if let Some((_, old)) = obj.map.insert(name.clone(), (*value, cookie)) {
                    obj.order.remove(&old);
                }
                obj.order.insert(cookie, name.clone());
            }
            0
        }
        StagedChange::MapRemove { object, name } => {
            if let Some(obj) = objects.get_mut(object) {
                if let Some((_, cookie)) = obj.map.remove(name) {
                    obj.order.remove(&cookie);
                }
            }
            0
        }
    }
}

struct Fault {
    point: FaultPoint,
    skip: u32,
}

struct StoreState {
    live: Objects,
    durable: Objects,
    pending: Vec<(Txg, Vec<StagedChange>)>,
    open_txg: Txg,
    synced_txg: Txg,
    active: HashMap<Txg, usize>,
    dirty: HashMap<Txg, u64>,
    next_object: u64,
    next_attr_seq: u64,
    used_bytes: u64,
    forced_restarts: u32,
    forced_no_space: u32,
    faults: Vec<Fault>,
    stats: StoreStats,
}

impl StoreState {
    fn exists(&self, tx: Option<&Transaction>, object: ObjectId) -> bool {
        if let Some(tx) = tx {
            if tx.creates(object) {
                return true;
            }
            if tx.frees(object) {
                return false;
            }
        }
        self.live.contains_key(&object)
    }

    fn require(&self, tx: &Transaction, object: ObjectId) -> StoreResult<()> {
        if self.exists(Some(tx), object) {
            Ok(())
        } else {
            Err(StoreError::NoSuchObject(object))
        }
    }

    fn take_fault(&mut self, point: FaultPoint) -> bool {
        let Some(idx) = self.faults.iter().position(|f| f.point == point) else {
            return false;
        };
        if self.faults[idx].skip == 0 {
            self.faults.remove(idx);
            true
        } else {
            self.faults[idx].skip -= 1;
            false
        }
    }

    fn congested(&self, limit: u64, est: u64) -> bool {
        let dirty = self.dirty.get(&self.open_txg).copied().unwrap_or(0);
        dirty > 0 && dirty + est > limit
    }

    fn map_value(&self, tx: Option<&Transaction>, object: ObjectId, name: &[u8]) -> StoreResult<Option<u64>> {
        if let Some(tx) = tx {
            if let Some(staged) = tx.staged_map_entry(object, name) {
                return Ok(staged);
            }
            if tx.creates(object) {
                return Ok(None);
            }
        }
        let obj = self
            .live
            .get(&object)
            .ok_or(StoreError::NoSuchObject(object))?;
        Ok(obj.map.get(name).map(|(value, _)| *value))
    }
}

fn check_assigned(tx: &Transaction) -> StoreResult<()> {
    match tx.state() {
        TxState::Assigned(_) => Ok(()),
        _ => Err(StoreError::NotAssigned(tx.id())),
    }
}

pub struct MemoryObjectStore {
    config: MemoryStoreConfig,
    state: Mutex<StoreState>,
    quiesced: Condvar,
    sync_lock: Mutex<()>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryObjectStore {
    /// Creates an empty pool holding only the master object.
    pub fn new(config: MemoryStoreConfig) -> Self {
        let mut objects = Objects::new();
        objects.insert(ObjectId::MASTER, MemObject::new(ObjectType::Map, 512));
        Self::from_parts(config, objects, 0, ObjectId::MASTER.as_u64() + 1)
    }

    fn from_parts(config: MemoryStoreConfig, durable: Objects, synced_txg: Txg, next_object: u64) -> Self {
        let used_bytes = durable.values().map(|o| o.data.allocated()).sum();
        let next_attr_seq = durable
            .values()
            .flat_map(|o| o.attr_seq.values())
            .max()
            .map_or(1, |seq| seq + 1);
        Self {
            config,
            state: Mutex::new(StoreState {
                live: durable.clone(),
                durable,
                pending: Vec::new(),
                open_txg: synced_txg + 1,
                synced_txg,
                active: HashMap::new(),
                dirty: HashMap::new(),
                next_object,
                next_attr_seq,
                used_bytes,
                forced_restarts: 0,
                forced_no_space: 0,
                faults: Vec::new(),
                stats: StoreStats::default(),
            }),
            quiesced: Condvar::new(),
            sync_lock: Mutex::new(()),
        }
    }

    /// The pool as it would be found after a crash: synced state only.
    pub fn crash_image(&self) -> MemoryObjectStore {
        let st = self.state.lock();
        Self::from_parts(
            self.config.clone(),
            st.durable.clone(),
            st.synced_txg,
            st.next_object,
        )
    }

    /// The next `count` assignments report contention regardless of wait mode.
    pub fn force_restarts(&self, count: u32) {
        self.state.lock().forced_restarts = count;
    }

    /// The next `count` assignments fail with ENOSPC.
    pub fn force_no_space(&self, count: u32) {
        self.state.lock().forced_no_space = count;
    }

    /// Fails the mutation at `point` after letting `skip` matching calls through.
    pub fn inject_fault(&self, point: FaultPoint, skip: u32) {
        self.state.lock().faults.push(Fault { point, skip });
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn stats(&self) -> StoreStats {
        self.state.lock().stats.clone()
    }

    /// Ids of all live objects.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.state.lock().live.keys().copied().collect()
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    pub fn open_txg(&self) -> Txg {
        self.state.lock().open_txg
    }
}

impl ObjectStore for MemoryObjectStore {
    fn tx_assign(&self, tx: &mut Transaction, wait: TxWait) -> StoreResult<AssignOutcome> {
        if tx.state() != TxState::Open {
            return Err(StoreError::NotAssigned(tx.id()));
        }
        loop {
            let mut st = self.state.lock();
            st.stats.assigns += 1;
            if st.forced_restarts > 0 {
                st.forced_restarts -= 1;
                st.stats.restarts += 1;
                return Ok(AssignOutcome::Restart);
            }
            if st.forced_no_space > 0 {
                st.forced_no_space -= 1;
                return Err(StoreError::NoSpace);
            }

            let est = tx.estimated_bytes();
            if !tx.is_netfree() && st.used_bytes + est > self.config.capacity_bytes {
                return Err(StoreError::NoSpace);
            }

            if st.congested(self.config.dirty_limit_bytes, est) {
                match wait {
                    TxWait::NoWait => {
                        st.stats.restarts += 1;
                        return Ok(AssignOutcome::Restart);
                    }
                    TxWait::Wait => {
                        drop(st);
                        self.sync()?;
                        continue;
                    }
                    TxWait::Waited => {}
                }
            }

            let txg = st.open_txg;
            *st.active.entry(txg).or_insert(0) += 1;
            *st.dirty.entry(txg).or_insert(0) += est;
            tx.set_state(TxState::Assigned(txg));
            return Ok(AssignOutcome::Assigned(txg));
        }
    }

    fn tx_wait(&self, tx: &Transaction) {
        let congested = {
            let st = self.state.lock();
            st.congested(self.config.dirty_limit_bytes, tx.estimated_bytes())
        };
        if congested {
            if let Err(e) = self.sync() {
                debug!("tx {}: sync while waiting failed: {}", tx.id(), e);
            }
        }
    }

    fn tx_abort(&self, mut tx: Transaction) {
        let mut st = self.state.lock();
        if let TxState::Assigned(txg) = tx.state() {
            if let Some(n) = st.active.get_mut(&txg) {
                *n -= 1;
            }
            self.quiesced.notify_all();
        }
        st.stats.aborts += 1;
        tx.set_state(TxState::Aborted);
    }

    fn tx_commit(&self, mut tx: Transaction) -> StoreResult<Txg> {
        let txg = tx.txg().ok_or(StoreError::NotAssigned(tx.id()))?;
        let staged = tx.take_staged();
        let mut st = self.state.lock();
        let st = &mut *st;
        let mut delta = 0i64;
        for change in &staged {
            delta += apply(&mut st.live, change);
        }
        st.used_bytes = (st.used_bytes as i64 + delta).max(0) as u64;
        st.pending.push((txg, staged));
        if let Some(n) = st.active.get_mut(&txg) {
            *n -= 1;
        }
        st.stats.commits += 1;
        self.quiesced.notify_all();
        tx.set_state(TxState::Committed);
        Ok(txg)
    }

    fn object_alloc(&self, tx: &mut Transaction, kind: ObjectType, block_size: u64) -> StoreResult<ObjectId> {
        check_assigned(tx)?;
        let mut st = self.state.lock();
        let object = ObjectId::new(st.next_object);
        st.next_object += 1;
        tx.stage(StagedChange::Create {
            object,
            kind,
            block_size,
        });
        Ok(object)
    }

    fn object_claim(
        &self,
        tx: &mut Transaction,
        object: ObjectId,
        kind: ObjectType,
        block_size: u64,
    ) -> StoreResult<()> {
        check_assigned(tx)?;
        let mut st = self.state.lock();
        if st.exists(Some(&*tx), object) {
            return Err(StoreError::ObjectExists(object));
        }
        st.next_object = st.next_object.max(object.as_u64() + 1);
        tx.stage(StagedChange::Create {
            object,
            kind,
            block_size,
        });
        Ok(())
    }

    fn object_free(&self, tx: &mut Transaction, object: ObjectId) -> StoreResult<()> {
        check_assigned(tx)?;
        self.state.lock().require(tx, object)?;
        tx.stage(StagedChange::Free { object });
        Ok(())
    }

    fn object_exists(&self, object: ObjectId) -> bool {
        self.state.lock().live.contains_key(&object)
    }

    fn block_size(&self, object: ObjectId) -> StoreResult<u64> {
        self.state
            .lock()
            .live
            .get(&object)
            .map(|o| o.block_size)
            .ok_or(StoreError::NoSuchObject(object))
    }

    fn set_block_size(&self, tx: &mut Transaction, object: ObjectId, block_size: u64) -> StoreResult<()> {
        check_assigned(tx)?;
        self.state.lock().require(tx, object)?;
        tx.stage(StagedChange::SetBlockSize { object, block_size });
        Ok(())
    }

    fn read(&self, object: ObjectId, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let mut st = self.state.lock();
        if st.take_fault(FaultPoint::Read) {
            return Err(StoreError::Checksum(object));
        }
        let obj = st.live.get(&object).ok_or(StoreError::NoSuchObject(object))?;
        let mut out = vec![0u8; len];
        obj.data.read(offset, &mut out);
        Ok(out)
    }

    fn write(&self, tx: &mut Transaction, object: ObjectId, offset: u64, data: &[u8]) -> StoreResult<()> {
        self.assign_buffer(tx, object, offset, Bytes::copy_from_slice(data))
    }

    fn assign_buffer(&self, tx: &mut Transaction, object: ObjectId, offset: u64, buf: Bytes) -> StoreResult<()> {
        check_assigned(tx)?;
        let mut st = self.state.lock();
        if st.take_fault(FaultPoint::Write) {
            return Err(StoreError::Injected(FaultPoint::Write.name()));
        }
        st.require(tx, object)?;
        tx.stage(StagedChange::Write {
            object,
            offset,
            data: buf,
        });
        Ok(())
    }

    fn free_range(&self, tx: &mut Transaction, object: ObjectId, offset: u64) -> StoreResult<()> {
        check_assigned(tx)?;
        self.state.lock().require(tx, object)?;
        tx.stage(StagedChange::Truncate {
            object,
            size: offset,
        });
        Ok(())
    }

    fn attrs_update(&self, tx: &mut Transaction, object: ObjectId, attrs: &[Attr]) -> StoreResult<()> {
        check_assigned(tx)?;
        let mut st = self.state.lock();
        st.require(tx, object)?;
        let seq = st.next_attr_seq;
        st.next_attr_seq += 1;
        tx.stage(StagedChange::Attrs {
            object,
            attrs: attrs.to_vec(),
            seq,
        });
        Ok(())
    }

    fn attrs_lookup(&self, object: ObjectId, tx: Option<&Transaction>) -> StoreResult<Vec<Attr>> {
        let st = self.state.lock();
        if !st.exists(tx, object) {
            return Err(StoreError::NoSuchObject(object));
        }
        let mut attrs = match tx {
            Some(tx) if tx.creates(object) => BTreeMap::new(),
            _ => st
                .live
                .get(&object)
                .map(|o| o.attrs.clone())
                .unwrap_or_default(),
        };
        if let Some(tx) = tx {
            for change in tx.staged() {
                if let StagedChange::Attrs { object: o, attrs: staged, .. } = change {
                    if *o == object {
                        for attr in staged {
                            attrs.insert(attr.id(), attr.clone());
                        }
                    }
                }
            }
        }
        Ok(attrs.into_values().collect())
    }

    fn map_add(&self, tx: &mut Transaction, object: ObjectId, name: &[u8], value: u64) -> StoreResult<()> {
        check_assigned(tx)?;
        let mut st = self.state.lock();
        if st.take_fault(FaultPoint::MapAdd) {
            return Err(StoreError::Injected(FaultPoint::MapAdd.name()));
        }
        st.require(tx, object)?;
        if st.map_value(Some(&*tx), object, name)?.is_some() {
            return Err(StoreError::EntryExists(object));
        }
        tx.stage(StagedChange::MapAdd {
            object,
            name: name.to_vec(),
            value,
        });
        Ok(())
    }

    fn map_remove(&self, tx: &mut Transaction, object: ObjectId, name: &[u8]) -> StoreResult<()> {
        check_assigned(tx)?;
        let mut st = self.state.lock();
        if st.take_fault(FaultPoint::MapRemove) {
            return Err(StoreError::Injected(FaultPoint::MapRemove.name()));
        }
        st.require(tx, object)?;
        if st.map_value(Some(&*tx), object, name)?.is_none() {
            return Err(StoreError::EntryNotFound(object));
        }
        tx.stage(StagedChange::MapRemove {
            object,
            name: name.to_vec(),
        });
        Ok(())
    }

    fn map_lookup(&self, object: ObjectId, name: &[u8], tx: Option<&Transaction>) -> StoreResult<Option<u64>> {
        self.state.lock().map_value(tx, object, name)
    }

    fn map_list(&self, object: ObjectId, from: u64, limit: usize) -> StoreResult<Vec<MapEntry>> {
        let st = self.state.lock();
        let obj = st.live.get(&object).ok_or(StoreError::NoSuchObject(object))?;
        Ok(obj
            .order
            .range(from..)
            .take(limit)
            .filter_map(|(cookie, name)| {
                obj.map.get(name).map(|(value, _)| MapEntry {
                    name: name.clone(),
                    value: *value,
                    cookie: *cookie,
                })
            })
            .collect())
    }

    fn map_count(&self, object: ObjectId) -> StoreResult<u64> {
        let st = self.state.lock();
        let obj = st.live.get(&object).ok_or(StoreError::NoSuchObject(object))?;
        Ok(obj.map.len() as u64)
    }

    fn prefetch(&self, _object: ObjectId) {
        self.state.lock().stats.prefetches += 1;
    }

    fn sync(&self) -> StoreResult<Txg> {
        let _serial = self.sync_lock.lock();
        let mut guard = self.state.lock();
        let txg = guard.open_txg;
        guard.open_txg += 1;
        while guard.active.get(&txg).copied().unwrap_or(0) > 0 {
            self.quiesced.wait(&mut guard);
        }

        let st = &mut *guard;
        let pending = std::mem::take(&mut st.pending);
        let (done, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|(t, _)| *t <= txg);
        for (_, changes) in &done {
            for change in changes {
                apply(&mut st.durable, change);
            }
        }
        st.pending = rest;
        st.active.remove(&txg);
        st.dirty.remove(&txg);
        st.synced_txg = txg;
        st.stats.syncs += 1;
        debug!(txg, commits = done.len(), "transaction group synced");
        Ok(txg)
    }

    fn synced_txg(&self) -> Txg {
        self.state.lock().synced_txg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assigned(store: &MemoryObjectStore) -> Transaction {
        let mut tx = store.tx_create();
        tx.hold_attrs_create(512);
        assert!(matches!(
            store.tx_assign(&mut tx, TxWait::NoWait).unwrap(),
            AssignOutcome::Assigned(_)
        ));
        tx
    }

    #[test]
    fn test_commit_applies_staged_changes() {
        let store = MemoryObjectStore::default();
        let mut tx = assigned(&store);
        let obj = store.object_alloc(&mut tx, ObjectType::PlainFile, 512).unwrap();
        store.write(&mut tx, obj, 0, b"hello").unwrap();
        assert!(!store.object_exists(obj));
        store.tx_commit(tx).unwrap();
        assert!(store.object_exists(obj));
        assert_eq!(store.read(obj, 0, 5).unwrap(), b"hello");
        assert_eq!(store.used_bytes(), 5);
    }

    #[test]
    fn test_mutation_requires_assignment() {
        let store = MemoryObjectStore::default();
        let mut tx = store.tx_create();
        assert!(matches!(
            store.object_alloc(&mut tx, ObjectType::PlainFile, 512),
            Err(StoreError::NotAssigned(_))
        ));
    }

    #[test]
    fn test_crash_image_keeps_only_synced() {
        let store = MemoryObjectStore::default();
        let mut tx = assigned(&store);
        let a = store.object_alloc(&mut tx, ObjectType::PlainFile, 512).unwrap();
        store.tx_commit(tx).unwrap();
        store.sync().unwrap();

        let mut tx = assigned(&store);
        let b = store.object_alloc(&mut tx, ObjectType::PlainFile, 512).unwrap();
        store.tx_commit(tx).unwrap();

        let image = store.crash_image();
        assert!(image.object_exists(a));
        assert!(!image.object_exists(b));
        assert_eq!(image.synced_txg(), store.synced_txg());

        let mut tx = assigned(&image);
        let c = image.object_alloc(&mut tx, ObjectType::PlainFile, 512).unwrap();
        assert!(c.as_u64() > b.as_u64());
        image.tx_abort(tx);
    }

    #[test]
    fn test_forced_restarts_then_assign() {
        let store = MemoryObjectStore::default();
        store.force_restarts(2);
        let mut tx = store.tx_create();
        assert_eq!(store.tx_assign(&mut tx, TxWait::NoWait).unwrap(), AssignOutcome::Restart);
        store.tx_abort(tx);
        let mut tx = store.tx_create();
        assert_eq!(store.tx_assign(&mut tx, TxWait::Waited).unwrap(), AssignOutcome::Restart);
        store.tx_abort(tx);
        let mut tx = store.tx_create();
        assert!(matches!(
            store.tx_assign(&mut tx, TxWait::Waited).unwrap(),
            AssignOutcome::Assigned(_)
        ));
        store.tx_commit(tx).unwrap();
        let stats = store.stats();
        assert_eq!(stats.restarts, 2);
        assert_eq!(stats.aborts, 2);
        assert_eq!(stats.commits, 1);
    }

    #[test]
    fn test_capacity_enforced_unless_netfree() {
        let store = MemoryObjectStore::new(MemoryStoreConfig {
            capacity_bytes: 1000,
            dirty_limit_bytes: 1 << 20,
        });
        let mut tx = store.tx_create();
        tx.hold_write(None, 0, 4096);
        assert_eq!(store.tx_assign(&mut tx, TxWait::NoWait), Err(StoreError::NoSpace));
        store.tx_abort(tx);

        let mut tx = store.tx_create();
        tx.hold_write(None, 0, 4096);
        tx.mark_netfree();
        assert!(store.tx_assign(&mut tx, TxWait::NoWait).is_ok());
        store.tx_commit(tx).unwrap();
    }

    #[test]
    fn test_congestion_restarts_nowait_only() {
        let store = MemoryObjectStore::new(MemoryStoreConfig {
            capacity_bytes: 1 << 30,
            dirty_limit_bytes: 1000,
        });
        let mut first = store.tx_create();
        first.hold_write(None, 0, 800);
        assert!(matches!(
            store.tx_assign(&mut first, TxWait::NoWait).unwrap(),
            AssignOutcome::Assigned(_)
        ));
        store.tx_commit(first).unwrap();

        let mut second = store.tx_create();
        second.hold_write(None, 0, 800);
        assert_eq!(store.tx_assign(&mut second, TxWait::NoWait).unwrap(), AssignOutcome::Restart);
        store.tx_wait(&second);
        store.tx_abort(second);

        let mut third = store.tx_create();
        third.hold_write(None, 0, 800);
        assert!(matches!(
            store.tx_assign(&mut third, TxWait::NoWait).unwrap(),
            AssignOutcome::Assigned(_)
        ));
        store.tx_commit(third).unwrap();
    }

    #[test]
    fn test_map_add_remove_and_cookies() {
        let store = MemoryObjectStore::default();
        let mut tx = assigned(&store);
        let dir = store.object_alloc(&mut tx, ObjectType::Directory, 512).unwrap();
        store.map_add(&mut tx, dir, b"a", 10).unwrap();
        store.map_add(&mut tx, dir, b"b", 11).unwrap();
        assert!(matches!(
            store.map_add(&mut tx, dir, b"a", 12),
            Err(StoreError::EntryExists(_))
        ));
        assert_eq!(store.map_lookup(dir, b"a", Some(&tx)).unwrap(), Some(10));
        store.tx_commit(tx).unwrap();

        let entries = store.map_list(dir, 0, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"a");
        let rest = store.map_list(dir, entries[0].cookie + 1, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, b"b");

        let mut tx = assigned(&store);
        store.map_remove(&mut tx, dir, b"a").unwrap();
        assert!(matches!(
            store.map_remove(&mut tx, dir, b"a"),
            Err(StoreError::EntryNotFound(_))
        ));
        store.tx_commit(tx).unwrap();
        assert_eq!(store.map_count(dir).unwrap(), 1);
    }

    #[test]
    fn test_attrs_lookup_overlays_tx() {
        let store = MemoryObjectStore::default();
        let mut tx = assigned(&store);
        let obj = store.object_alloc(&mut tx, ObjectType::PlainFile, 512).unwrap();
        store.attrs_update(&mut tx, obj, &[Attr::Size(1), Attr::Mode(0o644)]).unwrap();
        store.attrs_update(&mut tx, obj, &[Attr::Size(2)]).unwrap();
        let attrs = store.attrs_lookup(obj, Some(&tx)).unwrap();
        assert!(attrs.contains(&Attr::Size(2)));
        assert!(attrs.contains(&Attr::Mode(0o644)));
        assert!(store.attrs_lookup(obj, None).is_err());
        store.tx_commit(tx).unwrap();
        assert!(store.attrs_lookup(obj, None).unwrap().contains(&Attr::Size(2)));
    }

    #[test]
    fn test_injected_faults() {
        let store = MemoryObjectStore::default();
        store.inject_fault(FaultPoint::MapAdd, 1);
        let mut tx = assigned(&store);
        let dir = store.object_alloc(&mut tx, ObjectType::Directory, 512).unwrap();
        store.map_add(&mut tx, dir, b"one", 1).unwrap();
        assert_eq!(
            store.map_add(&mut tx, dir, b"two", 2),
            Err(StoreError::Injected("map_add"))
        );
        store.map_add(&mut tx, dir, b"three", 3).unwrap();
        store.tx_commit(tx).unwrap();

        store.inject_fault(FaultPoint::Read, 0);
        assert_eq!(store.read(dir, 0, 1), Err(StoreError::Checksum(dir)));
        assert!(store.read(dir, 0, 1).is_ok());
    }

    #[test]
    fn test_truncate_and_holes() {
        let store = MemoryObjectStore::default();
        let mut tx = assigned(&store);
        let obj = store.object_alloc(&mut tx, ObjectType::PlainFile, 512).unwrap();
        store.write(&mut tx, obj, 4, b"xy").unwrap();
        store.tx_commit(tx).unwrap();
        assert_eq!(store.read(obj, 0, 8).unwrap(), vec![0, 0, 0, 0, b'x', b'y', 0, 0]);

        let mut tx = assigned(&store);
        store.free_range(&mut tx, obj, 5).unwrap();
        store.tx_commit(tx).unwrap();
        assert_eq!(store.read(obj, 4, 2).unwrap(), vec![b'x', 0]);
    }

    #[test]
    fn test_claim_conflicts_with_existing() {
        let store = MemoryObjectStore::default();
        let mut tx = assigned(&store);
        assert_eq!(
            store.object_claim(&mut tx, ObjectId::MASTER, ObjectType::Map, 512),
            Err(StoreError::ObjectExists(ObjectId::MASTER))
        );
        store
            .object_claim(&mut tx, ObjectId::new(100), ObjectType::PlainFile, 512)
            .unwrap();
        let next = store.object_alloc(&mut tx, ObjectType::PlainFile, 512).unwrap();
        assert_eq!(next, ObjectId::new(101));
        store.tx_commit(tx).unwrap();
    }

    #[test]
    fn test_sparse_write_far_past_end() {
        let store = MemoryObjectStore::default();
        let mut tx = assigned(&store);
        let obj = store.object_alloc(&mut tx, ObjectType::PlainFile, 512).unwrap();
        store.write(&mut tx, obj, 1 << 46, b"x").unwrap();
        store.write(&mut tx, obj, CHUNK_SIZE - 2, b"abcd").unwrap();
        store.tx_commit(tx).unwrap();
        assert_eq!(store.used_bytes(), CHUNK_SIZE + 2 + 1);
        assert_eq!(store.read(obj, (1 << 46) - 1, 3).unwrap(), vec![0, b'x', 0]);
        assert_eq!(store.read(obj, CHUNK_SIZE - 3, 6).unwrap(), vec![0, b'a', b'b', b'c', b'd', 0]);

        let mut tx = assigned(&store);
        store.free_range(&mut tx, obj, CHUNK_SIZE).unwrap();
        store.tx_commit(tx).unwrap();
        assert_eq!(store.read(obj, CHUNK_SIZE - 2, 4).unwrap(), vec![b'a', b'b', 0, 0]);
        assert_eq!(store.read(obj, 1 << 46, 1).unwrap(), vec![0]);
        assert_eq!(store.used_bytes(), CHUNK_SIZE);
    }

    #[test]
    fn test_later_staged_attr_wins_regardless_of_commit_order() {
        let store = MemoryObjectStore::default();
        let mut tx = assigned(&store);
        let obj = store.object_alloc(&mut tx, ObjectType::Directory, 512).unwrap();
        store.attrs_update(&mut tx, obj, &[Attr::Size(2)]).unwrap();
        store.tx_commit(tx).unwrap();

        let mut first = assigned(&store);
        let mut second = assigned(&store);
        store.attrs_update(&mut first, obj, &[Attr::Size(3)]).unwrap();
        store.attrs_update(&mut second, obj, &[Attr::Size(4), Attr::Mode(0o700)]).unwrap();
        store.tx_commit(second).unwrap();
        store.tx_commit(first).unwrap();
        let attrs = store.attrs_lookup(obj, None).unwrap();
        assert!(attrs.contains(&Attr::Size(4)));
        assert!(attrs.contains(&Attr::Mode(0o700)));

        store.sync().unwrap();
        let image = store.crash_image();
        assert!(image.attrs_lookup(obj, None).unwrap().contains(&Attr::Size(4)));
        let mut tx = assigned(&image);
        image.attrs_update(&mut tx, obj, &[Attr::Size(5)]).unwrap();
        image.tx_commit(tx).unwrap();
        assert!(image.attrs_lookup(obj, None).unwrap().contains(&Attr::Size(5)));
    }
}
