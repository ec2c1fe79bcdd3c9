//! Mapped-page cache collaborator.
//!
//! When a file is memory-mapped, reads go through the cached pages and writes
//! update any page already resident, so mapped readers and the read path agree.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::types::ObjectId;

pub const PAGE_SIZE: u64 = 4096;

/// Loads `len` bytes at `offset` from the backing store.
pub type PageFill<'a> = dyn FnMut(u64, usize) -> Result<Vec<u8>> + 'a;

pub trait PageCache: Send + Sync {
    fn is_mapped(&self, object: ObjectId) -> bool;

    /// Reads `len` bytes at `offset`, filling non-resident pages with `fill`.
    fn read_through_cache(&self, object: ObjectId, offset: u64, len: usize, fill: &mut PageFill<'_>)
        -> Result<Vec<u8>>;

    /// Copies freshly written bytes into resident pages.
    fn write_through_cache(&self, object: ObjectId, offset: u64, data: &[u8]);

    /// Drops pages past `size` and zeroes the tail of the last page.
    fn set_size(&self, object: ObjectId, size: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoPageCache;

impl PageCache for NoPageCache {
    fn is_mapped(&self, _object: ObjectId) -> bool {
        false
    }

    fn read_through_cache(
        &self,
        _object: ObjectId,
        offset: u64,
        len: usize,
        fill: &mut PageFill<'_>,
    ) -> Result<Vec<u8>> {
        fill(offset, len)
    }

    fn write_through_cache(&self, _object: ObjectId, _offset: u64, _data: &[u8]) {}

    fn set_size(&self, _object: ObjectId, _size: u64) {}
}

#[derive(Default)]
struct MappedFile {
    pages: BTreeMap<u64, Vec<u8>>,
}

/// Page cache holding whole pages in memory for objects explicitly mapped.
#[derive(Default)]
pub struct MemoryPageCache {
    files: DashMap<ObjectId, MappedFile>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryPageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, object: ObjectId) {
        self.files.entry(object).or_default();
    }

    pub fn unmap(&self, object: ObjectId) {
        self.files.remove(&object);
    }

    /// Returns the resident copy of one page, if any.
    pub fn resident_page(&self, object: ObjectId, index: u64) -> Option<Vec<u8>> {
        self.files.get(&object)?.pages.get(&index).cloned()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl PageCache for MemoryPageCache {
    fn is_mapped(&self, object: ObjectId) -> bool {
        self.files.contains_key(&object)
    }

    fn read_through_cache(
        &self,
        object: ObjectId,
        offset: u64,
        len: usize,
        fill: &mut PageFill<'_>,
    ) -> Result<Vec<u8>> {
        let Some(mut file) = self.files.get_mut(&object) else {
            return fill(offset, len);
        };
        let end = offset + len as u64;
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while pos < end {
            let index = pos / PAGE_SIZE;
            if file.pages.contains_key(&index) {
                self.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let loaded = fill(index * PAGE_SIZE, PAGE_SIZE as usize)?;
                file.pages.insert(index, loaded);
            }
            let page = &file.pages[&index];
            let in_page = (pos % PAGE_SIZE) as usize;
            let take = ((PAGE_SIZE - pos % PAGE_SIZE).min(end - pos)) as usize;
            out.extend_from_slice(&page[in_page..in_page + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    fn write_through_cache(&self, object: ObjectId, offset: u64, data: &[u8]) {
        let Some(mut file) = self.files.get_mut(&object) else {
            return;
        };
        let end = offset + data.len() as u64;
        let mut pos = offset;
        while pos < end {
            let index = pos / PAGE_SIZE;
            let in_page = (pos % PAGE_SIZE) as usize;
            let take = ((PAGE_SIZE - pos % PAGE_SIZE).min(end - pos)) as usize;
            if let Some(page) = file.pages.get_mut(&index) {
                let src = (pos - offset) as usize;
                page[in_page..in_page + take].copy_from_slice(&data[src..src + take]);
            }
            pos += take as u64;
        }
    }

    fn set_size(&self, object: ObjectId, size: u64) {
        let Some(mut file) = self.files.get_mut(&object) else {
            return;
        };
        let last = size / PAGE_SIZE;
        let tail = (size % PAGE_SIZE) as usize;
        file.pages.retain(|index, _| *index < last || (*index == last && tail > 0));
        if tail > 0 {
            if let Some(page) = file.pages.get_mut(&last) {
                page[tail..].fill(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(data: &[u8]) -> impl FnMut(u64, usize) -> Result<Vec<u8>> + '_ {
        move |off, len| {
            let mut out = vec![0u8; len];
            let start = (off as usize).min(data.len());
            let end = (start + len).min(data.len());
            out[..end - start].copy_from_slice(&data[start..end]);
            Ok(out)
        }
    }

    #[test]
    fn test_unmapped_reads_straight_through() {
        let cache = MemoryPageCache::new();
        let data = b"hello world".to_vec();
        let mut fill = backing(&data);
        let out = cache.read_through_cache(ObjectId::new(9), 6, 5, &mut fill).unwrap();
        assert_eq!(out, b"world");
        assert_eq!(cache.misses(), 0);
    }

    #[test]
    fn test_mapped_pages_are_cached_and_updated() {
        let cache = MemoryPageCache::new();
        let obj = ObjectId::new(9);
        cache.map(obj);
        let data = vec![7u8; 3 * PAGE_SIZE as usize];
        let mut fill = backing(&data);
        let out = cache
            .read_through_cache(obj, PAGE_SIZE - 2, 4, &mut fill)
            .unwrap();
        assert_eq!(out, vec![7, 7, 7, 7]);
        assert_eq!(cache.misses(), 2);

        cache.write_through_cache(obj, PAGE_SIZE - 1, &[1, 2]);
        let out = cache
            .read_through_cache(obj, PAGE_SIZE - 2, 4, &mut fill)
            .unwrap();
        assert_eq!(out, vec![7, 1, 2, 7]);
        assert_eq!(cache.hits(), 2);
    }

    #[test]
    fn test_set_size_drops_and_zeroes() {
        let cache = MemoryPageCache::new();
        let obj = ObjectId::new(9);
        cache.map(obj);
        let data = vec![5u8; 2 * PAGE_SIZE as usize];
        let mut fill = backing(&data);
        cache
            .read_through_cache(obj, 0, 2 * PAGE_SIZE as usize, &mut fill)
            .unwrap();
        cache.set_size(obj, 10);
        let page = cache.resident_page(obj, 0).unwrap();
        assert_eq!(page[9], 5);
        assert_eq!(page[10], 0);
        assert!(cache.resident_page(obj, 1).is_none());
    }
}
