//! Preallocated resource pool for the cache.
//!
//! Three bounded classes: entry blocks, parent back-link records, and
//! directory slot blocks. Entry and parent-link blocks are permits, since
//! ownership of the actual storage lives in the `Arc`-managed entries
//! themselves; directory slot blocks are real recycled boxes so a directory
//! heavy workload reuses its slot arrays instead of churning the allocator.
//! Exhaustion of any class is recoverable and reported to callers.

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use super::entry::DirData;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("preallocated {class} pool exhausted")]
pub struct PoolExhausted {
    pub class: &'static str,
}

struct PermitClass {
    free: Mutex<usize>,
    capacity: usize,
    name: &'static str,
}

impl PermitClass {
    fn new(capacity: usize, name: &'static str) -> Self {
        Self {
            free: Mutex::new(capacity),
            capacity,
            name,
        }
    }

    fn acquire(&self, n: usize) -> Result<(), PoolExhausted> {
        let mut free = self.free.lock();
        if *free < n {
            return Err(PoolExhausted { class: self.name });
        }
        *free -= n;
        Ok(())
    }

    fn release(&self, n: usize) {
        let mut free = self.free.lock();
        *free += n;
        if *free > self.capacity {
            warn!(class = self.name, "pool released more blocks than it owns");
            *free = self.capacity;
        }
    }

    fn free_count(&self) -> usize {
        *self.free.lock()
    }
}

struct DirBlockClass {
    free_list: Vec<Box<DirData>>,
    outstanding: usize,
}

/// The cache's preallocated pool.
pub struct EntryPool {
    entries: PermitClass,
    parent_links: PermitClass,
    dir_blocks: Mutex<DirBlockClass>,
    dir_capacity: usize,
}

impl EntryPool {
    pub fn new(entries: usize, parent_links: usize, dir_blocks: usize) -> Self {
        Self {
            entries: PermitClass::new(entries, "entry"),
            parent_links: PermitClass::new(parent_links, "parent-link"),
            dir_blocks: Mutex::new(DirBlockClass {
                free_list: Vec::new(),
                outstanding: 0,
            }),
            dir_capacity: dir_blocks,
        }
    }

    pub fn acquire_entry(&self) -> Result<(), PoolExhausted> {
        self.entries.acquire(1)
    }

    pub fn release_entry(&self) {
        self.entries.release(1);
    }

    pub fn acquire_parent_links(&self, n: usize) -> Result<(), PoolExhausted> {
        self.parent_links.acquire(n)
    }

    pub fn release_parent_links(&self, n: usize) {
        self.parent_links.release(n);
    }

    /// Take a directory slot block, recycling a previously released one when
    /// available.
    pub fn acquire_dir_block(&self) -> Result<Box<DirData>, PoolExhausted> {
        let mut class = self.dir_blocks.lock();
        if let Some(block) = class.free_list.pop() {
            return Ok(block);
        }
        if class.outstanding >= self.dir_capacity {
            return Err(PoolExhausted { class: "dir-block" });
        }
        class.outstanding += 1;
        Ok(Box::new(DirData::default()))
    }

    pub fn release_dir_block(&self, mut block: Box<DirData>) {
        block.reset();
        self.dir_blocks.lock().free_list.push(block);
    }

    pub fn free_entries(&self) -> usize {
        self.entries.free_count()
    }

    pub fn free_parent_links(&self) -> usize {
        self.parent_links.free_count()
    }

    pub fn free_dir_blocks(&self) -> usize {
        let class = self.dir_blocks.lock();
        self.dir_capacity - class.outstanding + class.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_exhaust_and_recover() {
        let pool = EntryPool::new(2, 4, 1);
        assert!(pool.acquire_entry().is_ok());
        assert!(pool.acquire_entry().is_ok());
        assert_eq!(pool.acquire_entry().unwrap_err().class, "entry");
        pool.release_entry();
        assert!(pool.acquire_entry().is_ok());
    }

    #[test]
    fn dir_blocks_are_recycled() {
        let pool = EntryPool::new(1, 1, 1);
        let block = pool.acquire_dir_block().unwrap();
        assert_eq!(pool.acquire_dir_block().unwrap_err().class, "dir-block");
        pool.release_dir_block(block);
        assert_eq!(pool.free_dir_blocks(), 1);
        let again = pool.acquire_dir_block().unwrap();
        assert!(again.slots.iter().all(|slot| !slot.active));
    }

    #[test]
    fn free_counts_track_acquisition() {
        let pool = EntryPool::new(3, 3, 3);
        pool.acquire_parent_links(2).unwrap();
        assert_eq!(pool.free_parent_links(), 1);
        pool.release_parent_links(2);
        assert_eq!(pool.free_parent_links(), 3);
        assert_eq!(pool.free_dir_blocks(), 3);
    }
}
