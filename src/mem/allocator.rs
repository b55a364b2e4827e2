//! Per-address-space allocation of task memory.
//!
//! The allocator owns a list of anonymous private mappings (arenas)
//! and hands out non-overlapping subranges of them. Tasks sharing an
//! address space share the arenas through thin per-task clients; the
//! client only contributes the task whose syscalls map new arenas.

use crate::error::{Error, Result};
use crate::near::{Address, AddressSpace, MemRegion, Sysno};
use crate::task::TaskRef;
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

lazy_static! {
    pub static ref PAGE_SIZE: usize =
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

const MIN_ARENA: usize = 1 << 20;

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// One anonymous mapping plus the bookkeeping of its live ranges.
pub struct Arena {
    id: u64,
    space: AddressSpace,
    region: MemRegion,
    // Kept so the mapping is owned somewhere; freed with the arena.
    _mapping: Option<super::mapping::OwnedMapping>,
    used: Mutex<BTreeMap<usize, usize>>, // offset -> len, disjoint
}

impl Arena {
    fn next_id() -> u64 {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    fn new(space: AddressSpace, mapping: super::mapping::OwnedMapping) -> Arc<Arena> {
        Arc::new(Arena {
            id: Arena::next_id(),
            space,
            region: mapping.region(),
            _mapping: Some(mapping),
            used: Mutex::new(BTreeMap::new()),
        })
    }

    /// An arena with no kernel mapping behind it. Allocations from it
    /// are placeholders that must never reach a transport; batch
    /// measurement uses them.
    pub(crate) fn detached(space: AddressSpace) -> Arc<Arena> {
        Arc::new(Arena {
            id: Arena::next_id(),
            space,
            region: MemRegion {
                addr: Address(0x1000),
                len: usize::MAX / 2,
                page_size: *PAGE_SIZE,
            },
            _mapping: None,
            used: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn region(&self) -> MemRegion {
        self.region
    }

    /// First-fit scan of the gaps between live ranges.
    fn try_alloc(&self, size: usize, align: usize) -> Option<usize> {
        let mut used = self.used.lock().unwrap();
        let mut candidate = 0usize;
        for (&off, &len) in used.iter() {
            if align_up(candidate, align) + size <= off {
                break;
            }
            candidate = off + len;
        }
        let candidate = align_up(candidate, align);
        if candidate + size > self.region.len {
            return None;
        }
        used.insert(candidate, size);
        Some(candidate)
    }

    fn free(&self, offset: usize, size: usize) {
        let mut used = self.used.lock().unwrap();
        let removed = used.remove(&offset);
        debug_assert_eq!(removed, Some(size));
    }

    fn split_entry(&self, offset: usize, size: usize, at: usize) {
        let mut used = self.used.lock().unwrap();
        let removed = used.remove(&offset);
        debug_assert_eq!(removed, Some(size));
        if at > 0 {
            used.insert(offset, at);
        }
        if size - at > 0 {
            used.insert(offset + at, size - at);
        }
    }

    fn merge_entries(&self, a_off: usize, a_size: usize, b_off: usize, b_size: usize) {
        let mut used = self.used.lock().unwrap();
        if a_size > 0 {
            used.remove(&a_off);
        }
        if b_size > 0 {
            used.remove(&b_off);
        }
        if a_size + b_size > 0 {
            used.insert(a_off, a_size + b_size);
        }
    }
}

/// Owns one subrange of one arena. Linear: split and merge consume.
pub struct Allocation {
    arena: Arc<Arena>,
    offset: usize,
    size: usize,
    owned: bool,
}

impl Allocation {
    pub(crate) fn new(arena: Arc<Arena>, offset: usize, size: usize, owned: bool) -> Allocation {
        Allocation {
            arena,
            offset,
            size,
            owned,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn addr(&self) -> Address {
        self.arena.region.addr.add(self.offset)
    }

    pub fn arena_id(&self) -> u64 {
        self.arena.id
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.arena.space
    }

    /// True when this allocation has a real mapping behind it;
    /// placeholders from batch measurement do not.
    pub fn is_backed(&self) -> bool {
        self.arena._mapping.is_some()
    }

    /// Split into two adjacent allocations at `at`. Either side may be
    /// empty.
    pub fn split(mut self, at: usize) -> Result<(Allocation, Allocation)> {
        if at > self.size {
            return Err(Error::invariant(format!(
                "split at {} beyond allocation of {} bytes",
                at, self.size
            )));
        }
        let (arena, offset, size, owned) =
            (self.arena.clone(), self.offset, self.size, self.owned);
        self.owned = false; // children take over the range
        if owned {
            arena.split_entry(offset, size, at);
        }
        let left = Allocation::new(arena.clone(), offset, at, owned && at > 0);
        let right = Allocation::new(arena, offset + at, size - at, owned && size - at > 0);
        Ok((left, right))
    }

    /// Merge with the allocation immediately after this one.
    pub fn merge(mut self, mut other: Allocation) -> Result<Allocation> {
        if self.arena.id != other.arena.id {
            return Err(Error::invariant(
                "can't merge allocations from different mappings",
            ));
        }
        if self.offset + self.size != other.offset {
            return Err(Error::invariant(format!(
                "allocations are not adjacent: [{}, {}) and [{}, {})",
                self.offset,
                self.offset + self.size,
                other.offset,
                other.offset + other.size
            )));
        }
        let arena = self.arena.clone();
        let tracked = self.owned || other.owned;
        if tracked {
            arena.merge_entries(
                self.offset,
                if self.owned { self.size } else { 0 },
                other.offset,
                if other.owned { other.size } else { 0 },
            );
        }
        let merged = Allocation::new(arena, self.offset, self.size + other.size, tracked);
        self.owned = false;
        other.owned = false;
        Ok(merged)
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if self.owned && self.size > 0 {
            self.arena.free(self.offset, self.size);
        }
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Allocation(arena {}, [{}, {}))",
            self.arena.id,
            self.addr(),
            self.addr().add(self.size)
        )
    }
}

struct AllocatorShared {
    space: AddressSpace,
    arenas: Mutex<Vec<Arc<Arena>>>,
}

/// The per-address-space arena set.
#[derive(Clone)]
pub struct Allocator {
    shared: Arc<AllocatorShared>,
}

impl Allocator {
    pub fn new(space: AddressSpace) -> Allocator {
        Allocator {
            shared: Arc::new(AllocatorShared {
                space,
                arenas: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A client that allocates from these arenas, mapping new ones
    /// through `task` when they run out.
    pub fn client(&self, task: TaskRef) -> Result<AllocatorClient> {
        if task.address_space != self.shared.space {
            return Err(Error::AddressSpaceMismatch {
                ours: self.shared.space.clone(),
                theirs: task.address_space.clone(),
            });
        }
        Ok(AllocatorClient {
            shared: self.shared.clone(),
            task,
        })
    }
}

/// A thin per-task view of a shared [`Allocator`].
#[derive(Clone)]
pub struct AllocatorClient {
    shared: Arc<AllocatorShared>,
    task: TaskRef,
}

impl AllocatorClient {
    pub fn address_space(&self) -> &AddressSpace {
        &self.shared.space
    }

    /// Reuse the same arenas from another task sharing the address
    /// space.
    pub fn inherit(&self, task: &TaskRef) -> Result<AllocatorClient> {
        if task.address_space != self.shared.space {
            return Err(Error::AddressSpaceMismatch {
                ours: self.shared.space.clone(),
                theirs: task.address_space.clone(),
            });
        }
        Ok(AllocatorClient {
            shared: self.shared.clone(),
            task: task.clone(),
        })
    }

    pub async fn alloc(&self, size: usize, align: usize) -> Result<Allocation> {
        let align = align.max(1);
        {
            let arenas = self.shared.arenas.lock().unwrap().clone();
            for arena in arenas {
                if let Some(offset) = arena.try_alloc(size, align) {
                    return Ok(Allocation::new(arena, offset, size, size > 0));
                }
            }
        }
        let arena = self.grow(size).await?;
        let offset = arena
            .try_alloc(size, align)
            .ok_or_else(|| Error::invariant("fresh arena cannot satisfy allocation"))?;
        Ok(Allocation::new(arena, offset, size, size > 0))
    }

    async fn grow(&self, at_least: usize) -> Result<Arc<Arena>> {
        let len = align_up(at_least.max(MIN_ARENA), *PAGE_SIZE);
        let ret = self
            .task
            .sysif
            .syscall(
                Sysno(libc::SYS_mmap as i64),
                [
                    0,
                    len as i64,
                    (libc::PROT_READ | libc::PROT_WRITE) as i64,
                    (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as i64,
                    -1,
                    0,
                ],
            )
            .await?;
        let region = MemRegion {
            addr: Address(ret as u64),
            len,
            page_size: *PAGE_SIZE,
        };
        let mapping = super::mapping::OwnedMapping::new(self.task.clone(), region);
        let arena = Arena::new(self.shared.space.clone(), mapping);
        self.shared.arenas.lock().unwrap().push(arena.clone());
        Ok(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::mock_task;

    fn test_client() -> AllocatorClient {
        let task = mock_task();
        let allocator = Allocator::new(task.address_space.clone());
        allocator.client(task).unwrap()
    }

    #[tokio::test]
    async fn allocations_do_not_overlap() {
        let client = test_client();
        let a = client.alloc(100, 8).await.unwrap();
        let b = client.alloc(100, 8).await.unwrap();
        let (a0, a1) = (a.addr().0, a.addr().0 + 100);
        let (b0, b1) = (b.addr().0, b.addr().0 + 100);
        assert!(a1 <= b0 || b1 <= a0);
    }

    #[tokio::test]
    async fn freed_ranges_are_reused() {
        let client = test_client();
        let a = client.alloc(64, 8).await.unwrap();
        let addr = a.addr();
        drop(a);
        let b = client.alloc(64, 8).await.unwrap();
        assert_eq!(b.addr(), addr);
    }

    #[tokio::test]
    async fn split_then_merge_restores_bounds() {
        let client = test_client();
        let a = client.alloc(16, 8).await.unwrap();
        let (addr, size) = (a.addr(), a.size());
        let (l, r) = a.split(6).unwrap();
        assert_eq!(l.addr(), addr);
        assert_eq!(l.size(), 6);
        assert_eq!(r.addr(), addr.add(6));
        assert_eq!(r.size(), 10);
        let back = l.merge(r).unwrap();
        assert_eq!(back.addr(), addr);
        assert_eq!(back.size(), size);
    }

    #[tokio::test]
    async fn split_at_zero_and_end() {
        let client = test_client();
        let a = client.alloc(8, 8).await.unwrap();
        let (l, r) = a.split(0).unwrap();
        assert_eq!(l.size(), 0);
        assert_eq!(r.size(), 8);
        let (l2, r2) = r.split(8).unwrap();
        assert_eq!(l2.size(), 8);
        assert_eq!(r2.size(), 0);
    }

    #[tokio::test]
    async fn merge_rejects_non_adjacent() {
        let client = test_client();
        let a = client.alloc(32, 8).await.unwrap();
        let (l, r) = a.split(16).unwrap();
        let (l0, l1) = l.split(4).unwrap();
        drop(l1);
        match l0.merge(r) {
            Err(Error::Invariant(_)) => {}
            other => panic!("expected invariant error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn client_requires_matching_space() {
        let task = mock_task();
        let other = mock_task();
        let allocator = Allocator::new(task.address_space.clone());
        assert!(allocator.client(task).is_ok());
        match allocator.client(other) {
            Err(Error::AddressSpaceMismatch { .. }) => {}
            other => panic!("expected mismatch, got {:?}", other.map(|_| ())),
        }
    }
}
