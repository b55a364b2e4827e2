//! The RAM facade: one task's view of allocatable, transportable
//! memory.
//!
//! `Ram` bundles the task, its address space's allocator, and the
//! transport that reaches that space, which is everything needed to
//! turn a value into a pointer the kernel can use.

use crate::error::{Error, Result};
use crate::serialize::{Bytes, FixedWire, Wire};
use crate::task::TaskRef;
use std::sync::Arc;

use super::allocator::{Allocation, AllocatorClient, Arena};
use super::ptr::{Pointer, PtrSpan, WrittenPointer};
use super::transport::MemoryTransport;

fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

#[derive(Clone)]
pub struct Ram {
    pub task: TaskRef,
    pub transport: Arc<dyn MemoryTransport>,
    pub allocator: AllocatorClient,
}

impl Ram {
    pub fn new(
        task: TaskRef,
        transport: Arc<dyn MemoryTransport>,
        allocator: AllocatorClient,
    ) -> Ram {
        Ram {
            task,
            transport,
            allocator,
        }
    }

    /// The same arenas and transport, viewed from another task in the
    /// same address space.
    pub fn inherit(&self, task: &TaskRef) -> Result<Ram> {
        Ok(Ram {
            task: task.clone(),
            transport: self.transport.clone(),
            allocator: self.allocator.inherit(task)?,
        })
    }

    /// Allocate room for one fixed-size value.
    pub async fn malloc<T: FixedWire>(&self) -> Result<Pointer<T>> {
        self.malloc_sized::<T>(T::SIZE).await
    }

    /// Allocate `size` bytes viewed as `T`.
    pub async fn malloc_sized<T: Wire>(&self, size: usize) -> Result<Pointer<T>> {
        let alloc = self.allocator.alloc(size, 8).await?;
        Ok(Pointer::from_alloc(alloc, self.transport.clone()))
    }

    pub async fn malloc_bytes(&self, size: usize) -> Result<Pointer<Bytes>> {
        self.malloc_sized::<Bytes>(size).await
    }

    /// Allocate, serialize, and write in one step.
    pub async fn ptr<T: Wire>(&self, value: T) -> Result<WrittenPointer<T>> {
        let mut bytes = Vec::new();
        value.to_bytes(&mut bytes);
        let p = self.malloc_sized::<T>(bytes.len()).await?;
        p.write(value).await
    }

    /// Run `f`, coalescing every allocation and write it performs into
    /// one allocation pass and one batched write.
    ///
    /// `f` runs twice: once against placeholders to size the
    /// reservation, once for real. It must therefore be deterministic
    /// and free of side effects beyond the pointers it creates.
    pub async fn batch<R, F>(&self, f: F) -> Result<R>
    where
        F: Fn(&mut Batch) -> Result<R>,
    {
        let mut measure = Batch::measure(self);
        f(&mut measure)?;
        let total = match measure.mode {
            BatchMode::Measure { total } => total.max(8),
            _ => unreachable!(),
        };
        let block = self.allocator.alloc(total, 8).await?;
        let mut commit = Batch::commit(self, block);
        let out = f(&mut commit)?;
        let writes = commit.finish();
        if !writes.is_empty() {
            self.transport.batch_write(writes).await?;
        }
        Ok(out)
    }
}

enum BatchMode {
    /// First pass: record sizes, hand out placeholder pointers.
    Measure { total: usize },
    /// Second pass: carve real pointers out of the reserved block and
    /// queue their writes.
    Commit {
        block: Option<Allocation>,
        writes: Vec<(PtrSpan, Vec<u8>)>,
    },
}

/// The per-call view handed to the closure of [`Ram::batch`].
pub struct Batch<'a> {
    ram: &'a Ram,
    mode: BatchMode,
    scratch: Option<Arc<Arena>>,
    cursor: usize,
}

impl<'a> Batch<'a> {
    fn measure(ram: &'a Ram) -> Batch<'a> {
        Batch {
            ram,
            mode: BatchMode::Measure { total: 0 },
            scratch: None,
            cursor: 0,
        }
    }

    fn commit(ram: &'a Ram, block: Allocation) -> Batch<'a> {
        Batch {
            ram,
            mode: BatchMode::Commit {
                block: Some(block),
                writes: Vec::new(),
            },
            scratch: None,
            cursor: 0,
        }
    }

    fn take_alloc(&mut self, padded: usize) -> Result<Allocation> {
        match &mut self.mode {
            BatchMode::Measure { total } => {
                *total += padded;
                // Placeholder allocation; it must never reach the
                // transport, and the measuring pass discards it.
                let arena = self
                    .scratch
                    .get_or_insert_with(|| {
                        Arena::detached(self.ram.allocator.address_space().clone())
                    })
                    .clone();
                let alloc = Allocation::new(arena, self.cursor, padded, false);
                self.cursor += padded;
                Ok(alloc)
            }
            BatchMode::Commit { block, .. } => {
                let whole = block
                    .take()
                    .ok_or_else(|| Error::invariant("batch closure allocated more on commit"))?;
                if padded > whole.size() {
                    return Err(Error::invariant(
                        "batch closure allocated more on commit than on measure",
                    ));
                }
                let (alloc, rest) = whole.split(padded)?;
                *block = Some(rest);
                Ok(alloc)
            }
        }
    }

    /// Allocate and write one value.
    pub fn ptr<T: Wire + Clone>(&mut self, value: &T) -> Result<WrittenPointer<T>> {
        let mut bytes = Vec::new();
        value.to_bytes(&mut bytes);
        // Pad the payload to the allocation granularity so the spans
        // of consecutive batch writes stay contiguous and fuse into a
        // single transport operation.
        let padded = pad8(bytes.len().max(1));
        bytes.resize(padded, 0);
        let alloc = self.take_alloc(padded)?;
        let ptr: Pointer<T> = Pointer::from_alloc(alloc, self.ram.transport.clone());
        if let BatchMode::Commit { writes, .. } = &mut self.mode {
            let mut span = ptr.span();
            span.len = bytes.len();
            writes.push((span, bytes));
        }
        Ok(ptr.assume_written(value.clone()))
    }

    /// Allocate `size` bytes viewed as `T`, without writing.
    pub fn malloc_sized<T: Wire>(&mut self, size: usize) -> Result<Pointer<T>> {
        let alloc = self.take_alloc(pad8(size.max(1)))?;
        let (alloc, _spill) = alloc.split(size)?;
        Ok(Pointer::from_alloc(alloc, self.ram.transport.clone()))
    }

    fn finish(self) -> Vec<(PtrSpan, Vec<u8>)> {
        match self.mode {
            BatchMode::Commit { writes, .. } => writes,
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::mem::allocator::Allocator;
    use crate::mem::transport::testing::MapTransport;
    use crate::task::testing::mock_task;

    /// A RAM over a mock task and a map-backed fake address space.
    pub fn mock_ram() -> Ram {
        let task = mock_task();
        let allocator = Allocator::new(task.address_space.clone());
        let client = allocator.client(task.clone()).unwrap();
        let transport = Arc::new(MapTransport::new(task.address_space.clone()));
        Ram::new(task, transport, client)
    }

    pub fn mock_ram_counting() -> (Ram, Arc<MapTransport>) {
        let task = mock_task();
        let allocator = Allocator::new(task.address_space.clone());
        let client = allocator.client(task.clone()).unwrap();
        let transport = Arc::new(MapTransport::new(task.address_space.clone()));
        (Ram::new(task, transport.clone(), client), transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{Arg, Int64};
    use testing::{mock_ram, mock_ram_counting};

    #[tokio::test]
    async fn ptr_allocates_exactly_and_round_trips() {
        let ram = mock_ram();
        let w = ram.ptr(Arg::new("hello")).await.unwrap();
        assert_eq!(w.size(), 6); // five bytes and the NUL
        assert_eq!(w.read().await.unwrap(), Arg::new("hello"));
    }

    #[tokio::test]
    async fn batch_coalesces_into_one_write() {
        let (ram, transport) = mock_ram_counting();
        let (a, b) = ram
            .batch(|b| {
                let x = b.ptr(&Int64(1))?;
                let y = b.ptr(&Int64(2))?;
                Ok((x, y))
            })
            .await
            .unwrap();
        assert_eq!(transport.write_ops.lock().unwrap().len(), 1);
        assert_eq!(a.read().await.unwrap(), Int64(1));
        assert_eq!(b.read().await.unwrap(), Int64(2));
        assert_eq!(b.near().0 - a.near().0, 8);
    }

    #[tokio::test]
    async fn batch_returns_closure_value() {
        let ram = mock_ram();
        let n = ram
            .batch(|b| {
                b.ptr(&Int64(3))?;
                Ok(17)
            })
            .await
            .unwrap();
        assert_eq!(n, 17);
    }

    #[tokio::test]
    async fn malloc_respects_requested_view_size() {
        let ram = mock_ram();
        let p = ram.malloc_bytes(13).await.unwrap();
        assert_eq!(p.size(), 13);
    }
}
