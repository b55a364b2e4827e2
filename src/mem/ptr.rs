//! Typed owning pointers into task memory.
//!
//! A `Pointer<T>` owns an allocation in some mapping, knows how to
//! serialize a `T` into it, and holds the transport that can reach its
//! address space. Operations that invalidate a pointer take it by
//! value and hand back its successors, so a consumed pointer cannot be
//! named again; this is what lets `write` upgrade the type to
//! [`WrittenPointer`] and lets `split` hand out two halves without any
//! aliasing.

use crate::error::{Error, Result};
use crate::near::{Address, AddressSpace};
use crate::serialize::Wire;
use crate::task::Task;
use std::marker::PhantomData;
use std::sync::Arc;

use super::allocator::Allocation;
use super::transport::MemoryTransport;

/// The raw, non-owning description of a pointer's range, lent to a
/// transport for the duration of one operation.
#[derive(Clone, Debug)]
pub struct PtrSpan {
    pub arena: u64,
    pub space: AddressSpace,
    pub addr: Address,
    pub len: usize,
}

impl PtrSpan {
    pub fn end(&self) -> Address {
        self.addr.add(self.len)
    }

    /// Contiguous in the same mapping.
    pub fn adjoins(&self, next: &PtrSpan) -> bool {
        self.arena == next.arena && self.end() == next.addr
    }
}

/// An owning, typed handle for a subrange of a mapping.
pub struct Pointer<T: Wire> {
    alloc: Allocation,
    transport: Arc<dyn MemoryTransport>,
    _ty: PhantomData<fn() -> T>,
}

impl<T: Wire> Pointer<T> {
    pub(crate) fn from_alloc(alloc: Allocation, transport: Arc<dyn MemoryTransport>) -> Pointer<T> {
        Pointer {
            alloc,
            transport,
            _ty: PhantomData,
        }
    }

    /// The size of the underlying allocation in bytes. Syscalls that
    /// take this pointer operate on the full size; use
    /// [`split`](Self::split) to shrink the window first.
    pub fn size(&self) -> usize {
        self.alloc.size()
    }

    /// The raw address, for handing to the kernel.
    pub fn near(&self) -> Address {
        self.alloc.addr()
    }

    pub fn address_space(&self) -> &AddressSpace {
        self.alloc.address_space()
    }

    pub fn span(&self) -> PtrSpan {
        PtrSpan {
            arena: self.alloc.arena_id(),
            space: self.alloc.address_space().clone(),
            addr: self.alloc.addr(),
            len: self.alloc.size(),
        }
    }

    /// Pin this pointer for a syscall on `task`, yielding its address.
    /// The guard borrows the pointer, so it cannot be freed, split, or
    /// overwritten until the syscall using the address is done.
    pub fn borrow<'a>(&'a self, task: &Task) -> Result<PtrGuard<'a>> {
        if *self.alloc.address_space() != task.address_space {
            return Err(Error::AddressSpaceMismatch {
                ours: self.alloc.address_space().clone(),
                theirs: task.address_space.clone(),
            });
        }
        Ok(PtrGuard {
            addr: self.alloc.addr(),
            _pin: PhantomData,
        })
    }

    /// Serialize `value` into this memory, consuming the pointer and
    /// returning it upgraded with the value attached.
    pub async fn write(self, value: T) -> Result<WrittenPointer<T>> {
        let mut bytes = Vec::new();
        value.to_bytes(&mut bytes);
        if bytes.len() > self.size() {
            return Err(Error::invariant(format!(
                "value of {} bytes does not fit pointer of {} bytes",
                bytes.len(),
                self.size()
            )));
        }
        let mut span = self.span();
        span.len = bytes.len();
        self.transport.write(span, bytes).await?;
        Ok(WrittenPointer { ptr: self, value })
    }

    /// Read the value this pointer refers to.
    pub async fn read(&self) -> Result<T> {
        let data = self.transport.read(self.span()).await?;
        T::from_bytes(&data)
    }

    /// Split into two adjacent pointers at byte `at`, consuming this
    /// one. `at` of zero or of the full size yields an empty side.
    pub fn split(self, at: usize) -> Result<(Pointer<T>, Pointer<T>)> {
        let transport = self.transport.clone();
        let (left, right) = self.alloc.split(at)?;
        Ok((
            Pointer::from_alloc(left, transport.clone()),
            Pointer::from_alloc(right, transport),
        ))
    }

    /// Reassemble a pointer split by [`split`](Self::split); `other`
    /// must be immediately after `self` in the same mapping. Both are
    /// consumed.
    pub fn merge(self, other: Pointer<T>) -> Result<Pointer<T>> {
        let transport = self.transport.clone();
        let merged = self.alloc.merge(other.alloc)?;
        Ok(Pointer::from_alloc(merged, transport))
    }

    /// View the same memory as a different type, consuming this
    /// pointer.
    pub fn reinterpret<U: Wire>(self) -> Pointer<U> {
        Pointer {
            alloc: self.alloc,
            transport: self.transport,
            _ty: PhantomData,
        }
    }

    /// Release the allocation now instead of on drop.
    pub fn free(self) {}

    /// Upgrade without performing the write; the caller asserts the
    /// bytes are (or are about to be) in place. Batch commit uses
    /// this, queuing the actual write for one fused operation.
    pub(crate) fn assume_written(self, value: T) -> WrittenPointer<T> {
        WrittenPointer { ptr: self, value }
    }
}

impl<T: Wire> std::fmt::Debug for Pointer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Pointer({}, {} bytes, {})",
            self.near(),
            self.size(),
            std::any::type_name::<T>()
        )
    }
}

/// The pinned address of a borrowed pointer.
pub struct PtrGuard<'a> {
    addr: Address,
    _pin: PhantomData<&'a ()>,
}

impl<'a> PtrGuard<'a> {
    pub fn addr(&self) -> Address {
        self.addr
    }
}

/// A pointer with a known value written to it.
///
/// Everything that mutates the memory goes through operations that
/// consume the pointer, so as long as a `WrittenPointer` is live its
/// value matches the bytes in the task.
pub struct WrittenPointer<T: Wire> {
    ptr: Pointer<T>,
    value: T,
}

impl<T: Wire> WrittenPointer<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Degrade to a plain pointer, forgetting the value. Needed before
    /// linear operations like split, which overwrite or repartition
    /// the memory.
    pub fn into_pointer(self) -> Pointer<T> {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.ptr.size()
    }

    pub fn near(&self) -> Address {
        self.ptr.near()
    }

    pub fn span(&self) -> PtrSpan {
        self.ptr.span()
    }

    pub fn borrow<'a>(&'a self, task: &Task) -> Result<PtrGuard<'a>> {
        self.ptr.borrow(task)
    }

    pub async fn read(&self) -> Result<T> {
        self.ptr.read().await
    }
}

impl<T: Wire> std::fmt::Debug for WrittenPointer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Written{:?}", self.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::ram::testing::mock_ram;
    use crate::serialize::{Bytes, Int32, Int64};

    #[tokio::test]
    async fn write_read_round_trip() {
        let ram = mock_ram();
        let p = ram.malloc::<Int64>().await.unwrap();
        let w = p.write(Int64(-77)).await.unwrap();
        assert_eq!(w.read().await.unwrap(), Int64(-77));
        assert_eq!(w.value(), &Int64(-77));
    }

    #[tokio::test]
    async fn split_preserves_contents() {
        let ram = mock_ram();
        let p = ram.malloc_sized::<Bytes>(8).await.unwrap();
        let w = p.write(Bytes(b"abcdefgh".to_vec())).await.unwrap();
        let (l, r) = w.into_pointer().split(3).unwrap();
        assert_eq!(l.read().await.unwrap(), Bytes(b"abc".to_vec()));
        assert_eq!(r.read().await.unwrap(), Bytes(b"defgh".to_vec()));
        let back = l.merge(r).unwrap();
        assert_eq!(back.read().await.unwrap(), Bytes(b"abcdefgh".to_vec()));
    }

    #[tokio::test]
    async fn split_at_zero_gives_empty_left() {
        let ram = mock_ram();
        let p = ram.malloc_sized::<Bytes>(4).await.unwrap();
        let (l, r) = p.split(0).unwrap();
        assert_eq!(l.size(), 0);
        assert_eq!(r.size(), 4);
    }

    #[tokio::test]
    async fn oversized_write_is_rejected() {
        let ram = mock_ram();
        let p = ram.malloc_sized::<Bytes>(2).await.unwrap();
        match p.write(Bytes(b"abc".to_vec())).await {
            Err(Error::Invariant(_)) => {}
            other => panic!("expected invariant error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn reinterpret_changes_the_type() {
        let ram = mock_ram();
        let p = ram.malloc_sized::<Bytes>(4).await.unwrap();
        let w = p.write(Bytes(vec![1, 0, 0, 0])).await.unwrap();
        let q: Pointer<Int32> = w.into_pointer().reinterpret();
        assert_eq!(q.read().await.unwrap(), Int32(1));
    }

    #[tokio::test]
    async fn borrow_checks_the_address_space() {
        let ram = mock_ram();
        let other = crate::task::testing::mock_task();
        let p = ram.malloc::<Int32>().await.unwrap();
        assert!(p.borrow(&ram.task).is_ok());
        match p.borrow(&other) {
            Err(Error::AddressSpaceMismatch { .. }) => {}
            other => panic!("expected mismatch, got {:?}", other.map(|_| ())),
        }
    }
}
