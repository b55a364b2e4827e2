//! Near objects: raw kernel identifiers paired with a type, and the
//! identity tokens that scope them.
//!
//! A near object is just a number. It means something only relative to
//! some kernel table: a file descriptor number is resolved through a
//! file descriptor table, an address through an address space, a pid
//! through a pid namespace. The identity tokens in this module stand
//! for those tables; two tasks that share a table hold clones of the
//! same token, so sharing can be checked with a cheap comparison
//! before a number from one task is handed to another.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A file descriptor number, relative to some file descriptor table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FileDescriptor(pub i32);

impl FileDescriptor {
    pub fn number(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

impl From<FileDescriptor> for i64 {
    fn from(fd: FileDescriptor) -> i64 {
        fd.0 as i64
    }
}

/// A virtual memory address, relative to some address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub u64);

impl Address {
    pub fn add(&self, off: usize) -> Address {
        Address(self.0 + off as u64)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<Address> for i64 {
    fn from(a: Address) -> i64 {
        a.0 as i64
    }
}

/// A process id, as observed from some pid namespace.
///
/// The same process has a different id in every pid namespace it is
/// visible from, so a bare pid is only meaningful together with the
/// namespace it was read in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

impl From<Pid> for i64 {
    fn from(p: Pid) -> i64 {
        p.0 as i64
    }
}

/// A syscall number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Sysno(pub i64);

impl fmt::Display for Sysno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match crate::sysif::syscall_name(*self) {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "sys:{}", self.0),
        }
    }
}

/// A range of mapped memory, relative to some address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemRegion {
    pub addr: Address,
    pub len: usize,
    pub page_size: usize,
}

impl MemRegion {
    pub fn end(&self) -> Address {
        self.addr.add(self.len)
    }

    pub fn contains(&self, addr: Address, len: usize) -> bool {
        addr >= self.addr && addr.add(len) <= self.end()
    }
}

impl fmt::Display for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.addr, self.end())
    }
}

fn next_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Identity of one kernel file descriptor table.
///
/// Tasks spawned without CLONE_FILES get a fresh token; tasks that
/// share the kernel table share the token. The token also carries the
/// library-side reference counts for the fds in the table; see
/// [`crate::fd`].
#[derive(Clone)]
pub struct FdTable {
    id: u64,
    pub(crate) state: Arc<crate::fd::FdTableState>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            id: next_token(),
            state: Arc::new(crate::fd::FdTableState::new()),
        }
    }
}

impl Default for FdTable {
    fn default() -> FdTable {
        FdTable::new()
    }
}

impl PartialEq for FdTable {
    fn eq(&self, other: &FdTable) -> bool {
        self.id == other.id
    }
}
impl Eq for FdTable {}

impl fmt::Debug for FdTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FdTable({})", self.id)
    }
}

/// Identity of one virtual memory layout.
///
/// `local` is true when this is the address space the library itself
/// runs in, which permits direct memory access instead of going
/// through a socket transport. The token also carries the list of
/// ranges whose mappings were dropped without an explicit munmap;
/// see [`crate::mem::mapping`].
#[derive(Clone)]
pub struct AddressSpace {
    id: u64,
    local: bool,
    pub(crate) state: Arc<crate::mem::mapping::AddressSpaceState>,
}

impl AddressSpace {
    pub fn new() -> AddressSpace {
        AddressSpace {
            id: next_token(),
            local: false,
            state: Arc::new(crate::mem::mapping::AddressSpaceState::new()),
        }
    }

    pub fn new_local() -> AddressSpace {
        AddressSpace {
            id: next_token(),
            local: true,
            state: Arc::new(crate::mem::mapping::AddressSpaceState::new()),
        }
    }

    pub fn is_local(&self) -> bool {
        self.local
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AddressSpace({})", self.id)
    }
}

impl Default for AddressSpace {
    fn default() -> AddressSpace {
        AddressSpace::new()
    }
}

impl PartialEq for AddressSpace {
    fn eq(&self, other: &AddressSpace) -> bool {
        self.id == other.id
    }
}
impl Eq for AddressSpace {}

macro_rules! identity_token {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub fn new() -> $name {
                $name(next_token())
            }
        }

        impl Default for $name {
            fn default() -> $name {
                $name::new()
            }
        }
    };
}

identity_token!(MountNamespace, "Identity of one mount namespace.");
identity_token!(PidNamespace, "Identity of one pid namespace.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique() {
        assert_ne!(FdTable::new(), FdTable::new());
        assert_ne!(AddressSpace::new(), AddressSpace::new());
        assert_ne!(MountNamespace::new(), MountNamespace::new());
    }

    #[test]
    fn region_containment() {
        let r = MemRegion {
            addr: Address(0x1000),
            len: 0x2000,
            page_size: 4096,
        };
        assert!(r.contains(Address(0x1000), 0x2000));
        assert!(r.contains(Address(0x2fff), 1));
        assert!(!r.contains(Address(0x2fff), 2));
        assert!(!r.contains(Address(0xfff), 1));
    }
}
