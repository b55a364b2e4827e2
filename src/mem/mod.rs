//! Memory in remote address spaces: mappings, the allocator that
//! carves them up, typed pointers over allocations, the transports
//! that move bytes in and out, and the RAM facade that ties a task's
//! allocator and transport together.

pub mod allocator;
pub mod mapping;
pub mod ptr;
pub mod ram;
pub mod transport;

pub use allocator::{Allocation, Allocator, AllocatorClient};
pub use mapping::OwnedMapping;
pub use ptr::{Pointer, PtrGuard, PtrSpan, WrittenPointer};
pub use ram::{Batch, Ram};
pub use transport::{LocalMemoryTransport, MemoryTransport, SocketMemoryTransport};
