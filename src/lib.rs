//! farcall: run Linux syscalls in other processes.
//!
//! A [`task::Task`] is a thread of execution somewhere — another
//! process, another namespace, another machine over ssh — that we can
//! submit syscalls to as if they were our own. The crate spawns such
//! tasks, bootstraps the channels to them, moves argument memory in
//! and out of their address spaces, and tracks the kernel resources
//! involved (file descriptors, mappings, child processes) with the
//! same ownership discipline the kernel itself applies.
//!
//! The layering, bottom up:
//!
//! - [`near`]: raw kernel identifiers, and the identity tokens for
//!   the tables they are relative to.
//! - [`sysif`]: the contract for "something that executes syscalls",
//!   with [`conn`] as the frame-transport implementation talking to a
//!   remote [`agent`].
//! - [`mem`]: allocation of remote memory, typed pointers over it,
//!   and the transports that move bytes across address spaces.
//! - [`fd`]: owning file descriptor handles, scoped to fd tables.
//! - [`asyncfd`]: epoll-backed readiness, usable through any task.
//! - [`monitor`]: SIGCHLD multiplexing to per-child async waits.
//! - [`spawn`] and [`ssh`]: building new tasks, locally via clone or
//!   remotely via forwarded sockets.
//!
//! Everything is rooted in an explicit [`spawn::Host`]; there is no
//! global state.

pub mod agent;
pub mod asyncfd;
pub mod conn;
pub mod error;
pub mod fd;
pub mod mem;
pub mod monitor;
pub mod near;
pub mod serialize;
pub mod spawn;
pub mod ssh;
pub mod sysif;
pub mod task;

pub use error::{Error, Result};
pub use fd::FdHandle;
pub use mem::{Pointer, Ram, WrittenPointer};
pub use monitor::{AsyncChildProcess, ChildEvent, ChildProcessMonitor};
pub use near::{Address, AddressSpace, FdTable, FileDescriptor, Pid, Sysno};
pub use spawn::{ChildTask, Host, SpawnFlags};
pub use sysif::SyscallInterface;
pub use task::{Task, TaskRef};
