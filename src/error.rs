//! Error kinds for remote syscalls and the handle layer.
//!
//! Errno errors are local to one syscall and the caller may recover
//! from them. Everything else is either fatal for one interface
//! (`TransportTerminal`, `Bootstrap`) or a programmer error that is
//! never recovered (`Invalid`, the mismatch variants).

use crate::monitor::ChildEvent;
use crate::near::{AddressSpace, FdTable, FileDescriptor, Sysno};
use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The kernel returned a negative errno for this syscall.
    #[error("{syscall} failed with {errno}{}", ctx_suffix(.ctx))]
    Errno {
        errno: Errno,
        syscall: Sysno,
        ctx: Option<String>,
    },

    /// The syscall interface is broken; every pending and future call
    /// on its task fails with this.
    #[error("syscall transport is closed or broken")]
    TransportTerminal,

    /// A consumed or invalidated handle was used.
    #[error("handle is no longer valid")]
    Invalid,

    /// An fd handle was passed to a task with a different fd table.
    #[error("fd {fd} belongs to {ours:?}, not {theirs:?}")]
    FdTableMismatch {
        fd: FileDescriptor,
        ours: FdTable,
        theirs: FdTable,
    },

    /// A pointer was passed to a task with a different address space.
    #[error("pointer is bound to address space {ours:?}, not {theirs:?}")]
    AddressSpaceMismatch {
        ours: AddressSpace,
        theirs: AddressSpace,
    },

    /// A handle-layer invariant was violated: overlapping batch
    /// operations, merge of non-adjacent pointers, oversized writes.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The spawned agent never completed its handshake; the task is
    /// dead on arrival.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// A monitored child terminated abnormally.
    #[error("child failed: {0}")]
    Child(ChildEvent),

    /// Host-side I/O while setting up transports.
    #[error("transport setup: {0}")]
    Io(#[from] std::io::Error),
}

fn ctx_suffix(ctx: &Option<String>) -> String {
    match ctx {
        Some(c) => format!(" ({})", c),
        None => String::new(),
    }
}

impl Error {
    pub fn errno(errno: Errno, syscall: Sysno) -> Error {
        Error::Errno {
            errno,
            syscall,
            ctx: None,
        }
    }

    /// Attach the offending path or fd to an errno error.
    pub fn with_ctx(self, ctx: impl Into<String>) -> Error {
        match self {
            Error::Errno { errno, syscall, .. } => Error::Errno {
                errno,
                syscall,
                ctx: Some(ctx.into()),
            },
            other => other,
        }
    }

    pub fn is_errno(&self, which: Errno) -> bool {
        matches!(self, Error::Errno { errno, .. } if *errno == which)
    }

    pub fn invariant(msg: impl Into<String>) -> Error {
        Error::Invariant(msg.into())
    }
}

impl From<nix::Error> for Error {
    fn from(errno: nix::Error) -> Error {
        Error::Errno {
            errno,
            syscall: Sysno(-1),
            ctx: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_display_carries_context() {
        let e = Error::errno(Errno::ENOENT, Sysno(libc::SYS_openat as i64))
            .with_ctx("/no/such/file");
        let s = e.to_string();
        assert!(s.contains("ENOENT"), "{}", s);
        assert!(s.contains("/no/such/file"), "{}", s);
    }

    #[test]
    fn kinds_stringify_distinctly() {
        let kinds = [
            Error::TransportTerminal.to_string(),
            Error::Invalid.to_string(),
            Error::invariant("x").to_string(),
            Error::Bootstrap("y".into()).to_string(),
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in kinds.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
