//! The syscall interface contract.
//!
//! A [`SyscallInterface`] is anything that can take a 6-argument
//! syscall, run it somewhere, and hand back the signed return value.
//! The executor may be the calling process itself ([`NativeSyscall`]),
//! an agent at the far end of a frame transport
//! ([`crate::conn::ConnectionInterface`]), or a mock in tests.

use crate::error::{Error, Result};
use crate::near::{FileDescriptor, Sysno};
use async_trait::async_trait;
use tokio::sync::oneshot;

/// The in-flight result of one submitted syscall.
///
/// The response is consumed by the transport's reader driver no matter
/// what the submitter does, so dropping a `PendingResponse` cannot
/// desynchronize later submitters; the caller merely never observes
/// the value.
pub struct PendingResponse {
    inner: PendingInner,
}

enum PendingInner {
    Ready(Result<i64>),
    Channel(oneshot::Receiver<Result<i64>>),
}

impl PendingResponse {
    pub fn ready(result: Result<i64>) -> PendingResponse {
        PendingResponse {
            inner: PendingInner::Ready(result),
        }
    }

    pub fn channel(rx: oneshot::Receiver<Result<i64>>) -> PendingResponse {
        PendingResponse {
            inner: PendingInner::Channel(rx),
        }
    }

    /// Wait for the raw kernel return value.
    pub async fn receive(self) -> Result<i64> {
        match self.inner {
            PendingInner::Ready(result) => result,
            PendingInner::Channel(rx) => match rx.await {
                Ok(result) => result,
                // The reader driver dropped the sender: transport died.
                Err(_) => Err(Error::TransportTerminal),
            },
        }
    }
}

#[async_trait]
pub trait SyscallInterface: Send + Sync {
    /// Queue one syscall for execution. Blocks only on transport
    /// backpressure, never on the kernel's answer.
    async fn submit(&self, nr: Sysno, args: [i64; 6]) -> Result<PendingResponse>;

    /// Submit and wait; negative returns in the errno range become
    /// typed errors.
    async fn syscall(&self, nr: Sysno, args: [i64; 6]) -> Result<i64> {
        let pending = self.submit(nr, args).await?;
        let raw = pending.receive().await;
        match &raw {
            Ok(v) => tracing::debug!("{}{:?} -> {}", nr, args, v),
            Err(e) => tracing::debug!("{}{:?} -> {}", nr, args, e),
        }
        raise_if_error(nr, raw?)
    }

    /// Tear down the transport. All pending and future calls fail.
    async fn close_interface(&self);

    /// If present, this fd is readable whenever the executor has work
    /// to progress; an epoll loop adds it so a blocking remote
    /// epoll_wait wakes up when the syscall channel has traffic.
    fn activity_fd(&self) -> Option<FileDescriptor> {
        None
    }
}

/// Map kernel returns in [-4095, -1] to errno errors.
pub fn raise_if_error(nr: Sysno, ret: i64) -> Result<i64> {
    if (-4095..0).contains(&ret) {
        Err(Error::errno(nix::errno::Errno::from_i32(-ret as i32), nr))
    } else {
        Ok(ret)
    }
}

/// Pretty names for the syscalls the crate itself issues; everything
/// else renders as a bare number.
pub fn syscall_name(nr: Sysno) -> Option<&'static str> {
    let name = match nr.0 as std::os::raw::c_long {
        libc::SYS_read => "read",
        libc::SYS_write => "write",
        libc::SYS_readv => "readv",
        libc::SYS_writev => "writev",
        libc::SYS_close => "close",
        libc::SYS_openat => "openat",
        libc::SYS_pipe2 => "pipe2",
        libc::SYS_dup3 => "dup3",
        libc::SYS_fcntl => "fcntl",
        libc::SYS_socketpair => "socketpair",
        libc::SYS_sendmsg => "sendmsg",
        libc::SYS_recvmsg => "recvmsg",
        libc::SYS_mmap => "mmap",
        libc::SYS_munmap => "munmap",
        libc::SYS_epoll_create1 => "epoll_create1",
        libc::SYS_epoll_ctl => "epoll_ctl",
        libc::SYS_epoll_wait => "epoll_wait",
        libc::SYS_signalfd4 => "signalfd4",
        libc::SYS_rt_sigprocmask => "rt_sigprocmask",
        libc::SYS_waitid => "waitid",
        libc::SYS_kill => "kill",
        libc::SYS_getpid => "getpid",
        libc::SYS_unshare => "unshare",
        libc::SYS_exit_group => "exit_group",
        _ => return None,
    };
    Some(name)
}

/// Executes syscalls directly in the calling process.
///
/// This is the interface of the root task. It must only be handed
/// syscalls that do not block: readiness is established first through
/// [`crate::asyncfd::AsyncFileDescriptor`], the same discipline every
/// other interface follows.
pub struct NativeSyscall;

#[async_trait]
impl SyscallInterface for NativeSyscall {
    async fn submit(&self, nr: Sysno, args: [i64; 6]) -> Result<PendingResponse> {
        let ret = unsafe {
            libc::syscall(
                nr.0 as std::os::raw::c_long,
                args[0],
                args[1],
                args[2],
                args[3],
                args[4],
                args[5],
            )
        };
        let raw = if ret == -1 {
            match std::io::Error::last_os_error().raw_os_error() {
                Some(errno) => -(errno as i64),
                None => -1,
            }
        } else {
            ret as i64
        };
        Ok(PendingResponse::ready(Ok(raw)))
    }

    async fn close_interface(&self) {}
}

#[cfg(test)]
pub mod testing {
    //! Mock interfaces shared by unit tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Echoes `args[0]` back as the result of every syscall and keeps
    /// a log of submissions.
    pub struct EchoSyscall {
        pub log: Mutex<Vec<(Sysno, [i64; 6])>>,
        closed: AtomicBool,
    }

    impl EchoSyscall {
        pub fn new() -> EchoSyscall {
            EchoSyscall {
                log: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SyscallInterface for EchoSyscall {
        async fn submit(&self, nr: Sysno, args: [i64; 6]) -> Result<PendingResponse> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::TransportTerminal);
            }
            self.log.lock().unwrap().push((nr, args));
            Ok(PendingResponse::ready(Ok(args[0])))
        }

        async fn close_interface(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn errno_range_is_mapped() {
        assert!(raise_if_error(Sysno(0), 5).is_ok());
        assert!(raise_if_error(Sysno(0), 0).is_ok());
        let err = raise_if_error(Sysno(0), -2).unwrap_err();
        assert!(err.is_errno(nix::errno::Errno::ENOENT));
        // Large negative values outside the errno range pass through.
        assert_eq!(raise_if_error(Sysno(0), -5000).unwrap(), -5000);
    }

    #[tokio::test]
    async fn native_getpid_matches_std() {
        let sysif = NativeSyscall;
        let pid = sysif
            .syscall(Sysno(libc::SYS_getpid as i64), [0; 6])
            .await
            .unwrap();
        assert_eq!(pid, std::process::id() as i64);
    }

    #[tokio::test]
    async fn closed_echo_interface_is_terminal() {
        let sysif = testing::EchoSyscall::new();
        assert_eq!(sysif.syscall(Sysno(0), [42, 0, 0, 0, 0, 0]).await.unwrap(), 42);
        sysif.close_interface().await;
        match sysif.syscall(Sysno(0), [42, 0, 0, 0, 0, 0]).await {
            Err(Error::TransportTerminal) => {}
            other => panic!("expected terminal error, got {:?}", other.map(|_| ())),
        }
    }
}
