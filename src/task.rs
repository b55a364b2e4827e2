//! The task: one remote thread of execution and the identifiers that
//! scope its resources.

use crate::error::{Error, Result};
use crate::fd::FdHandle;
use crate::mem::{OwnedMapping, Ram, WrittenPointer};
use crate::near::{
    Address, AddressSpace, FdTable, FileDescriptor, MemRegion, MountNamespace, Pid, PidNamespace,
    Sysno,
};
use crate::serialize::{
    cmsg_space, Arg, Bytes, CmsgRights, FdPair, FixedWire, Iovec, MsgHdr, Siginfo, Sigset, Wire,
};
use crate::sysif::SyscallInterface;
use std::sync::Arc;

pub type TaskRef = Arc<Task>;

/// One thread of execution we can run syscalls on, plus the identity
/// of the kernel tables its near objects are relative to.
///
/// Everything else hangs off a task: fd handles record which table
/// their number lives in by pointing here, pointers compare their
/// mapping's address space against this one, and the monitor and
/// epoller route their syscalls through `sysif`.
pub struct Task {
    pub sysif: Arc<dyn SyscallInterface>,
    /// The task's pid as seen from the namespace that spawned it.
    pub process: Pid,
    pub fd_table: FdTable,
    pub address_space: AddressSpace,
    pub mount_ns: MountNamespace,
    pub pid_ns: PidNamespace,
}

impl Task {
    pub fn new(
        sysif: Arc<dyn SyscallInterface>,
        process: Pid,
        fd_table: FdTable,
        address_space: AddressSpace,
        mount_ns: MountNamespace,
        pid_ns: PidNamespace,
    ) -> TaskRef {
        Arc::new(Task {
            sysif,
            process,
            fd_table,
            address_space,
            mount_ns,
            pid_ns,
        })
    }

    /// Mint an owning handle for a raw fd number the caller knows is
    /// live in this task's table.
    pub fn make_fd_handle(self: &Arc<Self>, near: FileDescriptor) -> FdHandle {
        FdHandle::new(self.clone(), near)
    }

    /// Close fd numbers whose last handle was dropped rather than
    /// closed.
    pub async fn reap_dropped_fds(&self) -> Result<()> {
        for fd in self.fd_table.state.take_garbage() {
            self.sysif
                .syscall(Sysno(libc::SYS_close as i64), [fd as i64, 0, 0, 0, 0, 0])
                .await?;
        }
        Ok(())
    }

    /// Unmap ranges whose [`OwnedMapping`] was dropped rather than
    /// munmapped. Any task sharing the address space may do this.
    pub async fn reap_dropped_mappings(&self) -> Result<()> {
        for region in self.address_space.state.take_leaked() {
            self.sysif
                .syscall(
                    Sysno(libc::SYS_munmap as i64),
                    [region.addr.into(), region.len as i64, 0, 0, 0, 0],
                )
                .await?;
        }
        Ok(())
    }

    pub async fn getpid(&self) -> Result<Pid> {
        let ret = self
            .sysif
            .syscall(Sysno(libc::SYS_getpid as i64), [0; 6])
            .await?;
        Ok(Pid(ret as i32))
    }

    pub async fn kill(&self, pid: Pid, signal: i32) -> Result<()> {
        self.sysif
            .syscall(
                Sysno(libc::SYS_kill as i64),
                [pid.into(), signal as i64, 0, 0, 0, 0],
            )
            .await?;
        Ok(())
    }

    pub async fn unshare(&self, flags: i32) -> Result<()> {
        self.sysif
            .syscall(
                Sysno(libc::SYS_unshare as i64),
                [flags as i64, 0, 0, 0, 0, 0],
            )
            .await?;
        Ok(())
    }

    /// Terminate the task. The agent never answers this one; the EOF
    /// that follows is the expected shape of success.
    pub async fn exit(&self, status: i32) -> Result<()> {
        let ret = self
            .sysif
            .syscall(
                Sysno(libc::SYS_exit_group as i64),
                [status as i64, 0, 0, 0, 0, 0],
            )
            .await;
        self.sysif.close_interface().await;
        match ret {
            Ok(_) | Err(Error::TransportTerminal) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn mmap_anonymous(
        self: &Arc<Self>,
        len: usize,
        prot: i32,
        flags: i32,
    ) -> Result<OwnedMapping> {
        let ret = self
            .sysif
            .syscall(
                Sysno(libc::SYS_mmap as i64),
                [
                    0,
                    len as i64,
                    prot as i64,
                    (flags | libc::MAP_ANONYMOUS) as i64,
                    -1,
                    0,
                ],
            )
            .await?;
        Ok(OwnedMapping::new(
            self.clone(),
            MemRegion {
                addr: Address(ret as u64),
                len,
                page_size: *crate::mem::allocator::PAGE_SIZE,
            },
        ))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Task({}, {:?})", self.process, self.fd_table)
    }
}

/// Syscall wrappers that need staging memory, hung off the task's RAM
/// view. These all follow the same shape: serialize arguments into
/// task memory, borrow the pointers across the syscall, translate the
/// result into handles.
impl Ram {
    pub async fn open(&self, path: &str, flags: i32, mode: u32) -> Result<FdHandle> {
        let path_ptr = self.ptr(Arg::new(path)).await?;
        self.openat_ptr(None, &path_ptr, flags, mode)
            .await
            .map_err(|e| e.with_ctx(path.to_string()))
    }

    pub async fn openat_ptr(
        &self,
        dirfd: Option<&FdHandle>,
        path: &WrittenPointer<Arg>,
        flags: i32,
        mode: u32,
    ) -> Result<FdHandle> {
        if let Some(dirfd) = dirfd {
            dirfd.check_is_for(&self.task)?;
        }
        let dirfd_num = dirfd
            .map(|fd| fd.near().into())
            .unwrap_or(libc::AT_FDCWD as i64);
        let guard = path.borrow(&self.task)?;
        let ret = self
            .task
            .sysif
            .syscall(
                Sysno(libc::SYS_openat as i64),
                [
                    dirfd_num,
                    guard.addr().into(),
                    flags as i64,
                    mode as i64,
                    0,
                    0,
                ],
            )
            .await?;
        Ok(self.task.make_fd_handle(FileDescriptor(ret as i32)))
    }

    pub async fn pipe2(&self, flags: i32) -> Result<(FdHandle, FdHandle)> {
        let buf = self.malloc::<FdPair>().await?;
        let pair = {
            let guard = buf.borrow(&self.task)?;
            self.task
                .sysif
                .syscall(
                    Sysno(libc::SYS_pipe2 as i64),
                    [guard.addr().into(), flags as i64, 0, 0, 0, 0],
                )
                .await?;
            buf.read().await?
        };
        Ok((
            self.task.make_fd_handle(pair.first),
            self.task.make_fd_handle(pair.second),
        ))
    }

    pub async fn socketpair(
        &self,
        domain: i32,
        typ: i32,
        protocol: i32,
    ) -> Result<(FdHandle, FdHandle)> {
        let buf = self.malloc::<FdPair>().await?;
        let pair = {
            let guard = buf.borrow(&self.task)?;
            self.task
                .sysif
                .syscall(
                    Sysno(libc::SYS_socketpair as i64),
                    [
                        domain as i64,
                        typ as i64,
                        protocol as i64,
                        guard.addr().into(),
                        0,
                        0,
                    ],
                )
                .await?;
            buf.read().await?
        };
        Ok((
            self.task.make_fd_handle(pair.first),
            self.task.make_fd_handle(pair.second),
        ))
    }

    /// Block signals for the whole task; needed before a signalfd can
    /// observe them.
    pub async fn sigprocmask_block(&self, mask: Sigset) -> Result<()> {
        let set = self.ptr(mask).await?;
        let guard = set.borrow(&self.task)?;
        self.task
            .sysif
            .syscall(
                Sysno(libc::SYS_rt_sigprocmask as i64),
                [
                    libc::SIG_BLOCK as i64,
                    guard.addr().into(),
                    0,
                    Sigset::SIZE as i64,
                    0,
                    0,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn signalfd(&self, mask: Sigset, flags: i32) -> Result<FdHandle> {
        let set = self.ptr(mask).await?;
        let guard = set.borrow(&self.task)?;
        let ret = self
            .task
            .sysif
            .syscall(
                Sysno(libc::SYS_signalfd4 as i64),
                [
                    -1,
                    guard.addr().into(),
                    Sigset::SIZE as i64,
                    flags as i64,
                    0,
                    0,
                ],
            )
            .await?;
        Ok(self.task.make_fd_handle(FileDescriptor(ret as i32)))
    }

    /// waitid(2) with the result decoded from task memory. `None`
    /// means WNOHANG found nothing.
    pub async fn waitid(
        &self,
        idtype: i32,
        id: i64,
        options: i32,
    ) -> Result<Option<Siginfo>> {
        let buf = self.malloc::<Siginfo>().await?;
        // The kernel reports "no children changed state" under
        // WNOHANG by leaving si_pid zero; zero the buffer so stale
        // memory cannot fake an event.
        let buf = buf.write(Siginfo::zeroed()).await?;
        {
            let guard = buf.borrow(&self.task)?;
            self.task
                .sysif
                .syscall(
                    Sysno(libc::SYS_waitid as i64),
                    [
                        idtype as i64,
                        id,
                        guard.addr().into(),
                        options as i64,
                        0,
                        0,
                    ],
                )
                .await?;
        }
        let info = buf.read().await?;
        if info.pid() == Pid(0) {
            Ok(None)
        } else {
            Ok(Some(info))
        }
    }

    /// One read(2) into fresh task memory; returns the bytes read.
    pub async fn read_to_vec(&self, fd: &FdHandle, len: usize) -> Result<Vec<u8>> {
        fd.check_is_for(&self.task)?;
        let buf = self.malloc_bytes(len).await?;
        let n = {
            let guard = buf.borrow(&self.task)?;
            self.task
                .sysif
                .syscall(
                    Sysno(libc::SYS_read as i64),
                    [fd.near().into(), guard.addr().into(), len as i64, 0, 0, 0],
                )
                .await?
        };
        let (valid, _rest) = buf.split(n as usize)?;
        Ok(valid.read().await?.0)
    }

    /// Stage `data` in task memory and write(2) it to `fd` until done.
    pub async fn write_all(&self, fd: &FdHandle, data: &[u8]) -> Result<()> {
        fd.check_is_for(&self.task)?;
        let ptr = self.ptr(Bytes(data.to_vec())).await?;
        let mut rest = ptr.into_pointer();
        while rest.size() > 0 {
            let n = {
                let guard = rest.borrow(&self.task)?;
                self.task
                    .sysif
                    .syscall(
                        Sysno(libc::SYS_write as i64),
                        [
                            fd.near().into(),
                            guard.addr().into(),
                            rest.size() as i64,
                            0,
                            0,
                            0,
                        ],
                    )
                    .await?
            };
            let (_written, unwritten) = rest.split(n as usize)?;
            rest = unwritten;
        }
        Ok(())
    }

    /// Pass fd copies to whoever holds the peer of `sock`, via an
    /// SCM_RIGHTS control message. The kernel installs fresh
    /// descriptors on receipt, so our handles remain owners of our
    /// own copies.
    pub async fn send_fds(&self, sock: &FdHandle, fds: &[&FdHandle]) -> Result<()> {
        sock.check_is_for(&self.task)?;
        for fd in fds {
            fd.check_is_for(&self.task)?;
        }
        let rights = CmsgRights(fds.iter().map(|fd| fd.near()).collect());
        let payload = self.ptr(Bytes(vec![0u8])).await?;
        let iov = self
            .ptr(Iovec {
                base: payload.near(),
                len: 1,
            })
            .await?;
        let control = self.ptr(rights).await?;
        let hdr = self
            .ptr(MsgHdr {
                name: Address(0),
                namelen: 0,
                iov: iov.near(),
                iovlen: 1,
                control: control.near(),
                controllen: cmsg_space(fds.len()),
                flags: 0,
            })
            .await?;
        let guard = hdr.borrow(&self.task)?;
        self.task
            .sysif
            .syscall(
                Sysno(libc::SYS_sendmsg as i64),
                [sock.near().into(), guard.addr().into(), 0, 0, 0, 0],
            )
            .await?;
        Ok(())
    }

    /// Receive up to `max` fds sent with [`send_fds`](Self::send_fds)
    /// and install them as handles in this task's table.
    pub async fn recv_fds(&self, sock: &FdHandle, max: usize) -> Result<Vec<FdHandle>> {
        sock.check_is_for(&self.task)?;
        let payload = self.malloc_bytes(1).await?;
        let iov = self
            .ptr(Iovec {
                base: payload.near(),
                len: 1,
            })
            .await?;
        let control = self.malloc_bytes(cmsg_space(max)).await?;
        let hdr = self
            .ptr(MsgHdr {
                name: Address(0),
                namelen: 0,
                iov: iov.near(),
                iovlen: 1,
                control: control.near(),
                controllen: cmsg_space(max),
                flags: 0,
            })
            .await?;
        {
            let guard = hdr.borrow(&self.task)?;
            self.task
                .sysif
                .syscall(
                    Sysno(libc::SYS_recvmsg as i64),
                    [sock.near().into(), guard.addr().into(), 0, 0, 0, 0],
                )
                .await?;
        }
        let hdr_after = hdr.read().await?;
        if hdr_after.controllen == 0 {
            return Ok(Vec::new());
        }
        let control_bytes = control.read().await?;
        let rights = CmsgRights::from_bytes(&control_bytes.0[..hdr_after.controllen])?;
        Ok(rights
            .0
            .into_iter()
            .map(|fd| self.task.make_fd_handle(fd))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::sysif::PendingResponse;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Echoes `args[0]` unless a result was queued, and logs every
    /// submission.
    pub struct LogSyscall {
        pub log: Mutex<Vec<(Sysno, [i64; 6])>>,
        pub results: Mutex<VecDeque<i64>>,
        closed: AtomicBool,
    }

    impl LogSyscall {
        pub fn new() -> Arc<LogSyscall> {
            Arc::new(LogSyscall {
                log: Mutex::new(Vec::new()),
                results: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            })
        }

        pub fn queue_result(&self, result: i64) {
            self.results.lock().unwrap().push_back(result);
        }

        pub fn calls(&self) -> Vec<(Sysno, [i64; 6])> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyscallInterface for LogSyscall {
        async fn submit(&self, nr: Sysno, args: [i64; 6]) -> Result<PendingResponse> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::TransportTerminal);
            }
            self.log.lock().unwrap().push((nr, args));
            let result = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(args[0]);
            Ok(PendingResponse::ready(Ok(result)))
        }

        async fn close_interface(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub fn mock_task_logged() -> (TaskRef, Arc<LogSyscall>) {
        let sysif = LogSyscall::new();
        let task = Task::new(
            sysif.clone(),
            Pid(1000),
            FdTable::new(),
            AddressSpace::new(),
            MountNamespace::new(),
            PidNamespace::new(),
        );
        (task, sysif)
    }

    pub fn mock_task() -> TaskRef {
        mock_task_logged().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::mock_task_logged;

    #[tokio::test]
    async fn exit_tolerates_the_dying_transport() {
        let (task, sysif) = mock_task_logged();
        task.exit(0).await.unwrap();
        // The interface is now closed; anything else is terminal.
        match task.getpid().await {
            Err(Error::TransportTerminal) => {}
            other => panic!("expected terminal error, got {:?}", other),
        }
        assert_eq!(sysif.calls()[0].0, Sysno(libc::SYS_exit_group as i64));
    }

    #[tokio::test]
    async fn reap_dropped_fds_closes_parked_numbers() {
        let (task, sysif) = mock_task_logged();
        {
            let _h = task.make_fd_handle(FileDescriptor(9));
        }
        task.reap_dropped_fds().await.unwrap();
        let calls = sysif.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (Sysno(libc::SYS_close as i64), [9, 0, 0, 0, 0, 0]));
    }
}
