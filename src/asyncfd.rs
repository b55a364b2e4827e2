//! Readiness-driven file descriptor I/O through any task.
//!
//! Each task that does I/O gets an [`Epoller`]: an epoll instance
//! created through that task's own syscalls, with one pump that waits
//! for events and routes them to per-fd waiters. For the root task the
//! pump waits for the epoll fd to become readable host-side and then
//! drains it without blocking; for a remote task the pump simply
//! issues a blocking epoll_wait, which is safe because the syscall
//! channel's activity fd is part of the epoll set: new syscall traffic
//! wakes the agent out of the wait so the channel never deadlocks.

use crate::error::{Error, Result};
use crate::fd::FdHandle;
use crate::mem::{Pointer, Ram};
use crate::near::{FileDescriptor, Sysno};
use crate::serialize::{EpollEvent, EpollEventList, FixedWire, Wire};
use nix::errno::Errno;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;

const MAX_EVENTS: usize = 32;
/// Registration id of the syscall channel's activity fd.
const ACTIVITY_ID: u64 = 0;

const READ_READY: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const WRITE_READY: u32 = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;

struct HostFd(RawFd);

impl AsRawFd for HostFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Accumulated readiness for one registered fd.
///
/// `armed` is the union of the interests of everyone currently
/// waiting; each re-arm registers the whole union, so a reader and a
/// writer sharing one descriptor cannot clobber each other's one-shot.
struct FdStatus {
    bits: AtomicU32,
    armed: AtomicU32,
    notify: Notify,
}

struct EpollerInner {
    ram: Ram,
    epfd: FdHandle,
    host: Option<AsyncFd<HostFd>>,
    statuses: Mutex<HashMap<u64, Arc<FdStatus>>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct Epoller {
    inner: Arc<EpollerInner>,
}

impl Epoller {
    /// Create an epoll instance in the task behind `ram`. If the
    /// task's interface has an activity fd, pass it so blocking waits
    /// yield to syscall traffic.
    pub async fn new(ram: Ram, activity: Option<FileDescriptor>) -> Result<Epoller> {
        let ret = ram
            .task
            .sysif
            .syscall(
                Sysno(libc::SYS_epoll_create1 as i64),
                [libc::EPOLL_CLOEXEC as i64, 0, 0, 0, 0, 0],
            )
            .await?;
        let epfd = ram.task.make_fd_handle(FileDescriptor(ret as i32));
        let host = if ram.task.address_space.is_local() {
            Some(AsyncFd::new(HostFd(ret as i32))?)
        } else {
            None
        };
        let inner = Arc::new(EpollerInner {
            ram,
            epfd,
            host,
            statuses: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        if let Some(activity_fd) = activity {
            // Level-triggered and permanent: any queued request frame
            // keeps the epoll readable until the agent consumes it.
            inner
                .ctl(
                    libc::EPOLL_CTL_ADD,
                    activity_fd,
                    libc::EPOLLIN as u32,
                    ACTIVITY_ID,
                )
                .await?;
        }
        let pump_target = Arc::downgrade(&inner);
        tokio::spawn(pump(pump_target));
        Ok(Epoller { inner })
    }

    pub fn ram(&self) -> &Ram {
        &self.inner.ram
    }
}

impl EpollerInner {
    async fn ctl(&self, op: i32, fd: FileDescriptor, events: u32, data: u64) -> Result<()> {
        let addr = if op == libc::EPOLL_CTL_DEL {
            0i64
        } else {
            let ev = self.ram.ptr(EpollEvent { events, data }).await?;
            let guard = ev.borrow(&self.ram.task)?;
            let addr = guard.addr().into();
            // The kernel copies the event during the ctl call itself;
            // issue it while the pointer is borrowed.
            return self
                .ram
                .task
                .sysif
                .syscall(
                    Sysno(libc::SYS_epoll_ctl as i64),
                    [
                        self.epfd.near().into(),
                        op as i64,
                        fd.into(),
                        addr,
                        0,
                        0,
                    ],
                )
                .await
                .map(|_| ());
        };
        self.ram
            .task
            .sysif
            .syscall(
                Sysno(libc::SYS_epoll_ctl as i64),
                [self.epfd.near().into(), op as i64, fd.into(), addr, 0, 0],
            )
            .await?;
        Ok(())
    }

    /// One epoll_wait plus dispatch. Returns the number of events.
    async fn wait_once(&self, timeout: i32) -> Result<usize> {
        let buf = self
            .ram
            .malloc_sized::<EpollEventList>(MAX_EVENTS * EpollEvent::SIZE)
            .await?;
        let n = {
            let guard = buf.borrow(&self.ram.task)?;
            let ret = self
                .ram
                .task
                .sysif
                .syscall(
                    Sysno(libc::SYS_epoll_wait as i64),
                    [
                        self.epfd.near().into(),
                        guard.addr().into(),
                        MAX_EVENTS as i64,
                        timeout as i64,
                        0,
                        0,
                    ],
                )
                .await;
            match ret {
                Ok(n) => n as usize,
                Err(err) if err.is_errno(Errno::EINTR) => 0,
                Err(err) => return Err(err),
            }
        };
        if n > 0 {
            let (valid, _rest) = buf.split(n * EpollEvent::SIZE)?;
            let events = valid.read().await?;
            self.dispatch(&events);
        }
        Ok(n)
    }

    fn dispatch(&self, events: &EpollEventList) {
        let statuses = self.statuses.lock().unwrap();
        for ev in &events.0 {
            if ev.data == ACTIVITY_ID {
                continue;
            }
            if let Some(status) = statuses.get(&ev.data) {
                status.bits.fetch_or(ev.events, Ordering::SeqCst);
                status.notify.notify_waiters();
            }
        }
    }
}

/// The event pump. Holds only a weak reference so dropping the last
/// Epoller clone shuts it down at the next cycle.
async fn pump(target: Weak<EpollerInner>) {
    loop {
        let inner = match target.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let cycle = async {
            match &inner.host {
                Some(host) => {
                    let mut guard = host.readable().await.map_err(Error::Io)?;
                    guard.clear_ready();
                    // Drain everything the edge announced.
                    while inner.wait_once(0).await? > 0 {}
                    Ok::<(), Error>(())
                }
                None => {
                    inner.wait_once(-1).await?;
                    Ok(())
                }
            }
        };
        if let Err(err) = cycle.await {
            tracing::debug!("epoll pump stopping: {}", err);
            return;
        }
    }
}

/// Removes the waiter record when the descriptor goes away.
struct StatusGuard {
    epoller: Epoller,
    id: u64,
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.epoller
            .inner
            .statuses
            .lock()
            .unwrap()
            .remove(&self.id);
    }
}

/// A file descriptor registered with an [`Epoller`], with async
/// readiness waits.
pub struct AsyncFileDescriptor {
    epoller: Epoller,
    fd: FdHandle,
    id: u64,
    status: Arc<FdStatus>,
    _guard: StatusGuard,
}

impl AsyncFileDescriptor {
    pub async fn new(epoller: &Epoller, fd: FdHandle) -> Result<AsyncFileDescriptor> {
        fd.set_nonblock().await?;
        let inner = &epoller.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(FdStatus {
            bits: AtomicU32::new(0),
            armed: AtomicU32::new(0),
            notify: Notify::new(),
        });
        inner.statuses.lock().unwrap().insert(id, status.clone());
        // Registered with no interest; each wait arms a one-shot.
        inner.ctl(libc::EPOLL_CTL_ADD, fd.near(), 0, id).await?;
        Ok(AsyncFileDescriptor {
            epoller: epoller.clone(),
            fd,
            id,
            status,
            _guard: StatusGuard {
                epoller: epoller.clone(),
                id,
            },
        })
    }

    pub fn handle(&self) -> &FdHandle {
        &self.fd
    }

    async fn wait(&self, interest: u32, ready: u32) -> Result<()> {
        self.status.armed.fetch_or(interest, Ordering::SeqCst);
        let result = self.wait_armed(ready).await;
        self.status.armed.fetch_and(!interest, Ordering::SeqCst);
        result
    }

    async fn wait_armed(&self, ready: u32) -> Result<()> {
        loop {
            if self.status.bits.load(Ordering::SeqCst) & ready != 0 {
                return Ok(());
            }
            let notified = self.status.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.status.bits.load(Ordering::SeqCst) & ready != 0 {
                return Ok(());
            }
            let armed = self.status.armed.load(Ordering::SeqCst);
            self.epoller
                .inner
                .ctl(
                    libc::EPOLL_CTL_MOD,
                    self.fd.near(),
                    armed | libc::EPOLLONESHOT as u32,
                    self.id,
                )
                .await?;
            if self.status.bits.load(Ordering::SeqCst) & ready != 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    pub async fn wait_readable(&self) -> Result<()> {
        self.status
            .bits
            .fetch_and(!(libc::EPOLLIN as u32), Ordering::SeqCst);
        self.wait((libc::EPOLLIN | libc::EPOLLRDHUP) as u32, READ_READY)
            .await
    }

    pub async fn wait_writable(&self) -> Result<()> {
        self.status
            .bits
            .fetch_and(!(libc::EPOLLOUT as u32), Ordering::SeqCst);
        self.wait(libc::EPOLLOUT as u32, WRITE_READY).await
    }

    /// Read into task memory; returns the filled and unfilled halves.
    pub async fn read<T: Wire>(&self, buf: Pointer<T>) -> Result<(Pointer<T>, Pointer<T>)> {
        let task = self.fd.task();
        loop {
            let ret = {
                let guard = buf.borrow(task)?;
                task.sysif
                    .syscall(
                        Sysno(libc::SYS_read as i64),
                        [
                            self.fd.near().into(),
                            guard.addr().into(),
                            buf.size() as i64,
                            0,
                            0,
                            0,
                        ],
                    )
                    .await
            };
            match ret {
                Ok(n) => return buf.split(n as usize),
                Err(err) if err.is_errno(Errno::EAGAIN) => self.wait_readable().await?,
                Err(err) => return Err(err),
            }
        }
    }

    /// Write from task memory; returns the written and unwritten
    /// halves.
    pub async fn write<T: Wire>(&self, buf: Pointer<T>) -> Result<(Pointer<T>, Pointer<T>)> {
        let task = self.fd.task();
        loop {
            let ret = {
                let guard = buf.borrow(task)?;
                task.sysif
                    .syscall(
                        Sysno(libc::SYS_write as i64),
                        [
                            self.fd.near().into(),
                            guard.addr().into(),
                            buf.size() as i64,
                            0,
                            0,
                            0,
                        ],
                    )
                    .await
            };
            match ret {
                Ok(n) => return buf.split(n as usize),
                Err(err) if err.is_errno(Errno::EAGAIN) => self.wait_writable().await?,
                Err(err) => return Err(err),
            }
        }
    }

    fn check_local(&self) -> Result<()> {
        if !self.fd.task().address_space.is_local() {
            return Err(Error::invariant(
                "byte-slice I/O is only possible in the local address space",
            ));
        }
        Ok(())
    }

    /// Read into a plain buffer. Only valid on the root task, where
    /// the executing process can see the buffer directly.
    pub async fn read_bytes(&self, out: &mut [u8]) -> Result<usize> {
        self.check_local()?;
        let task = self.fd.task();
        loop {
            let ret = task
                .sysif
                .syscall(
                    Sysno(libc::SYS_read as i64),
                    [
                        self.fd.near().into(),
                        out.as_mut_ptr() as i64,
                        out.len() as i64,
                        0,
                        0,
                        0,
                    ],
                )
                .await;
            match ret {
                Ok(n) => return Ok(n as usize),
                Err(err) if err.is_errno(Errno::EAGAIN) => self.wait_readable().await?,
                Err(err) => return Err(err),
            }
        }
    }

    /// Fill `out` completely; end-of-stream midway is terminal.
    pub async fn read_bytes_exact_into(&self, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let n = self.read_bytes(&mut out[done..]).await?;
            if n == 0 {
                return Err(Error::TransportTerminal);
            }
            done += n;
        }
        Ok(())
    }

    /// Write all of `data`. Only valid on the root task.
    pub async fn write_bytes_all(&self, data: &[u8]) -> Result<()> {
        self.check_local()?;
        let task = self.fd.task();
        let mut done = 0;
        while done < data.len() {
            let ret = task
                .sysif
                .syscall(
                    Sysno(libc::SYS_write as i64),
                    [
                        self.fd.near().into(),
                        data[done..].as_ptr() as i64,
                        (data.len() - done) as i64,
                        0,
                        0,
                        0,
                    ],
                )
                .await;
            match ret {
                Ok(n) => done += n as usize,
                Err(err) if err.is_errno(Errno::EAGAIN) => self.wait_writable().await?,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        let AsyncFileDescriptor {
            epoller,
            fd,
            id,
            status: _,
            _guard,
        } = self;
        epoller
            .inner
            .ctl(libc::EPOLL_CTL_DEL, fd.near(), 0, id)
            .await?;
        fd.close().await
    }
}
