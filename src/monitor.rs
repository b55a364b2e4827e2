//! Multiplexing child-state changes to per-child waiters.
//!
//! One signalfd for SIGCHLD per monitor; when it fires we sweep with
//! `waitid(P_ALL, WNOHANG|WNOWAIT|...)` and route each event to the
//! record of the child it belongs to. Terminal events are reaped with
//! a targeted waitid as soon as they are routed, so the P_ALL sweep
//! never sees the same zombie twice; the event itself stays cached in
//! the record until a waiter consumes it, which is what makes waits
//! cancellation-safe.

use crate::asyncfd::AsyncFileDescriptor;
use crate::error::{Error, Result};
use crate::mem::Ram;
use crate::near::{Pid, Sysno};
use crate::serialize::{FixedWire, Siginfo, SignalfdSiginfo, Sigset};
use crate::task::TaskRef;
use nix::errno::Errno;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChildCode {
    Exited,
    Killed,
    Dumped,
    Stopped,
    Trapped,
    Continued,
}

/// One state change of one child, as reported by waitid.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChildEvent {
    pub code: ChildCode,
    pub pid: Pid,
    pub uid: u32,
    /// Exit status for `Exited`, signal number otherwise.
    pub status: i32,
}

impl ChildEvent {
    pub fn from_siginfo(info: &Siginfo) -> Result<ChildEvent> {
        let code = match info.code() {
            libc::CLD_EXITED => ChildCode::Exited,
            libc::CLD_KILLED => ChildCode::Killed,
            libc::CLD_DUMPED => ChildCode::Dumped,
            libc::CLD_TRAPPED => ChildCode::Trapped,
            libc::CLD_STOPPED => ChildCode::Stopped,
            libc::CLD_CONTINUED => ChildCode::Continued,
            other => {
                return Err(Error::invariant(format!(
                    "unknown CLD code {} in siginfo",
                    other
                )))
            }
        };
        Ok(ChildEvent {
            code,
            pid: info.pid(),
            uid: info.uid(),
            status: info.status(),
        })
    }

    /// Did the child terminate?
    pub fn died(&self) -> bool {
        matches!(
            self.code,
            ChildCode::Exited | ChildCode::Killed | ChildCode::Dumped
        )
    }

    /// Terminated with exit status zero.
    pub fn clean(&self) -> bool {
        self.code == ChildCode::Exited && self.status == 0
    }

    /// Error out unless the child exited cleanly.
    pub fn check(&self) -> Result<()> {
        if self.clean() {
            Ok(())
        } else {
            Err(Error::Child(*self))
        }
    }
}

impl fmt::Display for ChildEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            ChildCode::Exited => write!(f, "{} exited with status {}", self.pid, self.status),
            ChildCode::Killed => write!(f, "{} killed by signal {}", self.pid, self.status),
            ChildCode::Dumped => write!(f, "{} dumped core on signal {}", self.pid, self.status),
            ChildCode::Stopped => write!(f, "{} stopped by signal {}", self.pid, self.status),
            ChildCode::Trapped => write!(f, "{} trapped", self.pid),
            ChildCode::Continued => write!(f, "{} continued", self.pid),
        }
    }
}

struct RecordState {
    events: VecDeque<ChildEvent>,
    terminal: Option<ChildEvent>,
}

struct ChildRecord {
    state: Mutex<RecordState>,
    notify: Notify,
}

impl ChildRecord {
    fn new() -> Arc<ChildRecord> {
        Arc::new(ChildRecord {
            state: Mutex::new(RecordState {
                events: VecDeque::new(),
                terminal: None,
            }),
            notify: Notify::new(),
        })
    }

    fn push(&self, event: ChildEvent) {
        let mut state = self.state.lock().unwrap();
        if event.died() {
            state.terminal = Some(event);
        }
        state.events.push_back(event);
        drop(state);
        self.notify.notify_waiters();
    }
}

struct MonitorShared {
    ram: Ram,
    sigfd: AsyncFileDescriptor,
    is_reaper: bool,
    children: Mutex<HashMap<i32, Arc<ChildRecord>>>,
    broken: AtomicBool,
    /// Poked on registration: a child may have died between clone and
    /// register, with its SIGCHLD already drained.
    kick: Notify,
}

/// Watches SIGCHLD for one task and hands out per-child async waits.
#[derive(Clone)]
pub struct ChildProcessMonitor {
    shared: Arc<MonitorShared>,
    use_clone_parent: bool,
}

impl ChildProcessMonitor {
    /// Block SIGCHLD in the task, open a signalfd for it, and start
    /// the sweep loop. `is_reaper` marks the monitor of a pid-1
    /// process: it will see every orphan in its namespace, and its
    /// children cannot CLONE_PARENT, so it refuses to be inherited.
    pub async fn new(
        ram: Ram,
        epoller: &crate::asyncfd::Epoller,
        is_reaper: bool,
    ) -> Result<ChildProcessMonitor> {
        let mask = Sigset::with(libc::SIGCHLD);
        ram.sigprocmask_block(mask).await?;
        let sigfd_handle = ram
            .signalfd(mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
            .await?;
        let sigfd = AsyncFileDescriptor::new(epoller, sigfd_handle).await?;
        let shared = Arc::new(MonitorShared {
            ram,
            sigfd,
            is_reaper,
            children: Mutex::new(HashMap::new()),
            broken: AtomicBool::new(false),
            kick: Notify::new(),
        });
        tokio::spawn(sweep_loop(Arc::downgrade(&shared)));
        Ok(ChildProcessMonitor {
            shared,
            use_clone_parent: false,
        })
    }

    pub fn is_reaper(&self) -> bool {
        self.shared.is_reaper
    }

    /// Children registered through an inherited monitor must be
    /// cloned with CLONE_PARENT so their SIGCHLD reaches the task
    /// that owns the signalfd.
    pub fn needs_clone_parent(&self) -> bool {
        self.use_clone_parent
    }

    /// The task whose children this monitor observes.
    pub fn task(&self) -> &TaskRef {
        &self.shared.ram.task
    }

    /// Start monitoring a freshly spawned child.
    pub fn register(&self, pid: Pid) -> AsyncChildProcess {
        let record = ChildRecord::new();
        self.shared
            .children
            .lock()
            .unwrap()
            .insert(pid.0, record.clone());
        // Re-sweep: the child may already be a zombie whose SIGCHLD
        // we drained before it had a record.
        self.shared.kick.notify_one();
        AsyncChildProcess {
            pid,
            record,
            monitor: self.clone(),
        }
    }

    /// Share this monitor with a task that shares the signalfd's fd
    /// table. The child monitor's children are made with CLONE_PARENT
    /// so their exit notifications land on our signalfd. Refused for
    /// reapers: a child of pid 1 cannot CLONE_PARENT, and a reaper
    /// does not want grandchildren escaping to its own parent.
    pub fn inherit_to_child(&self, task: &TaskRef) -> Result<ChildProcessMonitor> {
        if self.shared.is_reaper {
            return Err(Error::invariant(
                "a reaper's monitor cannot be inherited; make a fresh one",
            ));
        }
        if task.fd_table != self.shared.ram.task.fd_table {
            return Err(Error::FdTableMismatch {
                fd: self.shared.sigfd.handle().near(),
                ours: self.shared.ram.task.fd_table.clone(),
                theirs: task.fd_table.clone(),
            });
        }
        Ok(ChildProcessMonitor {
            shared: self.shared.clone(),
            use_clone_parent: true,
        })
    }
}

/// Drain the signalfd, then sweep all waitable children and route
/// their events.
async fn sweep_loop(weak: Weak<MonitorShared>) {
    loop {
        let shared = match weak.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        if let Err(err) = sweep_once(&shared).await {
            tracing::debug!("child monitor stopping: {}", err);
            shared.broken.store(true, Ordering::SeqCst);
            let children = shared.children.lock().unwrap();
            for record in children.values() {
                record.notify.notify_waiters();
            }
            return;
        }
    }
}

async fn sweep_once(shared: &MonitorShared) -> Result<()> {
    tokio::select! {
        ready = shared.sigfd.wait_readable() => ready?,
        _ = shared.kick.notified() => {}
    }
    // Eat every queued siginfo; the sweep below is what actually
    // learns the states.
    let buf = shared.ram.malloc::<SignalfdSiginfo>().await?;
    loop {
        let ret = {
            let guard = buf.borrow(&shared.ram.task)?;
            shared
                .ram
                .task
                .sysif
                .syscall(
                    Sysno(libc::SYS_read as i64),
                    [
                        shared.sigfd.handle().near().into(),
                        guard.addr().into(),
                        SignalfdSiginfo::SIZE as i64,
                        0,
                        0,
                        0,
                    ],
                )
                .await
        };
        match ret {
            Ok(_) => continue,
            Err(err) if err.is_errno(Errno::EAGAIN) => break,
            Err(err) => return Err(err),
        }
    }
    loop {
        let options =
            libc::WNOHANG | libc::WEXITED | libc::WSTOPPED | libc::WCONTINUED | libc::WNOWAIT;
        let info = match shared.ram.waitid(libc::P_ALL as i32, 0, options).await {
            Ok(Some(info)) => info,
            Ok(None) => break,
            Err(err) if err.is_errno(Errno::ECHILD) => break,
            Err(err) => return Err(err),
        };
        let event = ChildEvent::from_siginfo(&info)?;
        tracing::debug!("child event: {}", event);
        let record = shared.children.lock().unwrap().get(&event.pid.0).cloned();
        // Consume what the WNOWAIT sweep left pending, or the next
        // iteration reports the same event again: reap the zombie, or
        // collect the stop/continue state. This applies to
        // unmonitored children too — detached handles, orphans we
        // inherited as a reaper — because a pending event we never
        // consume parks the P_ALL sweep on that child forever and
        // starves every registered waiter.
        let consume = if event.died() {
            libc::WEXITED | libc::WNOHANG
        } else {
            libc::WSTOPPED | libc::WCONTINUED | libc::WNOHANG
        };
        match shared
            .ram
            .waitid(libc::P_PID as i32, event.pid.0 as i64, consume)
            .await
        {
            Ok(_) => {}
            // Lost a race with the child vanishing; the sweep moves on.
            Err(err) if err.is_errno(Errno::ECHILD) => {}
            Err(err) => return Err(err),
        }
        match record {
            Some(record) => record.push(event),
            None => tracing::debug!("consumed event for unmonitored child: {}", event),
        }
    }
    Ok(())
}

/// The right to wait on one child.
///
/// Dropping this detaches: the monitor stops routing the child's
/// events, but still collects its corpse when it terminates.
pub struct AsyncChildProcess {
    pid: Pid,
    record: Arc<ChildRecord>,
    monitor: ChildProcessMonitor,
}

impl AsyncChildProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Next queued event of any kind (stops and continues included).
    pub async fn next_event(&self) -> Result<ChildEvent> {
        loop {
            let notified = self.record.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.record.state.lock().unwrap();
                if let Some(event) = state.events.pop_front() {
                    return Ok(event);
                }
            }
            if self.monitor.shared.broken.load(Ordering::SeqCst) {
                return Err(Error::TransportTerminal);
            }
            notified.await;
        }
    }

    /// Wait until the child terminates. Cancellation-safe: the event
    /// stays cached, and calling again returns it.
    pub async fn wait_for_exit(&self) -> Result<ChildEvent> {
        loop {
            let notified = self.record.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.record.state.lock().unwrap();
                if let Some(event) = state.terminal {
                    return Ok(event);
                }
            }
            if self.monitor.shared.broken.load(Ordering::SeqCst) {
                return Err(Error::TransportTerminal);
            }
            notified.await;
        }
    }

    /// Wait, then fail unless the exit was clean.
    pub async fn check(&self) -> Result<()> {
        self.wait_for_exit().await?.check()
    }

    pub async fn kill(&self, signal: i32) -> Result<()> {
        self.monitor.task().kill(self.pid, signal).await
    }
}

impl Drop for AsyncChildProcess {
    fn drop(&mut self) {
        self.monitor
            .shared
            .children
            .lock()
            .unwrap()
            .remove(&self.pid.0);
    }
}

impl fmt::Debug for AsyncChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AsyncChildProcess({})", self.pid)
    }
}
