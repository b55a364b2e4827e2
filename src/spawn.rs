//! Spawning tasks and bootstrapping their transports.
//!
//! A spawned task is a clone child running the agent loop on one end
//! of a socketpair, with a second socketpair as its memory channel.
//! The clone flags decide which kernel tables the child shares with
//! us, and therefore which identifier tokens the new [`Task`] clones
//! and which it mints fresh.

use crate::asyncfd::{AsyncFileDescriptor, Epoller};
use crate::conn::{ConnectionInterface, SyscallConnection};
use crate::error::{Error, Result};
use crate::mem::{Allocator, LocalMemoryTransport, Ram, SocketMemoryTransport};
use crate::monitor::{AsyncChildProcess, ChildProcessMonitor};
use crate::near::{AddressSpace, FdTable, MountNamespace, Pid, PidNamespace};
use crate::sysif::NativeSyscall;
use crate::task::{Task, TaskRef};
use bitflags::bitflags;
use static_assertions::const_assert_eq;
use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::sync::Arc;

bitflags! {
    /// What the spawned task shares with its parent, and which
    /// namespaces it gets fresh.
    pub struct SpawnFlags: u32 {
        /// Share our address space; the child is a thread of our
        /// memory and the local transport reaches it directly.
        const SHARE_VM = 1 << 0;
        /// Share our fd table.
        const SHARE_FILES = 1 << 1;
        /// New pid namespace; the child is pid 1 there.
        const NEW_PID = 1 << 2;
        /// New user namespace.
        const NEW_USER = 1 << 3;
        /// New mount namespace.
        const NEW_MOUNT = 1 << 4;
    }
}

/// The handshake sent once over a freshly accepted syscall channel:
/// the agent's pid, the fd numbers it will serve on, and how many
/// environment variables it carries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct BootstrapFrame {
    pub pid: i64,
    pub infd: i64,
    pub outfd: i64,
    pub memfd: i64,
    pub envp_count: i64,
}

pub const BOOTSTRAP_SIZE: usize = 40;
const_assert_eq!(std::mem::size_of::<BootstrapFrame>(), BOOTSTRAP_SIZE);

/// Role tags sent by a connecting parent so a listening agent knows
/// which connection is which, whatever order the forwarder delivers
/// them in.
pub const SYSCALL_CHANNEL_TAG: [u8; 8] = *b"farcsys\0";
pub const MEMORY_CHANNEL_TAG: [u8; 8] = *b"farcmem\0";

impl BootstrapFrame {
    pub fn encode(&self) -> [u8; BOOTSTRAP_SIZE] {
        let mut out = [0u8; BOOTSTRAP_SIZE];
        for (i, word) in [self.pid, self.infd, self.outfd, self.memfd, self.envp_count]
            .iter()
            .enumerate()
        {
            out[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn decode(data: &[u8; BOOTSTRAP_SIZE]) -> BootstrapFrame {
        let word = |i: usize| i64::from_le_bytes(data[i * 8..(i + 1) * 8].try_into().unwrap());
        BootstrapFrame {
            pid: word(0),
            infd: word(1),
            outfd: word(2),
            memfd: word(3),
            envp_count: word(4),
        }
    }
}

/// The root bundle: the calling process as a task, with its RAM,
/// epoller, and child monitor. Everything else is spawned from here.
pub struct Host {
    pub task: TaskRef,
    pub ram: Ram,
    pub epoller: Epoller,
    pub monitor: ChildProcessMonitor,
}

impl Host {
    pub async fn new() -> Result<Host> {
        let task = Task::new(
            Arc::new(NativeSyscall),
            Pid(unsafe { libc::getpid() }),
            FdTable::new(),
            AddressSpace::new_local(),
            MountNamespace::new(),
            PidNamespace::new(),
        );
        let allocator = Allocator::new(task.address_space.clone()).client(task.clone())?;
        let transport = Arc::new(LocalMemoryTransport::new(task.address_space.clone())?);
        let ram = Ram::new(task.clone(), transport, allocator);
        let epoller = Epoller::new(ram.clone(), None).await?;
        let monitor = ChildProcessMonitor::new(ram.clone(), &epoller, false).await?;
        Ok(Host {
            task,
            ram,
            epoller,
            monitor,
        })
    }

    pub async fn spawn_task(&self, flags: SpawnFlags) -> Result<ChildTask> {
        spawn_task(&self.ram, &self.epoller, &self.monitor, flags).await
    }
}

/// A spawned task with its transports attached.
pub struct ChildTask {
    pub task: TaskRef,
    pub ram: Ram,
    pub process: AsyncChildProcess,
}

impl ChildTask {
    pub async fn exit(&self, status: i32) -> Result<()> {
        self.task.exit(status).await
    }
}

const STACK_LEN: usize = 1 << 20;
const MAX_KEEP: usize = 3;

/// What the child entry point needs; written into the low end of the
/// child's stack mapping before clone, so no heap is involved.
#[repr(C)]
struct CloneArgs {
    infd: i32,
    outfd: i32,
    keep: [i32; MAX_KEEP],
    keep_count: usize,
    close_others: bool,
}

/// First code run in the child. No allocation, no libstd I/O; with
/// CLONE_VM we are a thread of the parent's memory and the runtime
/// state over there is not ours to touch.
extern "C" fn child_entry(arg: *mut c_void) -> c_int {
    let args = unsafe { &*(arg as *const CloneArgs) };
    if args.close_others {
        close_extraneous(&args.keep[..args.keep_count]);
    }
    crate::agent::server(args.infd, args.outfd);
    0
}

/// Close every fd above stderr except the listed ones, so that the
/// only copies of other channels' descriptors live with their owners
/// and EOF means what it should.
fn close_extraneous(keep: &[i32]) {
    let mut sorted = [i32::MAX; MAX_KEEP];
    sorted[..keep.len()].copy_from_slice(keep);
    sorted.sort_unstable();
    let mut lo: u32 = 3;
    for &fd in sorted.iter().take(keep.len()) {
        let fd = fd as u32;
        if fd > lo {
            close_range(lo, fd - 1);
        }
        lo = fd + 1;
    }
    close_range(lo, u32::MAX);
}

fn close_range(first: u32, last: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as u64,
            last as u64,
            0u64,
        );
    }
}

/// Clone a new task running the agent loop, wire up its syscall and
/// memory transports, and register it with the monitor.
///
/// The cloning task must be the root task: the clone itself runs in
/// this process. Remote machines are reached with
/// [`crate::ssh::SshHost`] instead.
pub async fn spawn_task(
    parent: &Ram,
    epoller: &Epoller,
    monitor: &ChildProcessMonitor,
    flags: SpawnFlags,
) -> Result<ChildTask> {
    if !parent.task.address_space.is_local() {
        return Err(Error::invariant("tasks are spawned from the root task"));
    }
    if flags.contains(SpawnFlags::NEW_PID) && monitor.needs_clone_parent() {
        return Err(Error::invariant(
            "a pid-namespace init cannot be cloned through an inherited monitor",
        ));
    }

    let share_vm = flags.contains(SpawnFlags::SHARE_VM);
    let share_files = flags.contains(SpawnFlags::SHARE_FILES);

    let (sys_local, sys_remote) = parent
        .socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
        .await?;
    let mem_pair = if share_vm {
        None
    } else {
        Some(
            parent
                .socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
                .await?,
        )
    };

    let sys_remote_num = sys_remote.near();
    let mem_remote_num = mem_pair.as_ref().map(|(_, remote)| remote.near());

    let mut clone_flags: c_int = 0;
    if share_vm {
        clone_flags |= libc::CLONE_VM | libc::CLONE_CHILD_SETTID | libc::CLONE_CHILD_CLEARTID;
    }
    if share_files {
        clone_flags |= libc::CLONE_FILES;
    }
    if flags.contains(SpawnFlags::NEW_PID) {
        clone_flags |= libc::CLONE_NEWPID;
    }
    if flags.contains(SpawnFlags::NEW_USER) {
        clone_flags |= libc::CLONE_NEWUSER;
    }
    if flags.contains(SpawnFlags::NEW_MOUNT) {
        clone_flags |= libc::CLONE_NEWNS;
    }
    if monitor.needs_clone_parent() {
        clone_flags |= libc::CLONE_PARENT;
    }

    // The child's stack; its low end doubles as the argument block
    // and the ctid word, which must stay mapped for as long as the
    // child (and its futex watcher) can touch them.
    let stack = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            STACK_LEN,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if stack == libc::MAP_FAILED {
        return Err(Error::from(nix::errno::Errno::last()));
    }
    let stack_base = stack as usize;
    let stack_top = (stack_base + STACK_LEN) as *mut c_void;

    let mut keep = [0i32; MAX_KEEP];
    let mut keep_count = 0;
    keep[keep_count] = sys_remote_num.0;
    keep_count += 1;
    if let Some(memfd) = mem_remote_num {
        keep[keep_count] = memfd.0;
        keep_count += 1;
    }
    let args = CloneArgs {
        infd: sys_remote_num.0,
        outfd: sys_remote_num.0,
        keep,
        keep_count,
        close_others: !share_files,
    };
    let args_ptr = stack_base as *mut CloneArgs;
    let ctid_ptr = (stack_base + 256) as *mut libc::pid_t;
    unsafe {
        std::ptr::write(args_ptr, args);
        // Nonzero until CLONE_CHILD_SETTID stores the real tid, so
        // the futex watcher cannot see a spurious zero.
        std::ptr::write(ctid_ptr, 1);
    }

    let pid = unsafe {
        libc::clone(
            child_entry,
            stack_top,
            clone_flags | libc::SIGCHLD,
            args_ptr as *mut c_void,
            std::ptr::null_mut::<libc::pid_t>(),
            std::ptr::null_mut::<c_void>(),
            ctid_ptr,
        )
    };
    if pid < 0 {
        let errno = nix::errno::Errno::last();
        unsafe { libc::munmap(stack, STACK_LEN) };
        return Err(Error::Bootstrap(format!("clone failed: {}", errno)));
    }
    let pid = Pid(pid);
    tracing::debug!("spawned agent {} with flags {:?}", pid, flags);
    let process = monitor.register(pid);

    // Identifier tokens: cloned when the kernel table is shared,
    // fresh when it is not.
    let fd_table = if share_files {
        parent.task.fd_table.clone()
    } else {
        FdTable::new()
    };
    let address_space = if share_vm {
        parent.task.address_space.clone()
    } else {
        AddressSpace::new()
    };
    let mount_ns = if flags.contains(SpawnFlags::NEW_MOUNT) {
        MountNamespace::new()
    } else {
        parent.task.mount_ns
    };
    let pid_ns = if flags.contains(SpawnFlags::NEW_PID) {
        PidNamespace::new()
    } else {
        parent.task.pid_ns
    };

    let sys_afd = Arc::new(AsyncFileDescriptor::new(epoller, sys_local).await?);
    let conn = SyscallConnection::new(sys_afd.clone(), sys_afd);
    let sysif: Arc<ConnectionInterface> = Arc::new(ConnectionInterface::new(conn, sys_remote_num));
    let task = Task::new(
        sysif.clone(),
        pid,
        fd_table,
        address_space,
        mount_ns,
        pid_ns,
    );

    // The agent's end of the syscall channel. With a shared table the
    // child serves on our very descriptor, so our reference transfers
    // to the child task; with a copied table the child has its own
    // copy and ours must close so the child's exit produces EOF.
    if share_files {
        let serving = sys_remote.move_to(&task)?;
        sysif.store_remote_handles(vec![serving]);
    } else {
        sys_remote.close().await?;
        sysif.store_remote_handles(vec![task.make_fd_handle(sys_remote_num)]);
    }

    let ram = if share_vm {
        parent.inherit(&task)?
    } else {
        let (mem_local, mem_remote) = match mem_pair {
            Some(pair) => pair,
            None => unreachable!(),
        };
        let mem_remote_handle = if share_files {
            mem_remote.move_to(&task)?
        } else {
            let num = mem_remote.near();
            mem_remote.close().await?;
            task.make_fd_handle(num)
        };
        let allocator = Allocator::new(task.address_space.clone()).client(task.clone())?;
        let mem_afd = AsyncFileDescriptor::new(epoller, mem_local).await?;
        let transport =
            SocketMemoryTransport::new(mem_afd, mem_remote_handle, Some(allocator.clone()));
        Ram::new(task.clone(), transport, allocator)
    };

    if share_vm {
        // A thread in our memory: when it execs or exits, its fds may
        // not deliver EOF (the table may be shared), but the kernel
        // clears and wakes the ctid futex. Watch it and declare the
        // interface dead.
        spawn_futex_watcher(ctid_ptr as usize, stack_base, sysif.clone());
    } else {
        // The child runs on a copy-on-write image of this stack; our
        // mapping can go.
        unsafe { libc::munmap(stack, STACK_LEN) };
    }

    Ok(ChildTask { task, ram, process })
}

/// Wait for the kernel to clear the child-tid word (exit or exec of a
/// CLONE_VM child), then tear down its interface and free its stack.
fn spawn_futex_watcher(ctid_addr: usize, stack_base: usize, sysif: Arc<ConnectionInterface>) {
    let waited = tokio::task::spawn_blocking(move || {
        let ctid = ctid_addr as *const i32;
        loop {
            let v = unsafe { std::ptr::read_volatile(ctid) };
            if v == 0 {
                return;
            }
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    ctid,
                    libc::FUTEX_WAIT,
                    v,
                    std::ptr::null::<libc::timespec>(),
                    0,
                    0,
                );
            }
        }
    });
    tokio::spawn(async move {
        let _ = waited.await;
        tracing::debug!("agent thread gone, breaking its interface");
        // No EOF will come on a shared table; fail the in-flight
        // calls (the exit syscall itself is usually among them).
        sysif.mark_dead();
        crate::sysif::SyscallInterface::close_interface(&*sysif).await;
        unsafe { libc::munmap(stack_base as *mut c_void, STACK_LEN) };
    });
}

/// Fork and exec a command, monitored like any other child. Used for
/// helper processes such as ssh.
pub fn spawn_command(monitor: &ChildProcessMonitor, argv: &[String]) -> Result<AsyncChildProcess> {
    if argv.is_empty() {
        return Err(Error::invariant("empty argv"));
    }
    let cargs: Vec<CString> = argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::invariant("NUL byte in argv"))?;
    match unsafe { nix::unistd::fork() }? {
        nix::unistd::ForkResult::Parent { child } => Ok(monitor.register(Pid(child.as_raw()))),
        nix::unistd::ForkResult::Child => {
            // In the child: only exec or die.
            let _ = nix::unistd::execvp(&cargs[0], &cargs);
            unsafe { libc::_exit(127) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_frame_round_trips() {
        let frame = BootstrapFrame {
            pid: 4242,
            infd: 3,
            outfd: 4,
            memfd: 5,
            envp_count: 31,
        };
        assert_eq!(BootstrapFrame::decode(&frame.encode()), frame);
    }

    #[test]
    fn spawn_flag_bits_are_disjoint() {
        let all = SpawnFlags::all();
        assert_eq!(
            all.bits().count_ones(),
            5,
            "each flag is its own bit: {:?}",
            all
        );
    }
}
