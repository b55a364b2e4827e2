//! End-to-end scenarios against real clone-spawned agents.
//!
//! No test harness here: SIGCHLD has to be blocked before any other
//! thread exists so the monitor's signalfd sees every child, and the
//! scenarios share one root Host, so they run sequentially under one
//! current-thread runtime.

use farcall::serialize::Bytes;
use farcall::spawn::{Host, SpawnFlags};
use farcall::{ChildTask, Error};
use nix::sys::signal::{pthread_sigmask, SigSet, Signal, SigmaskHow};

fn block_sigchld() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None).unwrap();
}

async fn scenario_agent_executes_syscalls(host: &Host) {
    let child = host.spawn_task(SpawnFlags::empty()).await.unwrap();
    let pid = child.task.getpid().await.unwrap();
    assert_eq!(pid, child.process.pid());
    child.exit(0).await.unwrap();
    child.process.check().await.unwrap();
    // The channel is gone with the agent.
    match child.task.getpid().await {
        Err(Error::TransportTerminal) => {}
        other => panic!("expected terminal interface, got {:?}", other),
    }
}

async fn scenario_pipe_through_remote_memory(host: &Host) {
    let child = host.spawn_task(SpawnFlags::empty()).await.unwrap();
    let (r, w) = child.ram.pipe2(libc::O_CLOEXEC).await.unwrap();
    child.ram.write_all(&w, b"hello").await.unwrap();
    let data = child.ram.read_to_vec(&r, 5).await.unwrap();
    assert_eq!(data, b"hello");
    w.close().await.unwrap();
    r.close().await.unwrap();
    child.exit(0).await.unwrap();
}

async fn scenario_dup3_replaces_the_open_file(host: &Host) {
    let child = host.spawn_task(SpawnFlags::empty()).await.unwrap();
    let null = child.ram.open("/dev/null", libc::O_RDONLY, 0).await.unwrap();
    let zero = child.ram.open("/dev/zero", libc::O_RDONLY, 0).await.unwrap();
    // Reading /dev/zero fills the buffer...
    assert_eq!(child.ram.read_to_vec(&zero, 16).await.unwrap(), vec![0; 16]);
    // ...until its slot is replaced with /dev/null, which is EOF.
    let replaced = null.dup3(zero, 0).await.unwrap();
    assert_eq!(child.ram.read_to_vec(&replaced, 16).await.unwrap().len(), 0);
    replaced.close().await.unwrap();
    null.close().await.unwrap();
    child.exit(0).await.unwrap();
}

async fn scenario_batched_adjacent_writes(host: &Host) {
    let child = host.spawn_task(SpawnFlags::empty()).await.unwrap();
    let buf = child.ram.malloc_bytes(16).await.unwrap();
    let (p1, p2) = buf.split(8).unwrap();
    child
        .ram
        .transport
        .batch_write(vec![
            (p1.span(), vec![b'A'; 8]),
            (p2.span(), vec![b'B'; 8]),
        ])
        .await
        .unwrap();
    let whole = p1.merge(p2).unwrap();
    assert_eq!(whole.read().await.unwrap(), Bytes(b"AAAAAAAABBBBBBBB".to_vec()));
    child.exit(0).await.unwrap();
}

async fn scenario_remote_mappings(host: &Host) {
    let child = host.spawn_task(SpawnFlags::empty()).await.unwrap();
    let mapping = child
        .task
        .mmap_anonymous(1 << 16, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE)
        .await
        .unwrap();
    let region = mapping.region();
    assert_ne!(region.addr.0, 0);
    assert_eq!(region.len, 1 << 16);
    mapping.munmap().await.unwrap();
    // A dropped mapping is parked, and reaping unmaps it.
    let parked = child
        .task
        .mmap_anonymous(1 << 16, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE)
        .await
        .unwrap();
    drop(parked);
    child.task.reap_dropped_mappings().await.unwrap();
    child.exit(0).await.unwrap();
}

async fn scenario_monitor_reports_exits(host: &Host) {
    let child = host.spawn_task(SpawnFlags::empty()).await.unwrap();
    child.exit(7).await.unwrap();
    match child.process.check().await {
        Err(Error::Child(event)) => {
            assert_eq!(event.status, 7);
            assert!(event.died());
        }
        other => panic!("expected exit status 7, got {:?}", other),
    }

    let victim = host.spawn_task(SpawnFlags::empty()).await.unwrap();
    victim.process.kill(libc::SIGTERM).await.unwrap();
    match victim.process.check().await {
        Err(Error::Child(event)) => assert_eq!(event.status, libc::SIGTERM),
        other => panic!("expected SIGTERM death, got {:?}", other),
    }

    // A detached child's exit must not wedge the sweep: watchers of
    // other children still get their events afterwards.
    let detached = host.spawn_task(SpawnFlags::empty()).await.unwrap();
    let watched = host.spawn_task(SpawnFlags::empty()).await.unwrap();
    drop(detached.process);
    detached.task.exit(3).await.unwrap();
    watched.exit(0).await.unwrap();
    watched.process.check().await.unwrap();
}

async fn scenario_thread_shares_our_memory(host: &Host) {
    let thread: ChildTask = host
        .spawn_task(SpawnFlags::SHARE_VM | SpawnFlags::SHARE_FILES)
        .await
        .unwrap();
    assert_eq!(thread.task.address_space, host.task.address_space);
    // Its memory is our memory: the local transport serves it.
    let ptr = thread.ram.ptr(Bytes(b"shared".to_vec())).await.unwrap();
    assert_eq!(ptr.read().await.unwrap(), Bytes(b"shared".to_vec()));
    let pid = thread.task.getpid().await.unwrap();
    assert_eq!(pid, thread.process.pid());
    thread.exit(0).await.unwrap();
    thread.process.check().await.unwrap();
}

async fn run() {
    let host = Host::new().await.unwrap();
    scenario_agent_executes_syscalls(&host).await;
    eprintln!("agent_executes_syscalls: ok");
    scenario_pipe_through_remote_memory(&host).await;
    eprintln!("pipe_through_remote_memory: ok");
    scenario_dup3_replaces_the_open_file(&host).await;
    eprintln!("dup3_replaces_the_open_file: ok");
    scenario_batched_adjacent_writes(&host).await;
    eprintln!("batched_adjacent_writes: ok");
    scenario_remote_mappings(&host).await;
    eprintln!("remote_mappings: ok");
    scenario_monitor_reports_exits(&host).await;
    eprintln!("monitor_reports_exits: ok");
    scenario_thread_shares_our_memory(&host).await;
    eprintln!("thread_shares_our_memory: ok");
}

fn main() {
    block_sigchld();
    // RUST_LOG=farcall=debug shows the syscall traffic per scenario.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(run());
    println!("all spawned-task scenarios passed");
}
