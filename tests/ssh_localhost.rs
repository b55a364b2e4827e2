//! Scenario: a task spawned over ssh to localhost opens and reads a
//! file, then exits and the interface goes terminal.
//!
//! Needs passwordless ssh to localhost and the agent binary built, so
//! it only runs when FARCALL_SSH_TEST is set:
//!
//!     cargo build --bin farcall-agent
//!     FARCALL_SSH_TEST=1 cargo test --test ssh_localhost

use farcall::spawn::Host;
use farcall::ssh::SshHost;
use farcall::Error;
use nix::sys::signal::{pthread_sigmask, SigSet, Signal, SigmaskHow};

fn agent_path() -> String {
    // The test binary lives in target/debug/deps; the agent next to
    // target/debug.
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("farcall-agent");
    path.to_str().unwrap().to_string()
}

async fn run() {
    let host = Host::new().await.unwrap();
    let remote = SshHost::new("localhost", agent_path())
        .spawn(&host)
        .await
        .unwrap();
    assert!(remote.bootstrap.envp_count > 0);

    let fd = remote
        .ram
        .open("/proc/self/statm", libc::O_RDONLY, 0)
        .await
        .unwrap();
    let data = remote.ram.read_to_vec(&fd, 128).await.unwrap();
    assert!(!data.is_empty());
    assert!(
        data.iter().all(|b| b.is_ascii_digit() || *b == b' ' || *b == b'\n'),
        "statm should be ascii: {:?}",
        data
    );
    fd.close().await.unwrap();

    remote.task.exit(0).await.unwrap();
    match remote.ram.open("/dev/null", libc::O_RDONLY, 0).await {
        Err(Error::TransportTerminal) => {}
        other => panic!("expected terminal interface, got {:?}", other.map(|_| ())),
    }
    let _ = remote.ssh_process.kill(libc::SIGTERM).await;
}

fn main() {
    if std::env::var_os("FARCALL_SSH_TEST").is_none() {
        println!("ssh scenario skipped (set FARCALL_SSH_TEST=1 to run)");
        return;
    }
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None).unwrap();
    // RUST_LOG=farcall=debug shows the ssh handshake and traffic.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(run());
    println!("ssh scenario passed");
}
