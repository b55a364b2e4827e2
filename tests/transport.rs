//! Transport behavior against an in-process echo agent: a thread
//! that reads request frames off a socketpair and answers each with
//! its first argument.

use farcall::conn::{ConnectionInterface, SyscallConnection, SyscallFrame, REQUEST_SIZE};
use farcall::asyncfd::AsyncFileDescriptor;
use farcall::spawn::Host;
use farcall::sysif::SyscallInterface;
use farcall::{Error, FileDescriptor, Sysno};
use std::io::{Read, Write};
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

/// Marker syscall number that makes the echo agent stall before
/// responding.
const SLOW: i64 = -999;

fn start_echo_agent() -> (i32, std::thread::JoinHandle<()>) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let handle = std::thread::spawn(move || {
        let mut stream = theirs;
        let mut frame = [0u8; REQUEST_SIZE];
        loop {
            if stream.read_exact(&mut frame).is_err() {
                return;
            }
            let req = SyscallFrame::decode(&frame);
            if req.sys == SLOW {
                std::thread::sleep(Duration::from_millis(200));
            }
            if stream.write_all(&req.args[0].to_le_bytes()).is_err() {
                return;
            }
        }
    });
    (ours.into_raw_fd(), handle)
}

async fn echo_interface(host: &Host) -> ConnectionInterface {
    let (fd, _handle) = start_echo_agent();
    let afd = Arc::new(
        AsyncFileDescriptor::new(&host.epoller, host.task.make_fd_handle(FileDescriptor(fd)))
            .await
            .unwrap(),
    );
    let conn = SyscallConnection::new(afd.clone(), afd);
    ConnectionInterface::new(conn, FileDescriptor(fd))
}

#[tokio::test]
async fn echo_round_trip_then_terminal_after_close() {
    let host = Host::new().await.unwrap();
    let iface = echo_interface(&host).await;
    let ret = iface.syscall(Sysno(0), [42, 0, 0, 0, 0, 0]).await.unwrap();
    assert_eq!(ret, 42);
    iface.close_interface().await;
    match iface.syscall(Sysno(0), [42, 0, 0, 0, 0, 0]).await {
        Err(Error::TransportTerminal) => {}
        other => panic!("expected terminal error, got {:?}", other),
    }
}

#[tokio::test]
async fn responses_arrive_in_submission_order() {
    let host = Host::new().await.unwrap();
    let iface = Arc::new(echo_interface(&host).await);
    let mut calls = Vec::new();
    for i in 0..64i64 {
        let iface = iface.clone();
        calls.push(tokio::spawn(async move {
            let ret = iface.syscall(Sysno(0), [i + 1, 0, 0, 0, 0, 0]).await.unwrap();
            assert_eq!(ret, i + 1);
        }));
    }
    for call in calls {
        call.await.unwrap();
    }
}

#[tokio::test]
async fn pipelined_submissions_match_by_position() {
    let host = Host::new().await.unwrap();
    let iface = echo_interface(&host).await;
    let a = iface.submit(Sysno(0), [10, 0, 0, 0, 0, 0]).await.unwrap();
    let b = iface.submit(Sysno(0), [20, 0, 0, 0, 0, 0]).await.unwrap();
    let c = iface.submit(Sysno(0), [30, 0, 0, 0, 0, 0]).await.unwrap();
    // Await out of order; each still gets its own slot's value.
    assert_eq!(c.receive().await.unwrap(), 30);
    assert_eq!(a.receive().await.unwrap(), 10);
    assert_eq!(b.receive().await.unwrap(), 20);
}

#[tokio::test]
async fn cancelled_call_does_not_shift_the_fifo() {
    let host = Host::new().await.unwrap();
    let iface = echo_interface(&host).await;
    // A syscall whose response is slow; give up on it quickly.
    let slow = iface.syscall(Sysno(SLOW), [999, 0, 0, 0, 0, 0]);
    let cancelled = tokio::time::timeout(Duration::from_millis(10), slow).await;
    assert!(cancelled.is_err(), "slow call should have timed out");
    // The next caller must see its own response, not the stale 999.
    let ret = iface.syscall(Sysno(0), [7, 0, 0, 0, 0, 0]).await.unwrap();
    assert_eq!(ret, 7);
}

#[tokio::test]
async fn errno_results_become_typed_errors() {
    let host = Host::new().await.unwrap();
    let iface = echo_interface(&host).await;
    let err = iface
        .syscall(Sysno(0), [-(libc::ENOENT as i64), 0, 0, 0, 0, 0])
        .await
        .unwrap_err();
    assert!(err.is_errno(nix::errno::Errno::ENOENT), "{}", err);
}
