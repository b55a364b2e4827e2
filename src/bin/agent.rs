//! The agent binary: the program at the far end of a syscall channel.
//!
//! `server` serves an already-connected fd pair (how a vfork+exec
//! parent hands us our channel). `listen` binds a Unix socket, waits
//! for the parent to connect its syscall and memory channels, sends
//! the bootstrap frame, and serves; this is the mode ssh forwarding
//! uses. `persistent` keeps the process alive across parent exits by
//! accepting replacement channels on a listening socket.

use farcall::agent;
use farcall::spawn::{BootstrapFrame, MEMORY_CHANNEL_TAG, SYSCALL_CHANNEL_TAG};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process::exit;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "farcall-agent", about = "serve remote syscalls")]
enum Cmd {
    /// Serve requests from infd, answering on outfd.
    Server { infd: RawFd, outfd: RawFd },
    /// Bind a Unix socket, accept the syscall and memory channels,
    /// send the bootstrap frame, and serve.
    Listen { path: PathBuf },
    /// Serve an initial fd pair, then accept replacement pairs on a
    /// listening socket whenever the current one reaches EOF.
    Persistent {
        infd: RawFd,
        outfd: RawFd,
        path: PathBuf,
    },
}

fn read_tag(stream: &mut UnixStream) -> std::io::Result<[u8; 8]> {
    let mut tag = [0u8; 8];
    stream.read_exact(&mut tag)?;
    Ok(tag)
}

fn listen(path: &PathBuf) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    let mut syscall_conn: Option<UnixStream> = None;
    let mut memory_conn: Option<UnixStream> = None;
    while syscall_conn.is_none() || memory_conn.is_none() {
        let (mut stream, _) = listener.accept()?;
        match read_tag(&mut stream)? {
            tag if tag == SYSCALL_CHANNEL_TAG => syscall_conn = Some(stream),
            tag if tag == MEMORY_CHANNEL_TAG => memory_conn = Some(stream),
            tag => {
                eprintln!("farcall-agent: unknown channel tag {:?}", tag);
            }
        }
    }
    // Accepted both; the socket has done its job.
    drop(listener);
    let _ = std::fs::remove_file(path);

    let mut syscall_conn = match syscall_conn {
        Some(conn) => conn,
        None => unreachable!(),
    };
    let memory_conn = match memory_conn {
        Some(conn) => conn,
        None => unreachable!(),
    };
    let sys_fd = syscall_conn.as_raw_fd();
    let frame = BootstrapFrame {
        pid: std::process::id() as i64,
        infd: sys_fd as i64,
        outfd: sys_fd as i64,
        memfd: memory_conn.as_raw_fd() as i64,
        envp_count: std::env::vars_os().count() as i64,
    };
    syscall_conn.write_all(&frame.encode())?;

    // The memory channel is driven purely by remote syscalls on its
    // fd; we just have to keep it open.
    let memory_fd = memory_conn.into_raw_fd();
    let sys_fd = syscall_conn.into_raw_fd();
    agent::server(sys_fd, sys_fd);
    unsafe {
        libc::close(memory_fd);
        libc::close(sys_fd);
    }
    Ok(())
}

fn main() {
    match Cmd::from_args() {
        Cmd::Server { infd, outfd } => {
            agent::server(infd, outfd);
        }
        Cmd::Listen { path } => {
            if let Err(err) = listen(&path) {
                eprintln!("farcall-agent: {}", err);
                exit(1);
            }
        }
        Cmd::Persistent { infd, outfd, path } => {
            let listener = match UnixListener::bind(&path) {
                Ok(listener) => listener,
                Err(err) => {
                    eprintln!("farcall-agent: binding {}: {}", path.display(), err);
                    exit(1);
                }
            };
            let listenfd = listener.into_raw_fd();
            agent::persistent_server(infd, outfd, listenfd);
        }
    }
}
