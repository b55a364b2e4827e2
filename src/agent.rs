//! The agent: the loop at the far end of a syscall channel.
//!
//! Reads fixed-size request frames, executes them with the raw
//! syscall instruction, writes single-word responses. The loop is
//! deliberately free of heap allocation and of libstd I/O so it can
//! run directly in a clone child that shares our address space, where
//! touching the allocator or any runtime state would be undefined.

use crate::conn::{SyscallFrame, REQUEST_SIZE, RESPONSE_SIZE};
use std::os::raw::c_long;
use std::os::unix::io::RawFd;

fn errno() -> i64 {
    unsafe { *libc::__errno_location() as i64 }
}

/// read(2) exactly `buf.len()` bytes. `Ok(false)` is a clean EOF on a
/// frame boundary; a partial frame or an error is `Err`.
fn read_full(fd: RawFd, buf: &mut [u8]) -> Result<bool, ()> {
    let mut done = 0usize;
    while done < buf.len() {
        let ret = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };
        if ret == 0 {
            return if done == 0 { Ok(false) } else { Err(()) };
        }
        if ret < 0 {
            if errno() == libc::EINTR as i64 {
                continue;
            }
            return Err(());
        }
        done += ret as usize;
    }
    Ok(true)
}

fn write_full(fd: RawFd, buf: &[u8]) -> Result<(), ()> {
    let mut done = 0usize;
    while done < buf.len() {
        let ret = unsafe {
            libc::write(
                fd,
                buf[done..].as_ptr() as *const libc::c_void,
                buf.len() - done,
            )
        };
        if ret < 0 {
            if errno() == libc::EINTR as i64 {
                continue;
            }
            return Err(());
        }
        done += ret as usize;
    }
    Ok(())
}

/// Execute one decoded request. Failed syscalls are reported the way
/// the kernel reports them to the transport's consumers: as the
/// negated errno.
pub fn execute(frame: &SyscallFrame) -> i64 {
    let ret = unsafe {
        libc::syscall(
            frame.sys as c_long,
            frame.args[0],
            frame.args[1],
            frame.args[2],
            frame.args[3],
            frame.args[4],
            frame.args[5],
        )
    };
    if ret == -1 {
        -errno()
    } else {
        ret as i64
    }
}

/// The frame loop: serve requests from `infd`, answer on `outfd`,
/// return on EOF or any channel error.
pub fn server(infd: RawFd, outfd: RawFd) {
    let mut frame = [0u8; REQUEST_SIZE];
    loop {
        match read_full(infd, &mut frame) {
            Ok(true) => {}
            Ok(false) | Err(()) => return,
        }
        let req = SyscallFrame::decode(&frame);
        let result = execute(&req);
        let response: [u8; RESPONSE_SIZE] = result.to_le_bytes();
        if write_full(outfd, &response).is_err() {
            return;
        }
    }
}

/// Receive a new (infd, outfd) pair over a connected socket via
/// SCM_RIGHTS, without allocating.
fn recv_fd_pair(conn: RawFd) -> Result<(RawFd, RawFd), ()> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: 1,
    };
    let mut cbuf = [0u8; 64];
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = cbuf.len();
    let ret = loop {
        let ret = unsafe { libc::recvmsg(conn, &mut hdr, 0) };
        if ret < 0 && errno() == libc::EINTR as i64 {
            continue;
        }
        break ret;
    };
    if ret <= 0 {
        return Err(());
    }
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&hdr);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(());
        }
        let data = libc::CMSG_DATA(cmsg) as *const RawFd;
        let n_fds =
            ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / std::mem::size_of::<RawFd>();
        if n_fds < 2 {
            return Err(());
        }
        Ok((*data, *data.add(1)))
    }
}

/// As [`server`], but on EOF accept a fresh connection on
/// `listenfd`, receive a replacement (infd, outfd) pair over it, and
/// resume serving. This is what lets a task outlive the process that
/// spawned it.
pub fn persistent_server(infd: RawFd, outfd: RawFd, listenfd: RawFd) {
    let mut current = (infd, outfd);
    loop {
        server(current.0, current.1);
        unsafe {
            libc::close(current.0);
            if current.1 != current.0 {
                libc::close(current.1);
            }
        }
        let conn = loop {
            let ret = unsafe { libc::accept(listenfd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if ret < 0 && errno() == libc::EINTR as i64 {
                continue;
            }
            break ret;
        };
        if conn < 0 {
            return;
        }
        match recv_fd_pair(conn) {
            Ok(pair) => {
                unsafe { libc::close(conn) };
                current = pair;
            }
            Err(()) => {
                unsafe { libc::close(conn) };
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_reports_negated_errno() {
        let bad = SyscallFrame {
            sys: libc::SYS_close as i64,
            args: [-1, 0, 0, 0, 0, 0],
        };
        assert_eq!(execute(&bad), -(libc::EBADF as i64));
    }

    #[test]
    fn execute_passes_results_through() {
        let frame = SyscallFrame {
            sys: libc::SYS_getpid as i64,
            args: [0; 6],
        };
        assert_eq!(execute(&frame), std::process::id() as i64);
    }

    #[test]
    fn server_round_trip_over_pipes() {
        let mut req_pipe = [0i32; 2];
        let mut resp_pipe = [0i32; 2];
        unsafe {
            assert_eq!(libc::pipe(req_pipe.as_mut_ptr()), 0);
            assert_eq!(libc::pipe(resp_pipe.as_mut_ptr()), 0);
        }
        let handle = std::thread::spawn(move || server(req_pipe[0], resp_pipe[1]));
        let frame = SyscallFrame {
            sys: libc::SYS_getpid as i64,
            args: [0; 6],
        };
        write_full(req_pipe[1], &frame.encode()).unwrap();
        let mut response = [0u8; RESPONSE_SIZE];
        read_full(resp_pipe[0], &mut response).unwrap();
        assert_eq!(
            i64::from_le_bytes(response),
            std::process::id() as i64
        );
        unsafe { libc::close(req_pipe[1]) };
        handle.join().unwrap();
        unsafe {
            libc::close(req_pipe[0]);
            libc::close(resp_pipe[0]);
            libc::close(resp_pipe[1]);
        }
    }
}
