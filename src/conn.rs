//! The syscall frame transport.
//!
//! Requests are 56-byte frames (`{ i64 sys; i64 args[6]; }`), written
//! to the agent in submission order with no other framing; responses
//! are single i64 results read back in the same order. The connection
//! keeps a FIFO of promise slots: whoever submitted n-th receives the
//! n-th response. A dedicated reader consumes responses no matter
//! what the submitters do, so a cancelled caller can never shift the
//! FIFO for everyone behind it.

use crate::asyncfd::AsyncFileDescriptor;
use crate::error::{Error, Result};
use crate::fd::FdHandle;
use crate::near::{FileDescriptor, Sysno};
use crate::sysif::{PendingResponse, SyscallInterface};
use async_trait::async_trait;
use static_assertions::const_assert_eq;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

pub const REQUEST_SIZE: usize = 56;
pub const RESPONSE_SIZE: usize = 8;

/// One request frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct SyscallFrame {
    pub sys: i64,
    pub args: [i64; 6],
}

const_assert_eq!(std::mem::size_of::<SyscallFrame>(), REQUEST_SIZE);

impl SyscallFrame {
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut out = [0u8; REQUEST_SIZE];
        out[0..8].copy_from_slice(&self.sys.to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            out[8 + i * 8..16 + i * 8].copy_from_slice(&arg.to_le_bytes());
        }
        out
    }

    pub fn decode(data: &[u8; REQUEST_SIZE]) -> SyscallFrame {
        let mut args = [0i64; 6];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = i64::from_le_bytes(data[8 + i * 8..16 + i * 8].try_into().unwrap());
        }
        SyscallFrame {
            sys: i64::from_le_bytes(data[0..8].try_into().unwrap()),
            args,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ConnState {
    Open,
    Closing,
    Closed,
}

struct WriteSide {
    state: ConnState,
    tofd: Option<Arc<AsyncFileDescriptor>>,
}

struct Pending {
    queue: VecDeque<oneshot::Sender<Result<i64>>>,
    broken: bool,
}

struct ConnInner {
    write: tokio::sync::Mutex<WriteSide>,
    pending: Mutex<Pending>,
    drained: Notify,
}

impl ConnInner {
    fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.broken = true;
        while let Some(tx) = pending.queue.pop_front() {
            let _ = tx.send(Err(Error::TransportTerminal));
        }
    }
}

/// A pipelined request/response channel to one agent.
#[derive(Clone)]
pub struct SyscallConnection {
    inner: Arc<ConnInner>,
}

impl SyscallConnection {
    /// Build over the local ends of the channel. `tofd` carries
    /// requests toward the agent, `fromfd` carries responses back;
    /// they may be the same descriptor when one socket serves both
    /// directions.
    pub fn new(
        tofd: Arc<AsyncFileDescriptor>,
        fromfd: Arc<AsyncFileDescriptor>,
    ) -> SyscallConnection {
        let inner = Arc::new(ConnInner {
            write: tokio::sync::Mutex::new(WriteSide {
                state: ConnState::Open,
                tofd: Some(tofd),
            }),
            pending: Mutex::new(Pending {
                queue: VecDeque::new(),
                broken: false,
            }),
            drained: Notify::new(),
        });
        tokio::spawn(read_responses(inner.clone(), fromfd));
        SyscallConnection {
            inner,
        }
    }

    /// Write one frame and reserve its response slot.
    pub async fn write_request(&self, frame: SyscallFrame) -> Result<PendingResponse> {
        let write = self.inner.write.lock().await;
        if write.state != ConnState::Open {
            return Err(Error::TransportTerminal);
        }
        let tofd = match &write.tofd {
            Some(tofd) => tofd.clone(),
            None => return Err(Error::TransportTerminal),
        };
        // The slot must be queued before the frame can reach the
        // agent, or a fast response could find nobody waiting.
        let rx = {
            let mut pending = self.inner.pending.lock().unwrap();
            if pending.broken {
                return Err(Error::TransportTerminal);
            }
            let (tx, rx) = oneshot::channel();
            pending.queue.push_back(tx);
            rx
        };
        if let Err(err) = tofd.write_bytes_all(&frame.encode()).await {
            tracing::debug!("request write failed: {}", err);
            self.inner.fail_all_pending();
            return Err(Error::TransportTerminal);
        }
        drop(write);
        Ok(PendingResponse::channel(rx))
    }

    /// Declare the agent dead right now: fail everything pending and
    /// reject everything future. For channels that cannot deliver EOF
    /// (a shared fd table keeps the far ends open), an outside death
    /// notice arrives this way.
    pub fn break_off(&self) {
        self.inner.fail_all_pending();
        self.inner.drained.notify_waiters();
    }

    /// Stop accepting submissions, let the in-flight ones drain, then
    /// close our ends. Not undoable.
    pub async fn close(&self) {
        {
            let mut write = self.inner.write.lock().await;
            match write.state {
                ConnState::Closed => return,
                _ => write.state = ConnState::Closing,
            }
        }
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let pending = self.inner.pending.lock().unwrap();
                if pending.queue.is_empty() || pending.broken {
                    break;
                }
            }
            drained.await;
        }
        let mut write = self.inner.write.lock().await;
        write.state = ConnState::Closed;
        if let Some(tofd) = write.tofd.take() {
            if let Ok(tofd) = Arc::try_unwrap(tofd) {
                if let Err(err) = tofd.close().await {
                    tracing::debug!("closing request fd: {}", err);
                }
            }
        }
    }
}

/// The reader driver: consume responses in FIFO order forever.
async fn read_responses(inner: Arc<ConnInner>, fromfd: Arc<AsyncFileDescriptor>) {
    let mut buf = [0u8; RESPONSE_SIZE];
    loop {
        let mut done = 0;
        while done < RESPONSE_SIZE {
            match fromfd.read_bytes(&mut buf[done..]).await {
                Ok(0) if done == 0 => {
                    // Clean EOF: the agent went away. Anything still
                    // queued will never be answered.
                    inner.fail_all_pending();
                    inner.drained.notify_waiters();
                    return;
                }
                Ok(0) => {
                    tracing::warn!("partial response frame ({} of {} bytes)", done, RESPONSE_SIZE);
                    inner.fail_all_pending();
                    inner.drained.notify_waiters();
                    return;
                }
                Ok(n) => done += n,
                Err(err) => {
                    tracing::debug!("response read failed: {}", err);
                    inner.fail_all_pending();
                    inner.drained.notify_waiters();
                    return;
                }
            }
        }
        let result = i64::from_le_bytes(buf);
        let slot = inner.pending.lock().unwrap().queue.pop_front();
        match slot {
            Some(tx) => {
                // The submitter may be gone; the response is consumed
                // either way, which is what keeps the FIFO aligned.
                let _ = tx.send(Ok(result));
            }
            None => {
                tracing::warn!("response {} with no outstanding request", result);
                inner.fail_all_pending();
                return;
            }
        }
        if inner.pending.lock().unwrap().queue.is_empty() {
            inner.drained.notify_waiters();
        }
    }
}

/// A [`SyscallInterface`] over a [`SyscallConnection`].
///
/// For breakage to be detectable, the far ends of the connection
/// should be held only by the remote task, so that its exit produces
/// EOF here. The remote-side handles are parked in this struct so the
/// fd table bookkeeping knows the numbers stay referenced.
pub struct ConnectionInterface {
    conn: SyscallConnection,
    activity: FileDescriptor,
    // Far-side handles, kept so the numbers are not reused while the
    // agent runs. Installed after the task exists to own them.
    remote_handles: Mutex<Vec<FdHandle>>,
}

impl ConnectionInterface {
    pub fn new(conn: SyscallConnection, activity: FileDescriptor) -> ConnectionInterface {
        ConnectionInterface {
            conn,
            activity,
            remote_handles: Mutex::new(Vec::new()),
        }
    }

    /// Park the handles for the agent's own channel fds so they stay
    /// accounted for while the agent serves on them.
    pub fn store_remote_handles(&self, handles: Vec<FdHandle>) {
        *self.remote_handles.lock().unwrap() = handles;
    }

    /// See [`SyscallConnection::break_off`].
    pub fn mark_dead(&self) {
        self.conn.break_off();
    }
}

#[async_trait]
impl SyscallInterface for ConnectionInterface {
    async fn submit(&self, nr: Sysno, args: [i64; 6]) -> Result<PendingResponse> {
        self.conn
            .write_request(SyscallFrame { sys: nr.0, args })
            .await
    }

    async fn close_interface(&self) {
        self.conn.close().await;
    }

    fn activity_fd(&self) -> Option<FileDescriptor> {
        Some(self.activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_is_seven_le_words() {
        let frame = SyscallFrame {
            sys: libc::SYS_openat as i64,
            args: [1, 2, 3, 4, 5, 6],
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), REQUEST_SIZE);
        assert_eq!(
            i64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            libc::SYS_openat as i64
        );
        assert_eq!(i64::from_le_bytes(bytes[48..56].try_into().unwrap()), 6);
        assert_eq!(SyscallFrame::decode(&bytes), frame);
    }
}
