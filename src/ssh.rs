//! Spawning tasks on other hosts over ssh.
//!
//! The agent binary runs remotely in listen mode on a Unix socket
//! that ssh forwards back to us. We connect to the forwarded socket
//! twice: the first connection becomes the syscall channel, the
//! second the memory channel. The agent then tells us, in the
//! bootstrap frame, its pid and the fd numbers it is serving on, and
//! from there the task works like any other.

use crate::asyncfd::AsyncFileDescriptor;
use crate::conn::{ConnectionInterface, SyscallConnection};
use crate::error::{Error, Result};
use crate::mem::{Allocator, Ram, SocketMemoryTransport};
use crate::monitor::AsyncChildProcess;
use crate::near::{
    AddressSpace, FdTable, FileDescriptor, MountNamespace, Pid, PidNamespace,
};
use crate::spawn::{
    spawn_command, BootstrapFrame, Host, BOOTSTRAP_SIZE, MEMORY_CHANNEL_TAG, SYSCALL_CHANNEL_TAG,
};
use crate::task::{Task, TaskRef};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::os::unix::io::IntoRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// A destination reachable with `ssh`, with the agent binary already
/// installed there.
pub struct SshHost {
    pub destination: String,
    pub agent_path: String,
}

/// A task running on another machine, plus the ssh process that
/// carries it. Killing the ssh child or exiting the task tears the
/// interface down.
pub struct SshTask {
    pub task: TaskRef,
    pub ram: Ram,
    pub ssh_process: AsyncChildProcess,
    pub bootstrap: BootstrapFrame,
}

impl SshHost {
    pub fn new(destination: impl Into<String>, agent_path: impl Into<String>) -> SshHost {
        SshHost {
            destination: destination.into(),
            agent_path: agent_path.into(),
        }
    }

    pub async fn spawn(&self, host: &Host) -> Result<SshTask> {
        let suffix = random_suffix();
        let local_path = std::env::temp_dir().join(format!(".farcall-{}.sock", suffix));
        let remote_path = format!("/tmp/.farcall-{}.sock", suffix);
        let local_str = local_path
            .to_str()
            .ok_or_else(|| Error::invariant("non-utf8 temp dir"))?
            .to_string();

        let argv: Vec<String> = vec![
            "ssh".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "ExitOnForwardFailure=yes".into(),
            "-o".into(),
            "StreamLocalBindUnlink=yes".into(),
            "-L".into(),
            format!("{}:{}", local_str, remote_path),
            self.destination.clone(),
            "--".into(),
            self.agent_path.clone(),
            "listen".into(),
            remote_path.clone(),
        ];
        tracing::debug!("spawning remote agent: {:?}", argv);
        let ssh_process = spawn_command(&host.monitor, &argv)?;

        let spawn_result = self.attach(host, &local_str, ssh_process.pid()).await;
        let _ = std::fs::remove_file(&local_path);
        match spawn_result {
            Ok((task, ram, bootstrap)) => Ok(SshTask {
                task,
                ram,
                ssh_process,
                bootstrap,
            }),
            Err(err) => {
                // The forward never came up; don't leave ssh around.
                let _ = ssh_process.kill(libc::SIGTERM).await;
                Err(err)
            }
        }
    }

    async fn attach(
        &self,
        host: &Host,
        local_path: &str,
        ssh_pid: Pid,
    ) -> Result<(TaskRef, Ram, BootstrapFrame)> {
        let mut sys_stream = self.connect(local_path).await?;
        sys_stream
            .write_all(&SYSCALL_CHANNEL_TAG)
            .await
            .map_err(|e| Error::Bootstrap(format!("sending channel tag: {}", e)))?;
        let mut mem_stream = self.connect(local_path).await?;
        mem_stream
            .write_all(&MEMORY_CHANNEL_TAG)
            .await
            .map_err(|e| Error::Bootstrap(format!("sending channel tag: {}", e)))?;

        let mut raw = [0u8; BOOTSTRAP_SIZE];
        sys_stream
            .read_exact(&mut raw)
            .await
            .map_err(|e| Error::Bootstrap(format!("reading bootstrap frame: {}", e)))?;
        let bootstrap = BootstrapFrame::decode(&raw);
        tracing::debug!(
            "remote agent up via {}: pid {} serving fds {}/{}",
            ssh_pid,
            bootstrap.pid,
            bootstrap.infd,
            bootstrap.memfd
        );

        // From here the streams are raw channel fds in our table.
        let sys_fd = sys_stream
            .into_std()
            .map_err(Error::Io)?
            .into_raw_fd();
        let mem_fd = mem_stream
            .into_std()
            .map_err(Error::Io)?
            .into_raw_fd();
        let sys_afd = Arc::new(
            AsyncFileDescriptor::new(
                &host.epoller,
                host.task.make_fd_handle(FileDescriptor(sys_fd)),
            )
            .await?,
        );
        let mem_afd = AsyncFileDescriptor::new(
            &host.epoller,
            host.task.make_fd_handle(FileDescriptor(mem_fd)),
        )
        .await?;

        let conn = SyscallConnection::new(sys_afd.clone(), sys_afd);
        let sysif = Arc::new(ConnectionInterface::new(
            conn,
            FileDescriptor(bootstrap.infd as i32),
        ));
        let task = Task::new(
            sysif.clone(),
            // Meaningful in the remote pid namespace, not ours.
            Pid(bootstrap.pid as i32),
            FdTable::new(),
            AddressSpace::new(),
            MountNamespace::new(),
            PidNamespace::new(),
        );
        sysif.store_remote_handles(vec![
            task.make_fd_handle(FileDescriptor(bootstrap.infd as i32)),
            task.make_fd_handle(FileDescriptor(bootstrap.memfd as i32)),
        ]);
        let allocator = Allocator::new(task.address_space.clone()).client(task.clone())?;
        let mem_remote = task.make_fd_handle(FileDescriptor(bootstrap.memfd as i32));
        let transport = SocketMemoryTransport::new(mem_afd, mem_remote, Some(allocator.clone()));
        let ram = Ram::new(task.clone(), transport, allocator);
        Ok((task, ram, bootstrap))
    }

    /// The forwarded socket appears whenever ssh gets around to it;
    /// poll for it.
    async fn connect(&self, path: &str) -> Result<UnixStream> {
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Bootstrap(format!(
                            "forwarded socket {} never came up: {}",
                            path, err
                        )));
                    }
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        }
    }
}
