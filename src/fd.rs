//! Owning file descriptor handles.
//!
//! The kernel refcounts open files, not descriptor numbers; we want
//! several handles to be able to refer to one number in one table, so
//! the library keeps its own per-table count and only issues close(2)
//! when the last handle for a number goes away.
//!
//! Handles are linear: operations that invalidate a handle take it by
//! value, so a consumed handle cannot be named again. Dropping a
//! handle without closing it gives up its reference; if that was the
//! last one, the number is parked on the table's garbage list and
//! closed by the next [`crate::task::Task::reap_dropped_fds`] call.

use crate::error::{Error, Result};
use crate::near::{FileDescriptor, Sysno};
use crate::task::{Task, TaskRef};
use std::collections::HashMap;
use std::sync::Mutex;

/// Shared per-table bookkeeping, hanging off [`crate::near::FdTable`].
pub struct FdTableState {
    counts: Mutex<HashMap<i32, usize>>,
    garbage: Mutex<Vec<i32>>,
}

impl FdTableState {
    pub(crate) fn new() -> FdTableState {
        FdTableState {
            counts: Mutex::new(HashMap::new()),
            garbage: Mutex::new(Vec::new()),
        }
    }

    fn incref(&self, fd: FileDescriptor) {
        *self.counts.lock().unwrap().entry(fd.0).or_insert(0) += 1;
    }

    /// Drop one reference; true if that was the last one.
    fn decref(&self, fd: FileDescriptor) -> bool {
        let mut counts = self.counts.lock().unwrap();
        match counts.get_mut(&fd.0) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => {
                counts.remove(&fd.0);
                true
            }
            None => false,
        }
    }

    fn count(&self, fd: FileDescriptor) -> usize {
        self.counts.lock().unwrap().get(&fd.0).copied().unwrap_or(0)
    }

    fn park(&self, fd: FileDescriptor) {
        self.garbage.lock().unwrap().push(fd.0);
    }

    pub(crate) fn take_garbage(&self) -> Vec<i32> {
        std::mem::take(&mut *self.garbage.lock().unwrap())
    }
}

/// An owning reference to one kernel fd within one fd table.
pub struct FdHandle {
    task: TaskRef,
    near: FileDescriptor,
    defused: bool,
}

impl FdHandle {
    /// Mint a handle for a raw number. The caller asserts the number
    /// is live in the task's table.
    pub(crate) fn new(task: TaskRef, near: FileDescriptor) -> FdHandle {
        task.fd_table.state.incref(near);
        FdHandle {
            task,
            near,
            defused: false,
        }
    }

    pub fn near(&self) -> FileDescriptor {
        self.near
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    /// Check this handle may be used from `other`'s fd table.
    pub fn check_is_for(&self, other: &Task) -> Result<()> {
        if self.task.fd_table != other.fd_table {
            return Err(Error::FdTableMismatch {
                fd: self.near,
                ours: self.task.fd_table.clone(),
                theirs: other.fd_table.clone(),
            });
        }
        Ok(())
    }

    /// Give up this handle's reference without closing, without
    /// parking. Used when the reference is transferred or the number
    /// was replaced by the kernel.
    fn defuse(mut self) -> bool {
        self.defused = true;
        self.task.fd_table.state.decref(self.near)
    }

    /// Drop our reference; close(2) the number when it was the last.
    pub async fn close(self) -> Result<()> {
        let task = self.task.clone();
        let near = self.near;
        if self.defuse() {
            task.sysif
                .syscall(Sysno(libc::SYS_close as i64), [near.into(), 0, 0, 0, 0, 0])
                .await?;
        }
        Ok(())
    }

    /// Dup this fd over `target`'s number. The target handle is
    /// consumed: the kernel has already replaced what its number
    /// refers to. Returns the fresh handle for that number.
    ///
    /// The target must be the only handle for its number; otherwise
    /// surviving handles would silently change referent.
    pub async fn dup3(&self, target: FdHandle, flags: i32) -> Result<FdHandle> {
        target.check_is_for(&self.task)?;
        if self.task.fd_table.state.count(target.near()) != 1 {
            return Err(Error::invariant(format!(
                "dup3 target {} has other live handles",
                target.near()
            )));
        }
        if self.near == target.near {
            return Err(Error::invariant("dup3 onto the same fd number"));
        }
        let num = target.near();
        target.defuse();
        self.task
            .sysif
            .syscall(
                Sysno(libc::SYS_dup3 as i64),
                [self.near.into(), num.into(), flags as i64, 0, 0, 0],
            )
            .await?;
        Ok(FdHandle::new(self.task.clone(), num))
    }

    /// Dup to a fresh number chosen by the kernel.
    pub async fn dup_to_new(&self) -> Result<FdHandle> {
        let ret = self
            .task
            .sysif
            .syscall(
                Sysno(libc::SYS_fcntl as i64),
                [self.near.into(), libc::F_DUPFD_CLOEXEC as i64, 0, 0, 0, 0],
            )
            .await?;
        Ok(FdHandle::new(self.task.clone(), FileDescriptor(ret as i32)))
    }

    pub async fn fcntl(&self, cmd: i32, arg: i64) -> Result<i64> {
        self.task
            .sysif
            .syscall(
                Sysno(libc::SYS_fcntl as i64),
                [self.near.into(), cmd as i64, arg, 0, 0, 0],
            )
            .await
    }

    pub async fn set_nonblock(&self) -> Result<()> {
        let flags = self.fcntl(libc::F_GETFL, 0).await?;
        self.fcntl(libc::F_SETFL, flags | libc::O_NONBLOCK as i64)
            .await?;
        Ok(())
    }

    pub async fn disable_cloexec(&self) -> Result<()> {
        self.fcntl(libc::F_SETFD, 0).await?;
        Ok(())
    }

    /// Address the same open file by path, from any task sharing the
    /// mount namespace.
    pub fn as_proc_path(&self) -> String {
        format!("/proc/self/fd/{}", self.near.0)
    }

    /// Produce a handle usable from `task`, which must share our fd
    /// table. Both handles stay live; the number's refcount grows.
    pub fn inherit(&self, task: &TaskRef) -> Result<FdHandle> {
        self.check_is_for(task)?;
        Ok(FdHandle::new(task.clone(), self.near))
    }

    /// As [`inherit`](Self::inherit), but transfers our reference
    /// instead of adding one.
    pub fn move_to(mut self, task: &TaskRef) -> Result<FdHandle> {
        self.check_is_for(task)?;
        self.defused = true;
        Ok(FdHandle {
            task: task.clone(),
            near: self.near,
            defused: false,
        })
    }
}

impl Drop for FdHandle {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        if self.task.fd_table.state.decref(self.near) {
            tracing::debug!("fd handle for {} dropped unclosed, parking", self.near);
            self.task.fd_table.state.park(self.near);
        }
    }
}

impl std::fmt::Debug for FdHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "FdHandle({}, {:?})", self.near, self.task.fd_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::{mock_task, mock_task_logged};

    #[tokio::test]
    async fn refcount_closes_once() {
        let (task, sysif) = mock_task_logged();
        let a = task.make_fd_handle(FileDescriptor(10));
        let b = a.inherit(&task).unwrap();
        assert_eq!(task.fd_table.state.count(FileDescriptor(10)), 2);
        a.close().await.unwrap();
        // Only one reference gone; no close(2) yet.
        assert_eq!(sysif.calls().len(), 0);
        b.close().await.unwrap();
        let log = sysif.calls();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, Sysno(libc::SYS_close as i64));
    }

    #[tokio::test]
    async fn inherit_requires_shared_table() {
        let task = mock_task();
        let other = mock_task();
        let h = task.make_fd_handle(FileDescriptor(3));
        match h.inherit(&other) {
            Err(Error::FdTableMismatch { .. }) => {}
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn drop_parks_for_later_reaping() {
        let task = mock_task();
        {
            let _h = task.make_fd_handle(FileDescriptor(7));
        }
        assert_eq!(task.fd_table.state.take_garbage(), vec![7]);
        // Garbage is consumed once.
        assert!(task.fd_table.state.take_garbage().is_empty());
    }

    #[tokio::test]
    async fn dup3_refuses_shared_target() {
        let task = mock_task();
        let src = task.make_fd_handle(FileDescriptor(3));
        let dst = task.make_fd_handle(FileDescriptor(4));
        let _dst2 = task.make_fd_handle(FileDescriptor(4));
        match src.dup3(dst, 0).await {
            Err(Error::Invariant(_)) => {}
            other => panic!("expected invariant error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn dup3_consumes_target_and_mints_fresh_handle() {
        let (task, sysif) = mock_task_logged();
        let src = task.make_fd_handle(FileDescriptor(3));
        let dst = task.make_fd_handle(FileDescriptor(4));
        let replaced = src.dup3(dst, 0).await.unwrap();
        assert_eq!(replaced.near(), FileDescriptor(4));
        assert_eq!(task.fd_table.state.count(FileDescriptor(4)), 1);
        let calls = sysif.calls();
        assert_eq!(calls[0], (Sysno(libc::SYS_dup3 as i64), [3, 4, 0, 0, 0, 0]));
    }
}
