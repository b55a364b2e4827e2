//! Owning handles for memory mappings.

use crate::error::Result;
use crate::near::{MemRegion, Sysno};
use crate::task::TaskRef;
use std::sync::Mutex;

/// Shared per-address-space bookkeeping, hanging off
/// [`crate::near::AddressSpace`]: the ranges whose owning handle was
/// dropped without an explicit munmap. Any task in the space can
/// unmap them later via
/// [`crate::task::Task::reap_dropped_mappings`].
pub struct AddressSpaceState {
    leaked: Mutex<Vec<MemRegion>>,
}

impl AddressSpaceState {
    pub(crate) fn new() -> AddressSpaceState {
        AddressSpaceState {
            leaked: Mutex::new(Vec::new()),
        }
    }

    fn park(&self, region: MemRegion) {
        self.leaked.lock().unwrap().push(region);
    }

    pub(crate) fn take_leaked(&self) -> Vec<MemRegion> {
        std::mem::take(&mut *self.leaked.lock().unwrap())
    }
}

/// Owns a mapped range in one task's address space; munmap on drop is
/// deferred, not lost. The syscall cannot be issued from a
/// destructor, so a dropped mapping parks its range on the address
/// space's leaked list and the next `reap_dropped_mappings` call
/// unmaps it.
pub struct OwnedMapping {
    task: TaskRef,
    region: MemRegion,
    defused: bool,
}

impl OwnedMapping {
    pub(crate) fn new(task: TaskRef, region: MemRegion) -> OwnedMapping {
        OwnedMapping {
            task,
            region,
            defused: false,
        }
    }

    pub fn region(&self) -> MemRegion {
        self.region
    }

    pub async fn munmap(mut self) -> Result<()> {
        self.defused = true;
        self.task
            .sysif
            .syscall(
                Sysno(libc::SYS_munmap as i64),
                [self.region.addr.into(), self.region.len as i64, 0, 0, 0, 0],
            )
            .await?;
        Ok(())
    }
}

impl Drop for OwnedMapping {
    fn drop(&mut self) {
        if !self.defused {
            tracing::debug!("mapping {} dropped without munmap, parking", self.region);
            self.task.address_space.state.park(self.region);
        }
    }
}

impl std::fmt::Debug for OwnedMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "OwnedMapping({})", self.region)
    }
}

#[cfg(test)]
mod tests {
    use crate::near::Sysno;
    use crate::task::testing::mock_task_logged;

    #[tokio::test]
    async fn munmap_unmaps_the_whole_region() {
        let (task, sysif) = mock_task_logged();
        let mapping = task
            .mmap_anonymous(8192, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE)
            .await
            .unwrap();
        assert_eq!(mapping.region().len, 8192);
        mapping.munmap().await.unwrap();
        let calls = sysif.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, Sysno(libc::SYS_mmap as i64));
        assert_eq!(calls[1].0, Sysno(libc::SYS_munmap as i64));
        assert_eq!(calls[1].1[1], 8192);
    }

    #[tokio::test]
    async fn dropped_mapping_is_parked_then_reaped() {
        let (task, sysif) = mock_task_logged();
        {
            let _mapping = task
                .mmap_anonymous(4096, libc::PROT_READ, libc::MAP_PRIVATE)
                .await
                .unwrap();
        }
        // Dropped without munmap: nothing unmapped yet.
        assert_eq!(sysif.calls().len(), 1);
        task.reap_dropped_mappings().await.unwrap();
        let calls = sysif.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, Sysno(libc::SYS_munmap as i64));
        assert_eq!(calls[1].1[1], 4096);
        // The list is consumed once.
        task.reap_dropped_mappings().await.unwrap();
        assert_eq!(sysif.calls().len(), 2);
    }

    #[tokio::test]
    async fn tasks_sharing_the_space_share_the_leaked_list() {
        let (task, sysif) = mock_task_logged();
        let sibling = crate::task::Task::new(
            task.sysif.clone(),
            crate::near::Pid(2000),
            task.fd_table.clone(),
            task.address_space.clone(),
            task.mount_ns,
            task.pid_ns,
        );
        {
            let _mapping = task
                .mmap_anonymous(4096, libc::PROT_READ, libc::MAP_PRIVATE)
                .await
                .unwrap();
        }
        sibling.reap_dropped_mappings().await.unwrap();
        assert_eq!(sysif.calls().len(), 2);
        assert_eq!(sysif.calls()[1].0, Sysno(libc::SYS_munmap as i64));
    }
}
