//! Moving bytes between address spaces.
//!
//! Whenever we want to read or write some address space, we make sure
//! we hold a file descriptor owned by a task in that address space
//! which is connected to a file descriptor in our own. Writing remote
//! memory is then: write the bytes into our end of the socket, and
//! have the remote task read(2) them into place. Reading is the same
//! with the directions swapped.

use crate::asyncfd::AsyncFileDescriptor;
use crate::error::{Error, Result};
use crate::fd::FdHandle;
use crate::near::{AddressSpace, Sysno};
use crate::serialize::Iovec;
use crate::task::TaskRef;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::allocator::AllocatorClient;
use super::ptr::PtrSpan;

#[async_trait]
pub trait MemoryTransport: Send + Sync {
    /// Copy `data` to the remote range `dest`.
    async fn write(&self, dest: PtrSpan, data: Vec<u8>) -> Result<()>;

    /// Copy the remote range `src` out.
    async fn read(&self, src: PtrSpan) -> Result<Vec<u8>>;

    /// Perform several non-overlapping writes, merging adjacent
    /// ranges into single operations.
    async fn batch_write(&self, ops: Vec<(PtrSpan, Vec<u8>)>) -> Result<()>;

    /// Perform several non-overlapping reads; results are returned in
    /// the order the spans were given.
    async fn batch_read(&self, ops: Vec<PtrSpan>) -> Result<Vec<Vec<u8>>>;
}

/// Sort write ops by address and fuse runs that are contiguous within
/// one mapping. Returns the fused span, the fused payload, and the
/// original indices it covers (in address order). Overlap is fatal.
pub(crate) fn merge_adjacent_writes(
    ops: &[(PtrSpan, Vec<u8>)],
) -> Result<Vec<(PtrSpan, Vec<u8>, Vec<usize>)>> {
    let mut order: Vec<usize> = (0..ops.len()).collect();
    order.sort_by_key(|&i| (ops[i].0.arena, ops[i].0.addr));
    let mut out: Vec<(PtrSpan, Vec<u8>, Vec<usize>)> = Vec::new();
    for i in order {
        let (span, data) = &ops[i];
        if let Some((cur, buf, members)) = out.last_mut() {
            if cur.adjoins(span) {
                cur.len += span.len;
                buf.extend_from_slice(data);
                members.push(i);
                continue;
            }
            if cur.arena == span.arena && span.addr < cur.end() {
                return Err(Error::invariant(format!(
                    "overlapping writes: {} bytes at {} collide with {} bytes at {}",
                    cur.len, cur.addr, span.len, span.addr
                )));
            }
        }
        out.push((span.clone(), data.clone(), vec![i]));
    }
    Ok(out)
}

/// As [`merge_adjacent_writes`], for reads.
pub(crate) fn merge_adjacent_reads(spans: &[PtrSpan]) -> Result<Vec<(PtrSpan, Vec<usize>)>> {
    let mut order: Vec<usize> = (0..spans.len()).collect();
    order.sort_by_key(|&i| (spans[i].arena, spans[i].addr));
    let mut out: Vec<(PtrSpan, Vec<usize>)> = Vec::new();
    for i in order {
        let span = &spans[i];
        if let Some((cur, members)) = out.last_mut() {
            if cur.adjoins(span) {
                cur.len += span.len;
                members.push(i);
                continue;
            }
            if cur.arena == span.arena && span.addr < cur.end() {
                return Err(Error::invariant(format!(
                    "overlapping reads: {} bytes at {} collide with {} bytes at {}",
                    cur.len, cur.addr, span.len, span.addr
                )));
            }
        }
        out.push((span.clone(), vec![i]));
    }
    Ok(out)
}

/// Same-address-space transport: a plain memory copy.
///
/// This is the transport of the root task; bootstrapping any remote
/// transport starts from the ability to read and write our own memory.
pub struct LocalMemoryTransport {
    space: AddressSpace,
}

impl LocalMemoryTransport {
    pub fn new(space: AddressSpace) -> Result<LocalMemoryTransport> {
        if !space.is_local() {
            return Err(Error::invariant(
                "direct memory transport requires the local address space",
            ));
        }
        Ok(LocalMemoryTransport { space })
    }

    fn check(&self, span: &PtrSpan) -> Result<()> {
        if span.space != self.space {
            return Err(Error::AddressSpaceMismatch {
                ours: self.space.clone(),
                theirs: span.space.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryTransport for LocalMemoryTransport {
    async fn write(&self, dest: PtrSpan, data: Vec<u8>) -> Result<()> {
        self.check(&dest)?;
        debug_assert!(data.len() <= dest.len);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest.addr.0 as *mut u8, data.len());
        }
        Ok(())
    }

    async fn read(&self, src: PtrSpan) -> Result<Vec<u8>> {
        self.check(&src)?;
        let mut out = vec![0u8; src.len];
        unsafe {
            std::ptr::copy_nonoverlapping(src.addr.0 as *const u8, out.as_mut_ptr(), src.len);
        }
        Ok(out)
    }

    async fn batch_write(&self, ops: Vec<(PtrSpan, Vec<u8>)>) -> Result<()> {
        for (span, data) in ops {
            self.write(span, data).await?;
        }
        Ok(())
    }

    async fn batch_read(&self, ops: Vec<PtrSpan>) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(ops.len());
        for span in ops {
            out.push(self.read(span).await?);
        }
        Ok(out)
    }
}

struct WriteOp {
    span: PtrSpan,
    data: Vec<u8>,
    done: oneshot::Sender<Result<()>>,
}

struct ReadOp {
    span: PtrSpan,
    done: oneshot::Sender<Result<Vec<u8>>>,
}

/// Read and write a remote address space through a connected
/// socketpair.
///
/// Requests are queued; one driver per direction drains its queue
/// greedily, merges adjacent ranges, and moves the bytes. With a
/// remote allocator available, a burst of several merged ranges
/// stages an iovec remotely and uses readv/writev instead of one
/// syscall per range.
pub struct SocketMemoryTransport {
    local: Arc<AsyncFileDescriptor>,
    remote_task: TaskRef,
    write_tx: mpsc::UnboundedSender<WriteOp>,
    read_tx: mpsc::UnboundedSender<ReadOp>,
    remote_fd: crate::near::FileDescriptor,
}

impl SocketMemoryTransport {
    pub fn new(
        local: AsyncFileDescriptor,
        remote: FdHandle,
        remote_alloc: Option<AllocatorClient>,
    ) -> Arc<SocketMemoryTransport> {
        let local = Arc::new(local);
        let remote_task = remote.task().clone();
        let remote_fd = remote.near();
        let broken = Arc::new(AtomicBool::new(false));
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let side = Side {
            local: local.clone(),
            remote: Arc::new(remote),
            remote_alloc,
            broken,
        };
        tokio::spawn(side.clone().run_writes(write_rx));
        tokio::spawn(side.run_reads(read_rx));
        Arc::new(SocketMemoryTransport {
            local,
            remote_task,
            write_tx,
            read_tx,
            remote_fd,
        })
    }

    /// A transport for another task sharing the remote fd table: same
    /// local end, same queues, the remote fd reached through `task`.
    pub fn inherit(&self, task: &TaskRef) -> Result<Arc<SocketMemoryTransport>> {
        if task.fd_table != self.remote_task.fd_table {
            return Err(Error::FdTableMismatch {
                fd: self.remote_fd,
                ours: self.remote_task.fd_table.clone(),
                theirs: task.fd_table.clone(),
            });
        }
        Ok(Arc::new(SocketMemoryTransport {
            local: self.local.clone(),
            remote_task: task.clone(),
            write_tx: self.write_tx.clone(),
            read_tx: self.read_tx.clone(),
            remote_fd: self.remote_fd,
        }))
    }
}

#[async_trait]
impl MemoryTransport for SocketMemoryTransport {
    async fn write(&self, dest: PtrSpan, data: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(WriteOp {
                span: dest,
                data,
                done: tx,
            })
            .map_err(|_| Error::TransportTerminal)?;
        rx.await.map_err(|_| Error::TransportTerminal)?
    }

    async fn read(&self, src: PtrSpan) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.read_tx
            .send(ReadOp {
                span: src,
                done: tx,
            })
            .map_err(|_| Error::TransportTerminal)?;
        rx.await.map_err(|_| Error::TransportTerminal)?
    }

    async fn batch_write(&self, ops: Vec<(PtrSpan, Vec<u8>)>) -> Result<()> {
        let mut pending = Vec::with_capacity(ops.len());
        for (span, data) in ops {
            let (tx, rx) = oneshot::channel();
            self.write_tx
                .send(WriteOp {
                    span,
                    data,
                    done: tx,
                })
                .map_err(|_| Error::TransportTerminal)?;
            pending.push(rx);
        }
        for rx in pending {
            rx.await.map_err(|_| Error::TransportTerminal)??;
        }
        Ok(())
    }

    async fn batch_read(&self, ops: Vec<PtrSpan>) -> Result<Vec<Vec<u8>>> {
        let mut pending = Vec::with_capacity(ops.len());
        for span in ops {
            let (tx, rx) = oneshot::channel();
            self.read_tx
                .send(ReadOp { span, done: tx })
                .map_err(|_| Error::TransportTerminal)?;
            pending.push(rx);
        }
        let mut out = Vec::with_capacity(pending.len());
        for rx in pending {
            out.push(rx.await.map_err(|_| Error::TransportTerminal)??);
        }
        Ok(out)
    }
}

/// The shared state of the two drivers.
#[derive(Clone)]
struct Side {
    local: Arc<AsyncFileDescriptor>,
    remote: Arc<FdHandle>,
    remote_alloc: Option<AllocatorClient>,
    broken: Arc<AtomicBool>,
}

impl Side {
    async fn run_writes(self, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(op) = rx.try_recv() {
                batch.push(op);
            }
            if self.broken.load(Ordering::SeqCst) {
                for op in batch {
                    let _ = op.done.send(Err(Error::TransportTerminal));
                }
                continue;
            }
            let result = self.perform_writes(&batch).await;
            match result {
                Ok(()) => {
                    for op in batch {
                        let _ = op.done.send(Ok(()));
                    }
                }
                Err(err) => {
                    let invariant = matches!(err, Error::Invariant(_));
                    if !invariant {
                        self.broken.store(true, Ordering::SeqCst);
                    }
                    let msg = err.to_string();
                    tracing::warn!("memory write burst failed: {}", msg);
                    for op in batch {
                        let _ = op.done.send(Err(if invariant {
                            Error::invariant(msg.clone())
                        } else {
                            Error::TransportTerminal
                        }));
                    }
                }
            }
        }
    }

    async fn run_reads(self, mut rx: mpsc::UnboundedReceiver<ReadOp>) {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(op) = rx.try_recv() {
                batch.push(op);
            }
            if self.broken.load(Ordering::SeqCst) {
                for op in batch {
                    let _ = op.done.send(Err(Error::TransportTerminal));
                }
                continue;
            }
            match self.perform_reads(&batch).await {
                Ok(mut results) => {
                    for op in batch.into_iter().rev() {
                        let data = results.pop().unwrap_or_default();
                        let _ = op.done.send(Ok(data));
                    }
                }
                Err(err) => {
                    let invariant = matches!(err, Error::Invariant(_));
                    if !invariant {
                        self.broken.store(true, Ordering::SeqCst);
                    }
                    let msg = err.to_string();
                    tracing::warn!("memory read burst failed: {}", msg);
                    for op in batch {
                        let _ = op.done.send(Err(if invariant {
                            Error::invariant(msg.clone())
                        } else {
                            Error::TransportTerminal
                        }));
                    }
                }
            }
        }
    }

    async fn perform_writes(&self, batch: &[WriteOp]) -> Result<()> {
        let ops: Vec<(PtrSpan, Vec<u8>)> = batch
            .iter()
            .map(|op| (op.span.clone(), op.data.clone()))
            .collect();
        let merged = merge_adjacent_writes(&ops)?;
        if merged.len() > 1 && self.remote_alloc.is_some() {
            if self.vectored_write(&merged).await? {
                return Ok(());
            }
        }
        for (span, data, _) in &merged {
            self.primitive_write(span, data).await?;
        }
        Ok(())
    }

    async fn perform_reads(&self, batch: &[ReadOp]) -> Result<Vec<Vec<u8>>> {
        let spans: Vec<PtrSpan> = batch.iter().map(|op| op.span.clone()).collect();
        let merged = merge_adjacent_reads(&spans)?;
        let mut fused: Vec<Vec<u8>> = Vec::with_capacity(merged.len());
        let mut vectored_done = false;
        if merged.len() > 1 && self.remote_alloc.is_some() {
            if let Some(bufs) = self.vectored_read(&merged).await? {
                fused = bufs;
                vectored_done = true;
            }
        }
        if !vectored_done {
            for (span, _) in &merged {
                fused.push(self.primitive_read(span).await?);
            }
        }
        // Hand each constituent its slice of the fused buffer.
        let mut results: Vec<Vec<u8>> = vec![Vec::new(); batch.len()];
        for ((_, members), buf) in merged.iter().zip(fused) {
            let mut off = 0;
            for &i in members {
                let len = batch[i].span.len;
                results[i] = buf[off..off + len].to_vec();
                off += len;
            }
        }
        Ok(results)
    }

    /// write(2) the bytes into our end, read(2) them out at the far
    /// end. The two loops run concurrently so an operation larger
    /// than the socket buffer cannot wedge.
    async fn primitive_write(&self, span: &PtrSpan, data: &[u8]) -> Result<()> {
        let (a, b) = tokio::join!(
            self.local.write_bytes_all(data),
            self.remote_read_exact(span.addr, data.len())
        );
        a?;
        b
    }

    async fn primitive_read(&self, span: &PtrSpan) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; span.len];
        let (a, b) = tokio::join!(
            self.remote_write_exact(span.addr, span.len),
            self.local.read_bytes_exact_into(&mut buf)
        );
        a?;
        b?;
        Ok(buf)
    }

    /// Stage the iovec remotely, stream all payloads in address
    /// order, then have the remote fill them with readv. Returns
    /// false when staging is unavailable and the caller should fall
    /// back to the primitive path.
    async fn vectored_write(&self, merged: &[(PtrSpan, Vec<u8>, Vec<usize>)]) -> Result<bool> {
        let alloc = match self.stage_iovec(merged.iter().map(|(s, _, _)| s)).await? {
            Some(alloc) => alloc,
            None => return Ok(false),
        };
        let total: usize = merged.iter().map(|(s, _, _)| s.len).sum();
        let mut all = Vec::with_capacity(total);
        for (_, data, _) in merged {
            all.extend_from_slice(data);
        }
        let readv = async {
            let done = self
                .remote_syscall(
                    libc::SYS_readv,
                    [
                        self.remote.near().into(),
                        alloc.addr().into(),
                        merged.len() as i64,
                        0,
                        0,
                        0,
                    ],
                )
                .await? as usize;
            if done < total {
                // Finish the tail with plain reads; the leftover
                // payload bytes are still queued in the stream.
                for (span, skip) in remaining_spans(merged.iter().map(|(s, _, _)| s), done) {
                    self.remote_read_exact(span.addr.add(skip), span.len - skip)
                        .await?;
                }
            }
            Ok::<(), Error>(())
        };
        let (a, b) = tokio::join!(self.local.write_bytes_all(&all), readv);
        a?;
        b?;
        Ok(true)
    }

    async fn vectored_read(
        &self,
        merged: &[(PtrSpan, Vec<usize>)],
    ) -> Result<Option<Vec<Vec<u8>>>> {
        let alloc = match self.stage_iovec(merged.iter().map(|(s, _)| s)).await? {
            Some(alloc) => alloc,
            None => return Ok(None),
        };
        let total: usize = merged.iter().map(|(s, _)| s.len).sum();
        let mut buf = vec![0u8; total];
        let writev = async {
            let done = self
                .remote_syscall(
                    libc::SYS_writev,
                    [
                        self.remote.near().into(),
                        alloc.addr().into(),
                        merged.len() as i64,
                        0,
                        0,
                        0,
                    ],
                )
                .await? as usize;
            if done < total {
                for (span, skip) in remaining_spans(merged.iter().map(|(s, _)| s), done) {
                    self.remote_write_exact(span.addr.add(skip), span.len - skip)
                        .await?;
                }
            }
            Ok::<(), Error>(())
        };
        let (a, b) = tokio::join!(writev, self.local.read_bytes_exact_into(&mut buf));
        a?;
        b?;
        let mut out = Vec::with_capacity(merged.len());
        let mut off = 0;
        for (span, _) in merged {
            out.push(buf[off..off + span.len].to_vec());
            off += span.len;
        }
        Ok(Some(out))
    }

    /// Allocate and fill a remote iovec array describing `spans`,
    /// using the primitive path for the fill. None when no remote
    /// allocator is attached or the allocation fails.
    async fn stage_iovec<'a>(
        &self,
        spans: impl Iterator<Item = &'a PtrSpan>,
    ) -> Result<Option<super::allocator::Allocation>> {
        let alloc_client = match &self.remote_alloc {
            Some(client) => client,
            None => return Ok(None),
        };
        let mut bytes = Vec::new();
        let mut count = 0usize;
        for span in spans {
            crate::serialize::Wire::to_bytes(
                &Iovec {
                    base: span.addr,
                    len: span.len,
                },
                &mut bytes,
            );
            count += 1;
        }
        let alloc = match alloc_client.alloc(count * 16, 8).await {
            Ok(alloc) => alloc,
            Err(err) => {
                tracing::debug!("iovec staging unavailable: {}", err);
                return Ok(None);
            }
        };
        let len = bytes.len();
        let (a, b) = tokio::join!(
            self.local.write_bytes_all(&bytes),
            self.remote_read_exact(alloc.addr(), len)
        );
        a?;
        b?;
        Ok(Some(alloc))
    }

    async fn remote_syscall(&self, nr: std::os::raw::c_long, args: [i64; 6]) -> Result<i64> {
        self.remote
            .task()
            .sysif
            .syscall(Sysno(nr as i64), args)
            .await
    }

    async fn remote_read_exact(&self, addr: crate::near::Address, len: usize) -> Result<()> {
        let mut done = 0usize;
        while done < len {
            let n = self
                .remote_syscall(
                    libc::SYS_read,
                    [
                        self.remote.near().into(),
                        addr.add(done).into(),
                        (len - done) as i64,
                        0,
                        0,
                        0,
                    ],
                )
                .await?;
            if n == 0 {
                return Err(Error::TransportTerminal);
            }
            done += n as usize;
        }
        Ok(())
    }

    async fn remote_write_exact(&self, addr: crate::near::Address, len: usize) -> Result<()> {
        let mut done = 0usize;
        while done < len {
            let n = self
                .remote_syscall(
                    libc::SYS_write,
                    [
                        self.remote.near().into(),
                        addr.add(done).into(),
                        (len - done) as i64,
                        0,
                        0,
                        0,
                    ],
                )
                .await?;
            if n == 0 {
                return Err(Error::TransportTerminal);
            }
            done += n as usize;
        }
        Ok(())
    }
}

/// Walk the spans of a merged burst, skipping the first `done` bytes,
/// and yield what remains of each as (span, bytes-to-skip-within).
fn remaining_spans<'a>(
    spans: impl Iterator<Item = &'a PtrSpan>,
    mut done: usize,
) -> Vec<(PtrSpan, usize)> {
    let mut out = Vec::new();
    for span in spans {
        if done >= span.len {
            done -= span.len;
            continue;
        }
        out.push((span.clone(), done));
        done = 0;
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    //! A fake address space: bytes live in a map, operations are
    //! counted. Lets the handle layer be exercised without a kernel.

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    pub struct MapTransport {
        pub space: AddressSpace,
        pub memory: Mutex<BTreeMap<u64, u8>>,
        pub write_ops: Mutex<Vec<(u64, usize)>>,
        pub read_ops: Mutex<Vec<(u64, usize)>>,
    }

    impl MapTransport {
        pub fn new(space: AddressSpace) -> MapTransport {
            MapTransport {
                space,
                memory: Mutex::new(BTreeMap::new()),
                write_ops: Mutex::new(Vec::new()),
                read_ops: Mutex::new(Vec::new()),
            }
        }

        fn store(&self, addr: u64, data: &[u8]) {
            let mut mem = self.memory.lock().unwrap();
            for (i, b) in data.iter().enumerate() {
                mem.insert(addr + i as u64, *b);
            }
        }

        fn load(&self, addr: u64, len: usize) -> Vec<u8> {
            let mem = self.memory.lock().unwrap();
            (0..len)
                .map(|i| mem.get(&(addr + i as u64)).copied().unwrap_or(0))
                .collect()
        }
    }

    #[async_trait]
    impl MemoryTransport for MapTransport {
        async fn write(&self, dest: PtrSpan, data: Vec<u8>) -> Result<()> {
            self.write_ops.lock().unwrap().push((dest.addr.0, data.len()));
            self.store(dest.addr.0, &data);
            Ok(())
        }

        async fn read(&self, src: PtrSpan) -> Result<Vec<u8>> {
            self.read_ops.lock().unwrap().push((src.addr.0, src.len));
            Ok(self.load(src.addr.0, src.len))
        }

        async fn batch_write(&self, ops: Vec<(PtrSpan, Vec<u8>)>) -> Result<()> {
            for (span, data, _) in merge_adjacent_writes(&ops)? {
                self.write(span, data).await?;
            }
            Ok(())
        }

        async fn batch_read(&self, ops: Vec<PtrSpan>) -> Result<Vec<Vec<u8>>> {
            let merged = merge_adjacent_reads(&ops)?;
            let mut results = vec![Vec::new(); ops.len()];
            for (span, members) in merged {
                let buf = self.read(span.clone()).await?;
                let mut off = 0;
                for i in members {
                    let len = ops[i].len;
                    results[i] = buf[off..off + len].to_vec();
                    off += len;
                }
            }
            Ok(results)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::near::Address;

    fn span(arena: u64, addr: u64, len: usize) -> PtrSpan {
        PtrSpan {
            arena,
            space: AddressSpace::new(),
            addr: Address(addr),
            len,
        }
    }

    #[test]
    fn adjacent_writes_fuse() {
        let ops = vec![
            (span(1, 0x108, 8), vec![b'B'; 8]),
            (span(1, 0x100, 8), vec![b'A'; 8]),
        ];
        let merged = merge_adjacent_writes(&ops).unwrap();
        assert_eq!(merged.len(), 1);
        let (fused, data, members) = &merged[0];
        assert_eq!(fused.addr, Address(0x100));
        assert_eq!(fused.len, 16);
        assert_eq!(data, &[vec![b'A'; 8], vec![b'B'; 8]].concat());
        assert_eq!(members, &vec![1, 0]);
    }

    #[test]
    fn distinct_mappings_do_not_fuse() {
        let ops = vec![
            (span(1, 0x100, 8), vec![0; 8]),
            (span(2, 0x108, 8), vec![0; 8]),
        ];
        let merged = merge_adjacent_writes(&ops).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn gaps_do_not_fuse() {
        let ops = vec![
            (span(1, 0x100, 8), vec![0; 8]),
            (span(1, 0x110, 8), vec![0; 8]),
        ];
        assert_eq!(merge_adjacent_writes(&ops).unwrap().len(), 2);
    }

    #[test]
    fn overlap_is_fatal() {
        let ops = vec![
            (span(1, 0x100, 8), vec![0; 8]),
            (span(1, 0x104, 8), vec![0; 8]),
        ];
        match merge_adjacent_writes(&ops) {
            Err(Error::Invariant(_)) => {}
            other => panic!("expected invariant error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn read_merge_remembers_constituents() {
        let spans = vec![span(1, 0x10, 4), span(1, 0x14, 4), span(1, 0x20, 4)];
        let merged = merge_adjacent_reads(&spans).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].0.len, 8);
        assert_eq!(merged[0].1, vec![0, 1]);
        assert_eq!(merged[1].1, vec![2]);
    }

    #[test]
    fn remaining_span_arithmetic() {
        let spans = [span(1, 0x0, 8), span(1, 0x8, 8)];
        let rem = remaining_spans(spans.iter(), 10);
        assert_eq!(rem.len(), 1);
        assert_eq!(rem[0].0.addr, Address(0x8));
        assert_eq!(rem[0].1, 2);
    }
}
