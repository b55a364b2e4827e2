//! Kernel-facing value encoding.
//!
//! A pointer is typed by the value it holds; at runtime the type is
//! reified as a [`Wire`] implementation that translates the value to
//! and from the bytes the kernel sees. These are kernel ABI structs,
//! laid out by hand for x86_64, not a general serialization format.

use crate::error::{Error, Result};
use crate::near::{Address, FileDescriptor, Pid};

/// A value that can be written to and read from task memory.
pub trait Wire: Sized + Send + Sync + 'static {
    fn to_bytes(&self, out: &mut Vec<u8>);
    fn from_bytes(data: &[u8]) -> Result<Self>;
}

/// A [`Wire`] type with a fixed encoded size.
pub trait FixedWire: Wire {
    const SIZE: usize;
}

fn short(what: &str, want: usize, got: usize) -> Error {
    Error::invariant(format!("{}: need {} bytes, have {}", what, want, got))
}

/// An untyped byte buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Bytes {
    fn from(data: &[u8]) -> Bytes {
        Bytes(data.to_vec())
    }
}

impl Wire for Bytes {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }

    fn from_bytes(data: &[u8]) -> Result<Bytes> {
        Ok(Bytes(data.to_vec()))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Int32(pub i32);

impl Wire for Int32 {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_le_bytes());
    }

    fn from_bytes(data: &[u8]) -> Result<Int32> {
        let raw = data
            .get(..4)
            .ok_or_else(|| short("Int32", 4, data.len()))?;
        Ok(Int32(i32::from_le_bytes(raw.try_into().unwrap())))
    }
}

impl FixedWire for Int32 {
    const SIZE: usize = 4;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Int64(pub i64);

impl Wire for Int64 {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_le_bytes());
    }

    fn from_bytes(data: &[u8]) -> Result<Int64> {
        let raw = data
            .get(..8)
            .ok_or_else(|| short("Int64", 8, data.len()))?;
        Ok(Int64(i64::from_le_bytes(raw.try_into().unwrap())))
    }
}

impl FixedWire for Int64 {
    const SIZE: usize = 8;
}

/// The `int fds[2]` out-parameter of pipe2 and socketpair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FdPair {
    pub first: FileDescriptor,
    pub second: FileDescriptor,
}

impl Wire for FdPair {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.first.0.to_le_bytes());
        out.extend_from_slice(&self.second.0.to_le_bytes());
    }

    fn from_bytes(data: &[u8]) -> Result<FdPair> {
        let raw = data
            .get(..8)
            .ok_or_else(|| short("FdPair", 8, data.len()))?;
        Ok(FdPair {
            first: FileDescriptor(i32::from_le_bytes(raw[0..4].try_into().unwrap())),
            second: FileDescriptor(i32::from_le_bytes(raw[4..8].try_into().unwrap())),
        })
    }
}

impl FixedWire for FdPair {
    const SIZE: usize = 8;
}

/// A NUL-terminated string argument, as passed to openat and friends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Arg(pub Vec<u8>);

impl Arg {
    pub fn new(s: impl AsRef<[u8]>) -> Arg {
        Arg(s.as_ref().to_vec())
    }
}

impl Wire for Arg {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
        out.push(0);
    }

    fn from_bytes(data: &[u8]) -> Result<Arg> {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(Arg(data[..end].to_vec()))
    }
}

/// A kernel sigset_t, 8 bytes on x86_64.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Sigset(pub u64);

impl Sigset {
    pub fn with(signal: i32) -> Sigset {
        Sigset(1u64 << (signal - 1))
    }
}

impl Wire for Sigset {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_le_bytes());
    }

    fn from_bytes(data: &[u8]) -> Result<Sigset> {
        let raw = data
            .get(..8)
            .ok_or_else(|| short("Sigset", 8, data.len()))?;
        Ok(Sigset(u64::from_le_bytes(raw.try_into().unwrap())))
    }
}

impl FixedWire for Sigset {
    const SIZE: usize = 8;
}

/// One epoll_event, 12 bytes packed on x86_64.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EpollEvent {
    pub events: u32,
    pub data: u64,
}

impl Wire for EpollEvent {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.events.to_le_bytes());
        out.extend_from_slice(&self.data.to_le_bytes());
    }

    fn from_bytes(data: &[u8]) -> Result<EpollEvent> {
        let raw = data
            .get(..12)
            .ok_or_else(|| short("EpollEvent", 12, data.len()))?;
        Ok(EpollEvent {
            events: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            data: u64::from_le_bytes(raw[4..12].try_into().unwrap()),
        })
    }
}

impl FixedWire for EpollEvent {
    const SIZE: usize = 12;
}

/// A buffer of zero or more epoll_events, as filled by epoll_wait.
#[derive(Clone, Debug, Default)]
pub struct EpollEventList(pub Vec<EpollEvent>);

impl Wire for EpollEventList {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        for ev in &self.0 {
            ev.to_bytes(out);
        }
    }

    fn from_bytes(data: &[u8]) -> Result<EpollEventList> {
        let mut events = Vec::with_capacity(data.len() / EpollEvent::SIZE);
        for chunk in data.chunks_exact(EpollEvent::SIZE) {
            events.push(EpollEvent::from_bytes(chunk)?);
        }
        Ok(EpollEventList(events))
    }
}

/// One struct iovec.
#[derive(Copy, Clone, Debug)]
pub struct Iovec {
    pub base: Address,
    pub len: usize,
}

impl Wire for Iovec {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.base.0.to_le_bytes());
        out.extend_from_slice(&(self.len as u64).to_le_bytes());
    }

    fn from_bytes(data: &[u8]) -> Result<Iovec> {
        let raw = data
            .get(..16)
            .ok_or_else(|| short("Iovec", 16, data.len()))?;
        Ok(Iovec {
            base: Address(u64::from_le_bytes(raw[0..8].try_into().unwrap())),
            len: u64::from_le_bytes(raw[8..16].try_into().unwrap()) as usize,
        })
    }
}

impl FixedWire for Iovec {
    const SIZE: usize = 16;
}

#[derive(Clone, Debug, Default)]
pub struct IovecList(pub Vec<Iovec>);

impl Wire for IovecList {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        for iov in &self.0 {
            iov.to_bytes(out);
        }
    }

    fn from_bytes(data: &[u8]) -> Result<IovecList> {
        let mut iovs = Vec::with_capacity(data.len() / Iovec::SIZE);
        for chunk in data.chunks_exact(Iovec::SIZE) {
            iovs.push(Iovec::from_bytes(chunk)?);
        }
        Ok(IovecList(iovs))
    }
}

/// The siginfo_t out-parameter of waitid, 128 bytes. Only the CLD_*
/// fields are decoded.
#[derive(Clone, Debug)]
pub struct Siginfo {
    raw: [u8; 128],
}

impl Siginfo {
    pub fn zeroed() -> Siginfo {
        Siginfo { raw: [0; 128] }
    }

    fn field_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.raw[offset..offset + 4].try_into().unwrap())
    }

    pub fn signo(&self) -> i32 {
        self.field_i32(0)
    }

    pub fn code(&self) -> i32 {
        self.field_i32(8)
    }

    pub fn pid(&self) -> Pid {
        Pid(self.field_i32(16))
    }

    pub fn uid(&self) -> u32 {
        self.field_i32(20) as u32
    }

    pub fn status(&self) -> i32 {
        self.field_i32(24)
    }

    #[cfg(test)]
    pub fn fake(code: i32, pid: Pid, status: i32) -> Siginfo {
        let mut info = Siginfo::zeroed();
        info.raw[0..4].copy_from_slice(&libc::SIGCHLD.to_le_bytes());
        info.raw[8..12].copy_from_slice(&code.to_le_bytes());
        info.raw[16..20].copy_from_slice(&pid.0.to_le_bytes());
        info.raw[24..28].copy_from_slice(&status.to_le_bytes());
        info
    }
}

impl Wire for Siginfo {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.raw);
    }

    fn from_bytes(data: &[u8]) -> Result<Siginfo> {
        let raw = data
            .get(..128)
            .ok_or_else(|| short("Siginfo", 128, data.len()))?;
        Ok(Siginfo {
            raw: raw.try_into().unwrap(),
        })
    }
}

impl FixedWire for Siginfo {
    const SIZE: usize = 128;
}

/// One signalfd_siginfo record, 128 bytes.
#[derive(Clone, Debug)]
pub struct SignalfdSiginfo {
    pub signo: u32,
    pub pid: u32,
}

impl Wire for SignalfdSiginfo {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        let mut raw = [0u8; 128];
        raw[0..4].copy_from_slice(&self.signo.to_le_bytes());
        raw[40..44].copy_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&raw);
    }

    fn from_bytes(data: &[u8]) -> Result<SignalfdSiginfo> {
        let raw = data
            .get(..128)
            .ok_or_else(|| short("SignalfdSiginfo", 128, data.len()))?;
        Ok(SignalfdSiginfo {
            signo: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            pid: u32::from_le_bytes(raw[40..44].try_into().unwrap()),
        })
    }
}

impl FixedWire for SignalfdSiginfo {
    const SIZE: usize = 128;
}

/// A struct msghdr, 56 bytes on x86_64. Pointer fields are staged as
/// raw addresses in the target address space.
#[derive(Copy, Clone, Debug)]
pub struct MsgHdr {
    pub name: Address,
    pub namelen: u32,
    pub iov: Address,
    pub iovlen: usize,
    pub control: Address,
    pub controllen: usize,
    pub flags: i32,
}

impl Wire for MsgHdr {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name.0.to_le_bytes());
        out.extend_from_slice(&(self.namelen as u64).to_le_bytes());
        out.extend_from_slice(&self.iov.0.to_le_bytes());
        out.extend_from_slice(&(self.iovlen as u64).to_le_bytes());
        out.extend_from_slice(&self.control.0.to_le_bytes());
        out.extend_from_slice(&(self.controllen as u64).to_le_bytes());
        out.extend_from_slice(&(self.flags as i64).to_le_bytes());
    }

    fn from_bytes(data: &[u8]) -> Result<MsgHdr> {
        let raw = data
            .get(..56)
            .ok_or_else(|| short("MsgHdr", 56, data.len()))?;
        let u64_at = |off: usize| u64::from_le_bytes(raw[off..off + 8].try_into().unwrap());
        Ok(MsgHdr {
            name: Address(u64_at(0)),
            namelen: u64_at(8) as u32,
            iov: Address(u64_at(16)),
            iovlen: u64_at(24) as usize,
            control: Address(u64_at(32)),
            controllen: u64_at(40) as usize,
            flags: u64_at(48) as i32,
        })
    }
}

impl FixedWire for MsgHdr {
    const SIZE: usize = 56;
}

/// An SCM_RIGHTS control message carrying fd numbers.
#[derive(Clone, Debug)]
pub struct CmsgRights(pub Vec<FileDescriptor>);

pub const fn cmsg_space(fd_count: usize) -> usize {
    // CMSG_SPACE: header (len, level, type) plus data, 8-aligned.
    16 + (fd_count * 4 + 7) / 8 * 8
}

impl Wire for CmsgRights {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        let data_len = self.0.len() * 4;
        out.extend_from_slice(&((16 + data_len) as u64).to_le_bytes());
        out.extend_from_slice(&libc::SOL_SOCKET.to_le_bytes());
        out.extend_from_slice(&libc::SCM_RIGHTS.to_le_bytes());
        for fd in &self.0 {
            out.extend_from_slice(&fd.0.to_le_bytes());
        }
        // pad to CMSG_SPACE
        let space = cmsg_space(self.0.len());
        out.resize(out.len() + space - 16 - data_len, 0);
    }

    fn from_bytes(data: &[u8]) -> Result<CmsgRights> {
        let raw = data
            .get(..16)
            .ok_or_else(|| short("CmsgRights", 16, data.len()))?;
        let len = u64::from_le_bytes(raw[0..8].try_into().unwrap()) as usize;
        let level = i32::from_le_bytes(raw[8..12].try_into().unwrap());
        let typ = i32::from_le_bytes(raw[12..16].try_into().unwrap());
        if level != libc::SOL_SOCKET || typ != libc::SCM_RIGHTS {
            return Err(Error::invariant(format!(
                "unexpected control message level={} type={}",
                level, typ
            )));
        }
        let count = (len - 16) / 4;
        let mut fds = Vec::with_capacity(count);
        for i in 0..count {
            let off = 16 + i * 4;
            let fd = data
                .get(off..off + 4)
                .ok_or_else(|| short("CmsgRights data", off + 4, data.len()))?;
            fds.push(FileDescriptor(i32::from_le_bytes(fd.try_into().unwrap())));
        }
        Ok(CmsgRights(fds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Wire + PartialEq + std::fmt::Debug>(v: T) {
        let mut buf = Vec::new();
        v.to_bytes(&mut buf);
        assert_eq!(T::from_bytes(&buf).unwrap(), v);
    }

    #[test]
    fn fixed_types_roundtrip() {
        roundtrip(Int32(-5));
        roundtrip(Int64(1 << 40));
        roundtrip(FdPair {
            first: FileDescriptor(3),
            second: FileDescriptor(4),
        });
        roundtrip(Sigset::with(libc::SIGCHLD));
        roundtrip(EpollEvent {
            events: libc::EPOLLIN as u32,
            data: 7,
        });
    }

    #[test]
    fn arg_is_nul_terminated() {
        let mut buf = Vec::new();
        Arg::new("/dev/null").to_bytes(&mut buf);
        assert_eq!(buf.last(), Some(&0));
        assert_eq!(Arg::from_bytes(&buf).unwrap(), Arg::new("/dev/null"));
    }

    #[test]
    fn siginfo_field_offsets() {
        let info = Siginfo::fake(libc::CLD_EXITED, Pid(42), 7);
        assert_eq!(info.signo(), libc::SIGCHLD);
        assert_eq!(info.code(), libc::CLD_EXITED);
        assert_eq!(info.pid(), Pid(42));
        assert_eq!(info.status(), 7);
    }

    #[test]
    fn cmsg_rights_layout() {
        let rights = CmsgRights(vec![FileDescriptor(5), FileDescriptor(9)]);
        let mut buf = Vec::new();
        rights.to_bytes(&mut buf);
        assert_eq!(buf.len(), cmsg_space(2));
        let parsed = CmsgRights::from_bytes(&buf).unwrap();
        assert_eq!(parsed.0, vec![FileDescriptor(5), FileDescriptor(9)]);
    }
}
