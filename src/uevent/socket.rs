//! Netlink uevent socket
//!
//! A `NETLINK_KOBJECT_UEVENT` socket bound to the udev monitor group, read
//! through tokio's [`AsyncFd`]. Each datagram is sized with `MSG_PEEK`
//! before it is consumed, so arbitrarily large messages are read whole.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Multicast group udevd forwards processed events to
pub const UDEV_MONITOR_GROUP: u32 = 2;

/// Fallback when the page size cannot be queried
const DEFAULT_PAGE_SIZE: usize = 4096;

// =============================================================================
// Message Source
// =============================================================================

/// Source of raw uevent messages
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for and return the next complete message
    async fn next_message(&mut self) -> Result<Vec<u8>>;
}

// =============================================================================
// Uevent Socket
// =============================================================================

/// Non-blocking uevent socket
///
/// The descriptor is owned and closed exactly once, when the socket is
/// dropped.
pub struct UeventSocket {
    fd: AsyncFd<OwnedFd>,
    page_size: usize,
}

impl UeventSocket {
    /// Open a socket subscribed to the udev monitor group
    pub fn open() -> Result<Self> {
        // SAFETY: plain syscall; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = 0;
        addr.nl_groups = UDEV_MONITOR_GROUP;

        // SAFETY: `addr` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        debug!("uevent socket bound to group {}", UDEV_MONITOR_GROUP);
        Self::from_fd(fd)
    }

    /// Wrap an already configured non-blocking datagram descriptor
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            page_size: page_size(),
        })
    }

    /// Read the next complete datagram
    pub async fn read_msg(&self) -> Result<Vec<u8>> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| read_datagram(inner.get_ref().as_raw_fd(), self.page_size)) {
                Ok(result) => return result.map_err(Error::from),
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl MessageSource for UeventSocket {
    async fn next_message(&mut self) -> Result<Vec<u8>> {
        self.read_msg().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Peek the pending datagram with a buffer grown one page at a time until
/// it fits, then consume it
pub(crate) fn read_datagram(fd: RawFd, page_size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; page_size];
    loop {
        let n = recv(fd, &mut buf, libc::MSG_PEEK)?;
        if n < buf.len() {
            break;
        }
        buf.resize(buf.len() + page_size, 0);
    }

    let n = recv(fd, &mut buf, 0)?;
    buf.truncate(n);
    Ok(buf)
}

fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    // SAFETY: the pointer and length describe a live, writable buffer.
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Connected non-blocking datagram pair
    pub(crate) fn datagram_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0, "socketpair failed: {}", io::Error::last_os_error());
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    pub(crate) fn send(fd: &OwnedFd, msg: &[u8]) {
        let n = unsafe {
            libc::send(
                fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        assert_eq!(n as usize, msg.len());
    }

    #[test]
    fn test_read_datagram_larger_than_page() {
        let (reader, writer) = datagram_pair();
        let msg: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        send(&writer, &msg);

        let read = read_datagram(reader.as_raw_fd(), 4096).unwrap();
        assert_eq!(read, msg);
    }

    #[test]
    fn test_read_datagram_empty_queue_would_block() {
        let (reader, _writer) = datagram_pair();
        let err = read_datagram(reader.as_raw_fd(), 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn test_socket_reads_messages_in_order() {
        let (reader, writer) = datagram_pair();
        let socket = UeventSocket::from_fd(reader).unwrap();

        send(&writer, b"first");
        send(&writer, b"second");

        assert_eq!(socket.read_msg().await.unwrap(), b"first");
        assert_eq!(socket.read_msg().await.unwrap(), b"second");
    }
}
