//! Read packets from a tunnel interface
//!
//! The capture loop doesn't care how the tunnel was set up. Whoever created the interface, assigned its address and
//! pointed routes at it hands over something implementing [`Tunnel`]: a blocking source of packets that can be
//! closed from another thread.
//!
//! [`FdTunnel`] wraps the file descriptor a tun device (or a VPN service) gives you. [`MemoryTunnel`] is an in-process
//! queue, handy for tests and for feeding packets that were read somewhere else.

use std::collections::VecDeque;
use std::io;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use libc::{c_void, fcntl, poll, pollfd, read, F_GETFD, POLLERR, POLLHUP, POLLIN, POLLNVAL};
use thiserror::Error;

/// Errors that can occur when taking over a tunnel handle
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The descriptor isn't open
    #[error("File descriptor {0} is not open")]
    InvalidDescriptor(RawFd),
    /// Failed to create the socket pair used to interrupt reads
    #[error("Failed to create the wakeup channel")]
    Wakeup(#[source] io::Error),
}

/// A source of raw IP packets
///
/// Implementations are shared between the thread that reads packets and the thread that stops the capture, so every
/// method takes `&self`.
pub trait Tunnel: Send + Sync {
    /// Read one packet into `buf`, blocking until one arrives
    ///
    /// Returns the number of bytes in the packet. A return of 0 means there was nothing to read this time.
    ///
    /// # Errors
    /// Once the tunnel is closed this returns an error of kind [`io::ErrorKind::NotConnected`], including for a read
    /// that was already blocked when [`Tunnel::close`] was called.
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the tunnel and wake up any blocked reader
    ///
    /// Closing more than once is fine.
    ///
    /// # Errors
    /// Returns an error if the blocked reader could not be signalled.
    fn close(&self) -> io::Result<()>;
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tunnel closed")
}

/// A tunnel backed by a file descriptor
///
/// Every read waits in `poll(2)` on both the tunnel descriptor and one end of a private socket pair. Closing the
/// tunnel writes to the other end of that pair, which gets a blocked reader out of `poll` without touching the
/// descriptor another thread may be using. The descriptor itself is released when the tunnel is dropped.
#[derive(Debug)]
pub struct FdTunnel {
    fd: OwnedFd,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    closed: AtomicBool,
}

impl FdTunnel {
    /// Take ownership of an open tunnel descriptor
    ///
    /// # Errors
    /// Fails if the wakeup socket pair can't be created.
    pub fn new(fd: OwnedFd) -> Result<Self, TunnelError> {
        let (wake_rx, wake_tx) = UnixStream::pair().map_err(TunnelError::Wakeup)?;
        Ok(Self {
            fd,
            wake_rx,
            wake_tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Take ownership of a descriptor inherited from the process that set up the tunnel
    ///
    /// # Errors
    /// Returns [`TunnelError::InvalidDescriptor`] if `fd` isn't an open descriptor.
    ///
    /// # Safety
    /// `fd` must not be owned by anything else. It will be closed when the tunnel is dropped.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self, TunnelError> {
        // SAFETY: F_GETFD only reads the descriptor flags. An invalid descriptor makes it return -1 with EBADF, it
        // can't affect any other descriptor.
        if fd < 0 || unsafe { fcntl(fd, F_GETFD) } < 0 {
            return Err(TunnelError::InvalidDescriptor(fd));
        }
        // SAFETY: The descriptor is open and the caller promised nothing else owns it.
        Self::new(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Whether [`Tunnel::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Tunnel for FdTunnel {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.is_closed() {
                return Err(closed_error());
            }
            let mut fds = [
                pollfd {
                    fd: self.fd.as_raw_fd(),
                    events: POLLIN,
                    revents: 0,
                },
                pollfd {
                    fd: self.wake_rx.as_raw_fd(),
                    events: POLLIN,
                    revents: 0,
                },
            ];
            // SAFETY: `fds` is a valid array of two pollfd structs that lives for the whole call and both
            // descriptors are owned by self. A timeout of -1 blocks until one of them is ready.
            let ret = unsafe { poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if fds[1].revents != 0 || self.is_closed() {
                return Err(closed_error());
            }

            let revents = fds[0].revents;
            if revents & POLLNVAL != 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "tunnel descriptor is not valid"));
            }
            if revents & POLLIN == 0 {
                if revents & POLLHUP != 0 {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel hung up"));
                }
                if revents & POLLERR != 0 {
                    return Err(io::Error::new(io::ErrorKind::Other, "error condition on tunnel descriptor"));
                }
                continue;
            }

            // SAFETY: buf is a valid writable slice of buf.len() bytes and the descriptor is owned by self.
            let n = unsafe { read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast::<c_void>(), buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                    _ => return Err(err),
                }
            }
            if n == 0 && revents & POLLHUP != 0 {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel hung up"));
            }
            return Ok(n as usize);
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        (&self.wake_tx).write_all(&[1])
    }
}

#[derive(Debug, Default)]
struct Queue {
    packets: VecDeque<Vec<u8>>,
    closed: bool,
}

/// In-memory tunnel
///
/// Clones share the same queue: keep one clone to [`MemoryTunnel::inject`] packets and hand another to the capture.
/// Packets larger than the read buffer are cut down to the buffer size.
#[derive(Debug, Clone, Default)]
pub struct MemoryTunnel {
    queue: Arc<(Mutex<Queue>, Condvar)>,
}

impl MemoryTunnel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        // A panic while holding the lock can't leave the queue half updated
        self.queue.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a packet as if it had been routed into the tunnel
    ///
    /// Returns false and drops the packet if the tunnel is already closed.
    pub fn inject(&self, packet: impl Into<Vec<u8>>) -> bool {
        let mut queue = self.lock();
        if queue.closed {
            return false;
        }
        queue.packets.push_back(packet.into());
        self.queue.1.notify_one();
        true
    }

    /// Number of packets waiting to be read
    pub fn pending(&self) -> usize {
        self.lock().packets.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Tunnel for MemoryTunnel {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queue = self.lock();
        loop {
            if queue.closed {
                return Err(closed_error());
            }
            if let Some(packet) = queue.packets.pop_front() {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                return Ok(n);
            }
            queue = self.queue.1.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn close(&self) -> io::Result<()> {
        let mut queue = self.lock();
        queue.closed = true;
        queue.packets.clear();
        self.queue.1.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tunnel_testing {
    use super::*;
    use std::os::unix::net::UnixDatagram;
    use std::thread::{sleep, spawn};
    use std::time::Duration;

    fn datagram_tunnel() -> (FdTunnel, UnixDatagram) {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let tunnel = FdTunnel::new(OwnedFd::from(ours)).unwrap();
        (tunnel, theirs)
    }

    #[test]
    fn fd_reads_one_packet_per_call() {
        let (tunnel, peer) = datagram_tunnel();
        peer.send(&[0x45; 60]).unwrap();
        peer.send(&[0x45; 40]).unwrap();
        let mut buf = [0_u8; 2048];
        assert_eq!(tunnel.read_packet(&mut buf).unwrap(), 60);
        assert_eq!(tunnel.read_packet(&mut buf).unwrap(), 40);
    }

    #[test]
    fn fd_close_unblocks_reader() {
        let (tunnel, _peer) = datagram_tunnel();
        let tunnel = Arc::new(tunnel);
        let reader = Arc::clone(&tunnel);
        let handle = spawn(move || {
            let mut buf = [0_u8; 2048];
            reader.read_packet(&mut buf)
        });
        sleep(Duration::from_millis(50));
        tunnel.close().unwrap();
        tunnel.close().unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(tunnel.is_closed());

        let mut buf = [0_u8; 16];
        assert_eq!(tunnel.read_packet(&mut buf).unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn fd_hangup_ends_reads() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let tunnel = FdTunnel::new(OwnedFd::from(ours)).unwrap();
        drop(theirs);
        let mut buf = [0_u8; 64];
        let err = tunnel.read_packet(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn invalid_raw_fd() {
        let err = unsafe { FdTunnel::from_raw_fd(-1) }.unwrap_err();
        assert!(matches!(err, TunnelError::InvalidDescriptor(-1)));
    }

    #[test]
    fn memory_queue_order() {
        let tunnel = MemoryTunnel::new();
        assert!(tunnel.inject(vec![1_u8; 3]));
        assert!(tunnel.inject(vec![2_u8; 5]));
        assert_eq!(tunnel.pending(), 2);
        let mut buf = [0_u8; 4];
        assert_eq!(tunnel.read_packet(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 1, 1]);
        assert_eq!(tunnel.read_packet(&mut buf).unwrap(), 4);
        assert_eq!(buf, [2; 4]);
    }

    #[test]
    fn memory_close_unblocks_reader() {
        let tunnel = MemoryTunnel::new();
        let reader = tunnel.clone();
        let handle = spawn(move || {
            let mut buf = [0_u8; 16];
            reader.read_packet(&mut buf)
        });
        sleep(Duration::from_millis(50));
        tunnel.close().unwrap();
        assert_eq!(handle.join().unwrap().unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(!tunnel.inject(vec![0_u8; 1]));
        assert!(tunnel.is_closed());
    }
}
