use std::collections::VecDeque;
use std::io;

use crate::addr::Address;
use crate::net::would_block;
use crate::socket::Socket;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd"))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd")))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

/// Stream-socket I/O mechanics: one descriptor, the peer address, and the
/// FIFO of byte chunks waiting for writable readiness.
///
/// Invariant: the send buffer is non-empty exactly while the descriptor's
/// write interest is set. [`send`] establishes it on a short write,
/// [`flush`] clears it when the queue drains.
///
/// [`send`]: Connection::send
/// [`flush`]: Connection::flush
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) socket: Socket,
    pub(crate) peer: Address,
    send_buffer: VecDeque<Vec<u8>>,
}

impl Connection {
    pub(crate) fn new(socket: Socket, peer: Address) -> Connection {
        // Broken-pipe writes must come back as errors, not signals.
        #[cfg(any(target_os = "ios", target_os = "macos"))]
        let _ = socket.set_option(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, &(1 as libc::c_int));
        Connection {
            socket,
            peer,
            send_buffer: VecDeque::new(),
        }
    }

    /// One non-blocking read into `buf`. `Ok(0)` means the peer shut the
    /// stream down; the caller drives the close from there.
    pub(crate) fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(recv(
            self.socket.fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        ))?;
        Ok(n as usize)
    }

    /// One non-blocking write attempt. Bytes the kernel does not take now
    /// are queued and write interest is requested; a would-block result
    /// queues everything. A zero-length send is a no-op that never queues.
    pub(crate) fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if !self.send_buffer.is_empty() {
            // Earlier bytes are still queued; writing now would reorder.
            self.enqueue(bytes);
            return Ok(());
        }
        match self.raw_send(bytes) {
            Ok(n) if n < bytes.len() => {
                self.enqueue(&bytes[n..]);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(ref e) if would_block(e) => {
                self.enqueue(bytes);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Called on writable readiness: push the head-of-queue chunk. On a
    /// short write the chunk keeps its tail; once the queue is empty the
    /// write interest is dropped.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        let Some(front) = self.send_buffer.front_mut() else {
            self.socket.set_want_write(false);
            return Ok(());
        };
        match syscall!(send(
            self.socket.fd(),
            front.as_ptr() as *const libc::c_void,
            front.len(),
            SEND_FLAGS,
        )) {
            Ok(n) if (n as usize) < front.len() => {
                front.drain(..n as usize);
                Ok(())
            }
            Ok(_) => {
                self.send_buffer.pop_front();
                if self.send_buffer.is_empty() {
                    self.socket.set_want_write(false);
                }
                Ok(())
            }
            Err(ref e) if would_block(e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.send_buffer.iter().map(Vec::len).sum()
    }

    /// Drops queued chunks; used on close, after which there is nothing to
    /// flush to.
    pub(crate) fn clear_buffer(&mut self) {
        self.send_buffer.clear();
    }

    fn raw_send(&self, bytes: &[u8]) -> io::Result<usize> {
        let n = syscall!(send(
            self.socket.fd(),
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            SEND_FLAGS,
        ))?;
        Ok(n as usize)
    }

    fn enqueue(&mut self, bytes: &[u8]) {
        self.send_buffer.push_back(bytes.to_vec());
        self.socket.set_want_write(true);
    }
}
