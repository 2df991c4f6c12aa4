//! Byte-stream transports a connection can run on
//!
//! The engine consumes an already-accepted, bidirectional, blocking stream.
//! TLS termination, if any, happens below this layer. Besides `Read + Write`
//! a transport must answer one non-blocking question for the dispatcher:
//! would a read make progress right now?
//!
//! Two implementations ship with the crate:
//! - `std::net::TcpStream`
//! - [`MemoryStream`], an in-process pipe pair created with [`duplex`]
//!
//! # Example
//!
//! ```
//! use std::io::{Read, Write};
//! use typhoon_ws::{Transport, duplex};
//!
//! let (mut a, mut b) = duplex();
//! a.write_all(b"ping").unwrap();
//! assert!(b.poll_readable().unwrap());
//!
//! let mut buf = [0u8; 4];
//! b.read_exact(&mut buf).unwrap();
//! assert_eq!(&buf, b"ping");
//! ```

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A blocking bidirectional byte stream
pub trait Transport: Read + Write + Send + 'static {
    /// Check, without blocking, whether a read would return immediately
    ///
    /// True when bytes are buffered, the peer shut down (read returns 0),
    /// or an error is pending (read fails).
    fn poll_readable(&mut self) -> io::Result<bool>;

    /// Release the stream; both directions are closed
    fn shutdown(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn poll_readable(&mut self) -> io::Result<bool> {
        self.set_nonblocking(true)?;
        let mut probe = [0u8; 1];
        let result = self.peek(&mut probe);
        self.set_nonblocking(false)?;

        match result {
            // Ok(0) is an orderly shutdown, which the next read reports
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(_) => Ok(true),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// One direction of an in-memory pipe
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    /// Writer hung up; reads drain `buf` then return 0
    write_closed: bool,
    /// Reader hung up; writes fail with `BrokenPipe`
    read_closed: bool,
    /// Abortive close; reads and writes fail with `ConnectionReset`
    reset: bool,
}

impl Pipe {
    fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock();
        loop {
            if state.reset {
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            if state.read_closed {
                return Ok(0);
            }
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for (slot, byte) in out.iter_mut().zip(state.buf.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.write_closed {
                return Ok(0);
            }
            self.readable.wait(&mut state);
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.reset {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        if state.read_closed || state.write_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.buf.extend(data);
        drop(state);
        self.readable.notify_all();
        Ok(data.len())
    }

    fn readable_now(&self) -> bool {
        let state = self.state.lock();
        state.reset || state.read_closed || state.write_closed || !state.buf.is_empty()
    }

    fn update(&self, f: impl FnOnce(&mut PipeState)) {
        f(&mut self.state.lock());
        self.readable.notify_all();
    }
}

/// One end of an in-memory duplex stream
///
/// Reads block until the peer writes or hangs up. Dropping an end shuts it
/// down, so the peer observes an orderly EOF.
pub struct MemoryStream {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

/// Create a connected pair of in-memory streams
pub fn duplex() -> (MemoryStream, MemoryStream) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    (
        MemoryStream {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
        },
        MemoryStream {
            incoming: a_to_b,
            outgoing: b_to_a,
        },
    )
}

impl MemoryStream {
    /// Abort both directions; every pending and future I/O on either end
    /// fails with `ConnectionReset`
    pub fn reset(&self) {
        self.incoming.update(|s| s.reset = true);
        self.outgoing.update(|s| s.reset = true);
    }

    /// Number of bytes written by the peer and not yet read
    pub fn buffered(&self) -> usize {
        self.incoming.state.lock().buf.len()
    }

    /// Check whether this end has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.incoming.state.lock().read_closed
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.incoming.read(buf)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryStream {
    fn poll_readable(&mut self) -> io::Result<bool> {
        Ok(self.incoming.readable_now())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.incoming.update(|s| s.read_closed = true);
        self.outgoing.update(|s| s.write_closed = true);
        Ok(())
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        let _ = Transport::shutdown(self);
    }
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("buffered", &self.buffered())
            .finish()
    }
}
