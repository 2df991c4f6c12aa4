//! A live WebSocket connection
//!
//! A [`Connection`] owns one stream after a successful handshake. It is
//! driven from outside: the dispatcher calls [`Connection::process`] on a
//! worker thread whenever the stream has bytes or the send queue has frames.
//! One process step:
//! 1. reads what is available into the input buffer
//! 2. decodes every complete frame, reassembles fragmented messages and
//!    answers control frames
//! 3. drains the send queue to the stream in FIFO order
//!
//! Status moves `Open -> Closing -> Closed` and never back. `Closed` is
//! reached only once the stream has been released.
//!
//! Application code observes the connection through listeners. Every
//! decoded frame is reported as [`Event::Fragment`] before reassembly runs,
//! so pings, pongs and close frames are visible too.

use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::Config;
use crate::dispatcher::Signal;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, FrameParser, OpCode};
use crate::handshake::Headers;
use crate::mask::generate_mask;
use crate::registry::Negotiation;
use crate::transport::Transport;

/// Largest payload a control frame may carry
const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the id
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Status {
    /// Messages flow both ways
    Open = 0,
    /// A Close frame was sent or received
    Closing = 1,
    /// The stream has been released
    Closed = 2,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Open,
            1 => Status::Closing,
            _ => Status::Closed,
        }
    }
}

/// Something that happened on a connection
#[derive(Debug)]
pub enum Event<'a> {
    /// A frame was decoded; reported before reassembly
    Fragment(&'a Frame),
    /// A complete text message arrived
    Text(&'a str),
    /// A complete binary message arrived
    Binary(&'a Bytes),
    /// Status moved to `Closing`
    Closing,
    /// Status moved to `Closed`; the stream is released
    Closed,
    /// The send queue was drained to the stream
    SendQueueEmpty,
    /// The connection failed and is being forced closed
    Failed {
        /// What went wrong
        reason: &'a Error,
    },
}

type Listener = Arc<dyn Fn(&Connection, &Event<'_>) + Send + Sync>;

/// State touched only by the worker processing the connection
struct Io {
    stream: Option<Box<dyn Transport>>,
    read_buf: BytesMut,
    parser: FrameParser,
    /// Payloads of the message in progress, concatenated in arrival order
    fragment_buf: BytesMut,
    /// Opcode of the first frame of the message in progress
    fragment_opcode: Option<OpCode>,
    /// Bytes left over from the handshake that have not been decoded yet
    unparsed: bool,
    close_received: bool,
    close_written: bool,
}

/// A WebSocket connection
pub struct Connection {
    id: ConnectionId,
    role: Role,
    negotiation: Negotiation,
    max_message_size: usize,
    read_buffer_size: usize,
    max_send_queue: usize,
    status: AtomicU8,
    /// A Close frame has been queued (by either side)
    close_queued: AtomicBool,
    /// Set by the dispatcher while the connection sits in a worker queue
    processing: AtomicBool,
    /// A listener panicked; the connection fails at the next chance
    listener_panicked: AtomicBool,
    /// Release was requested from inside this connection's own process step
    abort_requested: AtomicBool,
    /// Thread running a process step, if any
    stepping: Mutex<Option<ThreadId>>,
    io: Mutex<Io>,
    outgoing: Mutex<VecDeque<Frame>>,
    listeners: RwLock<Vec<Listener>>,
    signal: OnceLock<Arc<Signal>>,
}

impl Connection {
    pub(crate) fn new(
        stream: Box<dyn Transport>,
        negotiation: Negotiation,
        leftover: BytesMut,
        role: Role,
        config: &Config,
    ) -> Arc<Self> {
        let id = ConnectionId::next();
        debug!(connection = %id, uri = %negotiation.uri, ?role, "connection open");

        let unparsed = !leftover.is_empty();
        Arc::new(Self {
            id,
            role,
            negotiation,
            max_message_size: config.max_message_size,
            read_buffer_size: config.read_buffer_size,
            max_send_queue: config.max_send_queue,
            status: AtomicU8::new(Status::Open as u8),
            close_queued: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            listener_panicked: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            stepping: Mutex::new(None),
            io: Mutex::new(Io {
                stream: Some(stream),
                read_buf: leftover,
                parser: FrameParser::new(config.max_frame_size),
                fragment_buf: BytesMut::new(),
                fragment_opcode: None,
                unparsed,
                close_received: false,
                close_written: false,
            }),
            outgoing: Mutex::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            signal: OnceLock::new(),
        })
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Which end of the connection this is
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current status
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Check if the connection accepts new frames
    pub fn is_open(&self) -> bool {
        self.status() == Status::Open
    }

    /// Negotiated URI
    pub fn uri(&self) -> &str {
        &self.negotiation.uri
    }

    /// Origin sent during the handshake
    pub fn origin(&self) -> Option<&str> {
        self.negotiation.origin.as_deref()
    }

    /// Negotiated subprotocols
    pub fn protocols(&self) -> &[String] {
        &self.negotiation.protocols
    }

    /// The peer's handshake headers
    pub fn headers(&self) -> &Headers {
        &self.negotiation.headers
    }

    /// Register a listener for this connection's events
    ///
    /// Listeners run on the thread that triggered the event, usually a
    /// worker. They may call `send` and `close`.
    pub fn add_listener<F>(&self, f: F)
    where
        F: Fn(&Connection, &Event<'_>) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(f));
    }

    /// Queue a frame for sending
    ///
    /// Fails with [`Error::NotOpen`] unless the connection is open, and with
    /// [`Error::BufferFull`] when the send queue is at capacity.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if frame.is_control() && frame.payload().len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::InvalidFrame("control frame payload too large"));
        }
        if frame.opcode().is_reserved() {
            return Err(Error::InvalidFrame("reserved opcode"));
        }
        if frame.opcode() == OpCode::Close {
            return match frame.close_reason()? {
                Some(reason) => self.close(reason.code, &reason.reason),
                None => self.start_close(frame),
            };
        }

        {
            let mut queue = self.outgoing.lock();
            if !self.is_open() {
                return Err(Error::NotOpen);
            }
            if queue.len() >= self.max_send_queue {
                return Err(Error::BufferFull);
            }
            queue.push_back(frame);
        }
        self.wake();
        Ok(())
    }

    /// Queue a text message
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Frame::text(text))
    }

    /// Queue a binary message
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Frame::binary(data))
    }

    /// Queue a ping
    pub fn ping(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Frame::ping(data))
    }

    /// Start the closing handshake
    ///
    /// Queues a Close frame and moves to `Closing`. The connection reaches
    /// `Closed` once the peer's Close arrives or the peer hangs up.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        if 2 + reason.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::InvalidFrame("close reason too long"));
        }
        self.start_close(Frame::close(code, reason))
    }

    fn start_close(&self, frame: Frame) -> Result<()> {
        {
            let mut queue = self.outgoing.lock();
            if !self.is_open() || self.close_queued.swap(true, Ordering::AcqRel) {
                return Err(Error::NotOpen);
            }
            queue.push_back(frame);
            self.status.fetch_max(Status::Closing as u8, Ordering::AcqRel);
        }
        debug!(connection = %self.id, "closing");
        self.emit(&Event::Closing);
        self.wake();
        Ok(())
    }

    /// Number of frames waiting to be written
    pub fn queued(&self) -> usize {
        self.outgoing.lock().len()
    }

    /// Check whether a process step would make progress
    ///
    /// True when frames are queued, handshake leftovers are undecoded, or
    /// the stream has bytes (or an EOF or error) to report. A connection
    /// currently being processed reports false.
    pub fn has_pending_work(&self) -> bool {
        if self.status() == Status::Closed {
            return false;
        }
        if !self.outgoing.lock().is_empty() {
            return true;
        }
        let Some(mut io) = self.io.try_lock() else {
            return false;
        };
        if io.unparsed || self.listener_panicked.load(Ordering::Acquire) {
            return true;
        }
        match io.stream.as_mut() {
            Some(stream) => stream.poll_readable().unwrap_or(true),
            None => false,
        }
    }

    /// Run one process step: read, decode, dispatch, then write
    ///
    /// Any failure is handled here: the connection emits `Failed`, makes a
    /// best-effort attempt to send a Close frame and is forced `Closed`.
    /// A listener that panics fails the connection with close code 1011.
    pub fn process(&self) {
        let mut io = self.io.lock();
        if io.stream.is_none() {
            return;
        }
        let _stepping = Stepping::enter(&self.stepping);

        let result = self.step(&mut io).and_then(|()| self.check_listeners());
        if let Err(e) = result {
            if io.stream.is_some() {
                self.fail(&mut io, e);
            }
        }
        if self.abort_requested.load(Ordering::Acquire) {
            self.release(&mut io);
        }
    }

    fn step(&self, io: &mut Io) -> Result<()> {
        self.read_step(io)?;
        if io.stream.is_none() {
            return Ok(());
        }
        self.decode_step(io)?;
        self.write_step(io)
    }

    fn read_step(&self, io: &mut Io) -> Result<()> {
        let Some(stream) = io.stream.as_mut() else {
            return Ok(());
        };
        if !stream.poll_readable()? {
            return Ok(());
        }

        let start = io.read_buf.len();
        io.read_buf.resize(start + self.read_buffer_size, 0);
        let n = match stream.read(&mut io.read_buf[start..]) {
            Ok(n) => n,
            Err(e) => {
                io.read_buf.truncate(start);
                return Err(e.into());
            }
        };
        io.read_buf.truncate(start + n);

        if n == 0 {
            debug!(connection = %self.id, "peer closed the stream");
            self.release(io);
        }
        Ok(())
    }

    fn decode_step(&self, io: &mut Io) -> Result<()> {
        io.unparsed = false;
        while !io.close_received {
            let Some(frame) = io.parser.parse(&mut io.read_buf)? else {
                break;
            };
            trace!(
                connection = %self.id,
                opcode = ?frame.opcode(),
                fin = frame.fin(),
                len = frame.payload().len(),
                "frame received"
            );
            self.emit(&Event::Fragment(&frame));
            self.handle_frame(io, frame)?;
            self.check_listeners()?;
        }
        Ok(())
    }

    fn check_listeners(&self) -> Result<()> {
        if self.listener_panicked.swap(false, Ordering::AcqRel) {
            return Err(Error::ListenerPanicked);
        }
        Ok(())
    }

    fn handle_frame(&self, io: &mut Io, frame: Frame) -> Result<()> {
        let opcode = frame.opcode();
        if opcode.is_reserved() {
            return Err(Error::Protocol("reserved opcode"));
        }
        if opcode.is_control() {
            if !frame.fin() {
                return Err(Error::Protocol("fragmented control frame"));
            }
            if frame.payload().len() > MAX_CONTROL_PAYLOAD {
                return Err(Error::Protocol("control frame payload too large"));
            }
        }

        match opcode {
            OpCode::Text | OpCode::Binary => {
                if io.fragment_opcode.is_some() {
                    return Err(Error::Protocol("expected continuation frame"));
                }
                if frame.payload().len() > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                if frame.fin() {
                    self.deliver(opcode, frame.into_payload())
                } else {
                    io.fragment_opcode = Some(opcode);
                    io.fragment_buf.clear();
                    io.fragment_buf.extend_from_slice(frame.payload());
                    Ok(())
                }
            }
            OpCode::Continuation => {
                let first = io
                    .fragment_opcode
                    .ok_or(Error::Protocol("unexpected continuation frame"))?;
                if io.fragment_buf.len() + frame.payload().len() > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                io.fragment_buf.extend_from_slice(frame.payload());
                if frame.fin() {
                    io.fragment_opcode = None;
                    let data = io.fragment_buf.split().freeze();
                    self.deliver(first, data)
                } else {
                    Ok(())
                }
            }
            OpCode::Ping => {
                self.push_control(Frame::pong(frame.into_payload()));
                Ok(())
            }
            OpCode::Pong => Ok(()),
            OpCode::Close => self.handle_close(io, frame),
            OpCode::Reserved(_) => Err(Error::Protocol("reserved opcode")),
        }
    }

    fn deliver(&self, opcode: OpCode, data: Bytes) -> Result<()> {
        match opcode {
            OpCode::Text => {
                let text = std::str::from_utf8(&data).map_err(|_| Error::InvalidUtf8)?;
                self.emit(&Event::Text(text));
            }
            _ => self.emit(&Event::Binary(&data)),
        }
        Ok(())
    }

    fn handle_close(&self, io: &mut Io, frame: Frame) -> Result<()> {
        let reason = frame.close_reason()?;
        io.close_received = true;
        debug!(
            connection = %self.id,
            reason = ?reason,
            "close received"
        );

        let echoed = {
            let mut queue = self.outgoing.lock();
            if self.close_queued.swap(true, Ordering::AcqRel) {
                false
            } else {
                queue.push_back(Frame::new(OpCode::Close, frame.into_payload(), true));
                true
            }
        };

        if echoed && self.advance(Status::Closing) {
            self.emit(&Event::Closing);
        }
        Ok(())
    }

    fn write_step(&self, io: &mut Io) -> Result<()> {
        let mut wrote = false;
        loop {
            let Some(frame) = self.outgoing.lock().pop_front() else {
                break;
            };
            if io.close_written {
                // Nothing may follow a Close on the wire
                continue;
            }
            let Some(stream) = io.stream.as_mut() else {
                break;
            };

            let is_close = frame.opcode() == OpCode::Close;
            stream.write_all(&self.wire_bytes(frame))?;
            wrote = true;
            if is_close {
                io.close_written = true;
            }
        }

        if wrote {
            if let Some(stream) = io.stream.as_mut() {
                stream.flush()?;
            }
            self.emit(&Event::SendQueueEmpty);
        }

        if io.close_written && io.close_received {
            self.release(io);
        }
        Ok(())
    }

    fn wire_bytes(&self, frame: Frame) -> Bytes {
        match self.role {
            Role::Client => frame.with_mask(Some(generate_mask())).to_bytes(),
            Role::Server => frame.with_mask(None).to_bytes(),
        }
    }

    /// Queue a frame the connection generates itself (pong)
    ///
    /// Bypasses the queue bound; dropped once the connection is closing.
    fn push_control(&self, frame: Frame) {
        let mut queue = self.outgoing.lock();
        if self.is_open() {
            queue.push_back(frame);
        }
    }

    /// Force the connection closed
    ///
    /// Unless the transport itself failed, a Close carrying the error's code
    /// is written first. A Close queued earlier but not yet written is
    /// replaced by it, so the peer always learns why.
    fn fail(&self, io: &mut Io, error: Error) {
        warn!(connection = %self.id, error = %error, "connection failed");
        self.emit(&Event::Failed { reason: &error });

        self.close_queued.store(true, Ordering::Release);
        if !error.is_transport() && !io.close_written {
            let close = self.wire_bytes(Frame::close(error.close_code(), ""));
            if let Some(stream) = io.stream.as_mut() {
                let _ = stream.write_all(&close);
                let _ = stream.flush();
                io.close_written = true;
            }
        }
        self.release(io);
    }

    fn release(&self, io: &mut Io) {
        if let Some(mut stream) = io.stream.take() {
            let _ = stream.shutdown();
        }
        io.read_buf = BytesMut::new();
        io.fragment_buf = BytesMut::new();
        io.fragment_opcode = None;
        io.unparsed = false;
        self.outgoing.lock().clear();

        if self.advance(Status::Closed) {
            debug!(connection = %self.id, "connection closed");
            self.emit(&Event::Closed);
        }
    }

    /// Release the stream without a closing handshake
    ///
    /// Called from a listener of this connection, the release is deferred
    /// to the end of the running process step.
    pub(crate) fn abort(&self) {
        if *self.stepping.lock() == Some(thread::current().id()) {
            self.abort_requested.store(true, Ordering::Release);
            return;
        }
        let mut io = self.io.lock();
        self.release(&mut io);
    }

    fn advance(&self, to: Status) -> bool {
        self.status.fetch_max(to as u8, Ordering::AcqRel) < to as u8
    }

    fn emit(&self, event: &Event<'_>) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(self, event))).is_err() {
                warn!(connection = %self.id, event = ?event, "listener panicked");
                self.listener_panicked.store(true, Ordering::Release);
            }
        }
    }

    fn wake(&self) {
        if let Some(signal) = self.signal.get() {
            signal.notify();
        }
    }

    pub(crate) fn attach_signal(&self, signal: Arc<Signal>) {
        let _ = self.signal.set(signal);
    }

    /// Claim the connection for a worker; false if it is already claimed
    pub(crate) fn try_claim(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unclaim(&self) {
        self.processing.store(false, Ordering::Release);
    }

    /// Check whether the connection is queued on or held by a worker
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }
}

/// Marks the current thread as running a process step until dropped
struct Stepping<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> Stepping<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *slot.lock() = Some(thread::current().id());
        Stepping(slot)
    }
}

impl Drop for Stepping<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("uri", &self.negotiation.uri)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use crate::transport::{MemoryStream, duplex};
    use std::io::{Read, Write};

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn negotiation() -> Negotiation {
        Negotiation {
            uri: "/test".into(),
            origin: None,
            protocols: vec!["chat".into()],
            headers: Headers::new(),
        }
    }

    fn open_with(config: &Config, leftover: &[u8]) -> (Arc<Connection>, MemoryStream, Arc<Mutex<Vec<String>>>) {
        let (server, client) = duplex();
        let conn = Connection::new(
            Box::new(server),
            negotiation(),
            BytesMut::from(leftover),
            Role::Server,
            config,
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        conn.add_listener(move |_, event| {
            let entry = match event {
                Event::Fragment(frame) => format!("fragment:{:?}", frame.opcode()),
                Event::Text(text) => format!("text:{}", text),
                Event::Binary(data) => format!("binary:{}", data.len()),
                Event::Closing => "closing".to_string(),
                Event::Closed => "closed".to_string(),
                Event::SendQueueEmpty => "queue-empty".to_string(),
                Event::Failed { .. } => "failed".to_string(),
            };
            sink.lock().push(entry);
        });
        (conn, client, log)
    }

    fn open() -> (Arc<Connection>, MemoryStream, Arc<Mutex<Vec<String>>>) {
        open_with(&Config::default(), &[])
    }

    fn client_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, Some(MASK));
        buf.to_vec()
    }

    fn read_frame(stream: &mut MemoryStream) -> Frame {
        let mut parser = FrameParser::new(1 << 20);
        let mut buf = BytesMut::new();
        loop {
            if let Some(frame) = parser.parse(&mut buf).unwrap() {
                return frame;
            }
            let mut chunk = [0u8; 256];
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "stream ended before a full frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().clone()
    }

    #[test]
    fn test_text_message_delivered() {
        let (conn, mut client, log) = open();
        client.write_all(&client_frame(OpCode::Text, b"hello", true)).unwrap();

        assert!(conn.has_pending_work());
        conn.process();

        assert_eq!(entries(&log), vec!["fragment:Text", "text:hello"]);
        assert_eq!(conn.status(), Status::Open);
        assert!(!conn.has_pending_work());
    }

    #[test]
    fn test_fragmented_message_reassembled() {
        let (conn, mut client, log) = open();
        client.write_all(&client_frame(OpCode::Text, b"Hel", false)).unwrap();
        client.write_all(&client_frame(OpCode::Continuation, b"lo, ", false)).unwrap();
        client.write_all(&client_frame(OpCode::Continuation, b"World", true)).unwrap();

        conn.process();

        assert_eq!(
            entries(&log),
            vec![
                "fragment:Text",
                "fragment:Continuation",
                "fragment:Continuation",
                "text:Hello, World",
            ]
        );
    }

    #[test]
    fn test_fragmented_binary_keeps_first_opcode() {
        let (conn, mut client, log) = open();
        client.write_all(&client_frame(OpCode::Binary, &[1, 2], false)).unwrap();
        conn.process();
        // Ping between fragments is answered without disturbing reassembly
        client.write_all(&client_frame(OpCode::Ping, b"p", true)).unwrap();
        client.write_all(&client_frame(OpCode::Continuation, &[3], true)).unwrap();
        conn.process();

        let log = entries(&log);
        assert!(log.contains(&"binary:3".to_string()));
        assert_eq!(log.last().map(String::as_str), Some("queue-empty"));
        assert_eq!(read_frame(&mut client).opcode(), OpCode::Pong);
    }

    #[test]
    fn test_continuation_without_start_fails() {
        let (conn, mut client, log) = open();
        client
            .write_all(&client_frame(OpCode::Continuation, b"orphan", true))
            .unwrap();

        conn.process();

        assert_eq!(conn.status(), Status::Closed);
        assert_eq!(entries(&log), vec!["fragment:Continuation", "failed", "closed"]);

        let close = read_frame(&mut client);
        assert_eq!(close.opcode(), OpCode::Close);
        assert_eq!(
            close.close_reason().unwrap().unwrap().code,
            CloseReason::PROTOCOL_ERROR
        );
        assert!(conn.send_text("late").is_err());
    }

    #[test]
    fn test_new_message_during_fragmented_message_fails() {
        let (conn, mut client, _log) = open();
        client.write_all(&client_frame(OpCode::Text, b"a", false)).unwrap();
        client.write_all(&client_frame(OpCode::Text, b"b", true)).unwrap();
        conn.process();
        assert_eq!(conn.status(), Status::Closed);
    }

    #[test]
    fn test_reserved_opcode_fails() {
        let (conn, mut client, log) = open();
        client.write_all(&[0x83, 0x00]).unwrap();
        conn.process();
        assert_eq!(conn.status(), Status::Closed);
        assert!(entries(&log).contains(&"failed".to_string()));
    }

    #[test]
    fn test_invalid_utf8_fails_with_1007() {
        let (conn, mut client, _log) = open();
        client.write_all(&client_frame(OpCode::Text, &[0xff, 0xfe], true)).unwrap();
        conn.process();

        assert_eq!(conn.status(), Status::Closed);
        let close = read_frame(&mut client);
        assert_eq!(
            close.close_reason().unwrap().unwrap().code,
            CloseReason::INVALID_PAYLOAD
        );
    }

    #[test]
    fn test_message_too_large_fails() {
        let config = Config::builder().max_message_size(4).build();
        let (conn, mut client, _log) = open_with(&config, &[]);
        client.write_all(&client_frame(OpCode::Binary, &[0; 3], false)).unwrap();
        client.write_all(&client_frame(OpCode::Continuation, &[0; 3], true)).unwrap();
        conn.process();

        assert_eq!(conn.status(), Status::Closed);
        let close = read_frame(&mut client);
        assert_eq!(close.close_reason().unwrap().unwrap().code, CloseReason::TOO_BIG);
    }

    #[test]
    fn test_oversized_length_field_fails() {
        let config = Config::builder().max_frame_size(1024).build();
        let (conn, mut client, _log) = open_with(&config, &[]);
        // 64-bit length of 2^40 with no payload following
        client
            .write_all(&[0x82, 0x7F, 0, 0, 0x01, 0, 0, 0, 0, 0])
            .unwrap();
        conn.process();
        assert_eq!(conn.status(), Status::Closed);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (conn, mut client, log) = open();
        client.write_all(&client_frame(OpCode::Ping, b"are you there", true)).unwrap();
        conn.process();

        let pong = read_frame(&mut client);
        assert_eq!(pong.opcode(), OpCode::Pong);
        assert!(!pong.is_masked());
        assert_eq!(&pong.payload()[..], b"are you there");
        assert_eq!(entries(&log), vec!["fragment:Ping", "queue-empty"]);
    }

    #[test]
    fn test_peer_close_sequence() {
        let (conn, mut client, log) = open();
        let mut close = BytesMut::new();
        Frame::close(CloseReason::NORMAL, "bye")
            .with_mask(Some(MASK))
            .encode(&mut close);
        client.write_all(&close).unwrap();

        conn.process();

        assert_eq!(
            entries(&log),
            vec!["fragment:Close", "closing", "queue-empty", "closed"]
        );
        assert_eq!(conn.status(), Status::Closed);

        let echo = read_frame(&mut client);
        assert_eq!(echo.opcode(), OpCode::Close);
        assert_eq!(
            echo.close_reason().unwrap(),
            Some(CloseReason::new(CloseReason::NORMAL, "bye"))
        );

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_local_close_waits_for_peer() {
        let (conn, mut client, log) = open();
        conn.close(CloseReason::GOING_AWAY, "shutdown").unwrap();
        assert_eq!(conn.status(), Status::Closing);
        assert!(matches!(conn.send_text("x"), Err(Error::NotOpen)));
        assert!(matches!(conn.close(1000, ""), Err(Error::NotOpen)));

        conn.process();
        assert_eq!(conn.status(), Status::Closing);
        let sent = read_frame(&mut client);
        assert_eq!(sent.close_reason().unwrap().unwrap().code, CloseReason::GOING_AWAY);

        client
            .write_all(&client_frame(OpCode::Close, &1001u16.to_be_bytes(), true))
            .unwrap();
        conn.process();
        assert_eq!(conn.status(), Status::Closed);
        assert_eq!(entries(&log).first().map(String::as_str), Some("closing"));
        assert_eq!(entries(&log).last().map(String::as_str), Some("closed"));
    }

    #[test]
    fn test_close_rejects_bad_code() {
        let (conn, _client, _log) = open();
        assert!(matches!(conn.close(1005, ""), Err(Error::InvalidCloseCode(1005))));
        assert!(conn.close(1000, &"x".repeat(124)).is_err());
        assert!(conn.is_open());
    }

    #[test]
    fn test_send_queue_is_fifo_and_bounded() {
        let config = Config::builder().max_send_queue(2).build();
        let (conn, mut client, log) = open_with(&config, &[]);

        conn.send_text("one").unwrap();
        conn.send_binary(vec![2u8]).unwrap();
        assert!(matches!(conn.send_text("three"), Err(Error::BufferFull)));
        assert_eq!(conn.queued(), 2);
        assert!(conn.has_pending_work());

        conn.process();
        assert_eq!(conn.queued(), 0);
        assert_eq!(entries(&log), vec!["queue-empty"]);

        let first = read_frame(&mut client);
        assert_eq!(first.as_text().unwrap(), "one");
        let second = read_frame(&mut client);
        assert_eq!(second.opcode(), OpCode::Binary);
    }

    #[test]
    fn test_oversized_control_frame_rejected_on_send() {
        let (conn, _client, _log) = open();
        assert!(matches!(
            conn.ping(vec![0u8; 126]),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_peer_hangup_closes() {
        let (conn, client, log) = open();
        drop(client);
        assert!(conn.has_pending_work());
        conn.process();
        assert_eq!(conn.status(), Status::Closed);
        assert_eq!(entries(&log), vec!["closed"]);
        assert!(!conn.has_pending_work());
    }

    #[test]
    fn test_reset_fails_without_close_frame() {
        let (conn, client, log) = open();
        client.reset();
        conn.process();
        assert_eq!(conn.status(), Status::Closed);
        assert_eq!(entries(&log), vec!["failed", "closed"]);
    }

    #[test]
    fn test_handshake_leftover_is_decoded() {
        let leftover = client_frame(OpCode::Text, b"early", true);
        let (conn, _client, log) = open_with(&Config::default(), &leftover);

        assert!(conn.has_pending_work());
        conn.process();
        assert_eq!(entries(&log), vec!["fragment:Text", "text:early"]);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let (conn, mut client, log) = open();
        let frame = client_frame(OpCode::Text, b"split", true);
        client.write_all(&frame[..4]).unwrap();
        conn.process();
        assert!(entries(&log).is_empty());

        client.write_all(&frame[4..]).unwrap();
        conn.process();
        assert_eq!(entries(&log), vec!["fragment:Text", "text:split"]);
    }

    #[test]
    fn test_listener_can_reply() {
        let (conn, mut client, _log) = open();
        conn.add_listener(|conn, event| {
            if let Event::Text(text) = event {
                let _ = conn.send_text(text.to_uppercase());
            }
        });
        client.write_all(&client_frame(OpCode::Text, b"echo", true)).unwrap();
        conn.process();

        let reply = read_frame(&mut client);
        assert_eq!(reply.as_text().unwrap(), "ECHO");
    }

    #[test]
    fn test_client_role_masks_frames() {
        let (server, mut peer) = duplex();
        let conn = Connection::new(
            Box::new(server),
            negotiation(),
            BytesMut::new(),
            Role::Client,
            &Config::default(),
        );
        conn.send_text("masked").unwrap();
        conn.process();

        let frame = read_frame(&mut peer);
        assert!(frame.is_masked());
        assert_eq!(frame.as_text().unwrap(), "masked");
    }

    #[test]
    fn test_panicking_listener_fails_with_1011() {
        let (conn, mut client, log) = open();
        conn.add_listener(|_, event| {
            if let Event::Text(text) = event {
                panic!("listener gave up on {}", text);
            }
        });
        client.write_all(&client_frame(OpCode::Text, b"boom", true)).unwrap();
        client.write_all(&client_frame(OpCode::Text, b"after", true)).unwrap();

        conn.process();

        assert_eq!(conn.status(), Status::Closed);
        assert_eq!(
            entries(&log),
            vec!["fragment:Text", "text:boom", "failed", "closed"]
        );
        let close = read_frame(&mut client);
        assert_eq!(close.close_reason().unwrap().unwrap().code, CloseReason::INTERNAL);
    }

    #[test]
    fn test_abort_from_own_listener_is_deferred() {
        let (conn, mut client, log) = open();
        conn.add_listener(|conn, event| {
            if let Event::Text(_) = event {
                conn.abort();
            }
        });
        client.write_all(&client_frame(OpCode::Text, b"stop", true)).unwrap();

        conn.process();

        assert_eq!(conn.status(), Status::Closed);
        assert_eq!(entries(&log), vec!["fragment:Text", "text:stop", "closed"]);
        let mut rest = [0u8; 8];
        assert_eq!(client.read(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_peer_close_with_reserved_code_is_not_echoed() {
        // 1005 must never appear on the wire
        let (conn, mut client, log) = open();
        client
            .write_all(&client_frame(OpCode::Close, &1005u16.to_be_bytes(), true))
            .unwrap();
        conn.process();

        assert_eq!(conn.status(), Status::Closed);
        assert!(!entries(&log).contains(&"closing".to_string()));
        let close = read_frame(&mut client);
        assert_eq!(
            close.close_reason().unwrap().unwrap().code,
            CloseReason::PROTOCOL_ERROR
        );
    }

    #[test]
    fn test_peer_close_with_one_byte_body_fails() {
        let (conn, mut client, _log) = open();
        client.write_all(&client_frame(OpCode::Close, &[0x03], true)).unwrap();
        conn.process();

        assert_eq!(conn.status(), Status::Closed);
        let close = read_frame(&mut client);
        assert_eq!(
            close.close_reason().unwrap().unwrap().code,
            CloseReason::PROTOCOL_ERROR
        );
    }

    #[test]
    fn test_violation_after_local_close_still_sends_close() {
        let (conn, mut client, _log) = open();
        conn.close(CloseReason::NORMAL, "").unwrap();
        client
            .write_all(&client_frame(OpCode::Continuation, b"orphan", true))
            .unwrap();

        // The read fails the connection before the queued Close is written
        conn.process();

        assert_eq!(conn.status(), Status::Closed);
        let close = read_frame(&mut client);
        assert_eq!(close.opcode(), OpCode::Close);
        assert_eq!(
            close.close_reason().unwrap().unwrap().code,
            CloseReason::PROTOCOL_ERROR
        );
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_status_is_monotonic() {
        let (conn, _client, _log) = open();
        assert!(conn.advance(Status::Closed));
        assert!(!conn.advance(Status::Closing));
        assert_eq!(conn.status(), Status::Closed);
    }
}
