//! # typhoon-ws: thread-pooled WebSocket protocol engine
//!
//! Turns raw bidirectional byte streams into RFC 6455 WebSocket connections
//! and services many of them concurrently on a fixed pool of worker threads.
//!
//! ## Pieces
//!
//! - **Frame codec** ([`frame`]): bit-exact, resumable frame decoding and encoding
//! - **Handshake** ([`handshake`]): HTTP/1.1 upgrade negotiation, server and client side
//! - **Bindings** ([`registry`]): URI-keyed accepted protocols/origins and callbacks
//! - **Connection** ([`connection`]): reassembly, control frames, send queue, close sequence
//! - **Dispatcher** ([`dispatcher`]): least-loaded assignment of connections to workers,
//!   never two workers on one connection
//! - **Engine** ([`engine`]): the facade tying all of the above together
//!
//! ## Example
//!
//! ```no_run
//! use std::net::TcpListener;
//! use typhoon_ws::{Binding, Config, Engine, Event};
//!
//! let engine = Engine::new(Config::default())?;
//! engine.bindings().register(
//!     Binding::builder(["/echo"])
//!         .on_success(|conn, _negotiation| {
//!             conn.add_listener(|conn, event| {
//!                 if let Event::Text(text) = event {
//!                     let _ = conn.send_text(*text);
//!                 }
//!             });
//!         }),
//! )?;
//!
//! let listener = TcpListener::bind("127.0.0.1:9001")?;
//! for stream in listener.incoming() {
//!     engine.accept_detached(stream?);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod registry;
pub mod transport;

pub use connection::{Connection, ConnectionId, Event, Role, Status};
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, FrameParser, OpCode};
pub use handshake::Headers;
pub use registry::{AcceptDecision, Binding, BindingBuilder, BindingRegistry, Negotiation};
pub use transport::{MemoryStream, Transport, duplex};

/// Default receive chunk size (64KB)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Small message threshold (<= 125 bytes uses the 2-byte header)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (<= 65535 bytes uses the 4-byte header)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum HTTP head size accepted during the handshake (8KB)
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Configuration for the engine and its connections
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use typhoon_ws::Config;
///
/// let config = Config::builder()
///     .worker_count(4)
///     .max_frame_size(1024 * 1024)
///     .dispatch_interval(Duration::from_millis(10))
///     .build();
/// assert_eq!(config.worker_count, 4);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum payload length of a single frame (default: 16MB)
    /// Larger length fields fail the connection instead of being awaited
    pub max_frame_size: usize,
    /// Maximum size of a reassembled message (default: 64MB)
    pub max_message_size: usize,
    /// Bytes read from the stream per process step (default: 64KB)
    pub read_buffer_size: usize,
    /// Maximum number of frames waiting in a connection's send queue (default: 1024)
    pub max_send_queue: usize,
    /// Maximum handshake head size in bytes (default: 8KB)
    pub max_header_size: usize,
    /// Number of worker threads (default: available parallelism)
    pub worker_count: usize,
    /// Dispatcher polling tick (default: 100ms)
    pub dispatch_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            read_buffer_size: RECV_BUFFER_SIZE,
            max_send_queue: 1024,
            max_header_size: MAX_HEADER_SIZE,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            dispatch_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for engine configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum frame payload length
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum reassembled message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set both frame and message limits
    pub fn max_payload_length(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self.config.max_message_size = size;
        self
    }

    /// Set per-step read chunk size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(1);
        self
    }

    /// Set send queue bound (in frames)
    pub fn max_send_queue(mut self, frames: usize) -> Self {
        self.config.max_send_queue = frames;
        self
    }

    /// Set maximum handshake head size
    pub fn max_header_size(mut self, size: usize) -> Self {
        self.config.max_header_size = size;
        self
    }

    /// Set the number of worker threads (at least 1)
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count.max(1);
        self
    }

    /// Set the dispatcher polling tick
    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.config.dispatch_interval = interval;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::connection::{Connection, Event, Status};
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::registry::{AcceptDecision, Binding, Negotiation};
}
