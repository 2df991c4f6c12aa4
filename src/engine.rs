//! The engine facade
//!
//! [`Engine`] ties the binding registry, the handshake and the dispatcher
//! together. Hand it accepted streams (server side) or connected streams
//! (client side); every successful handshake yields a [`Connection`] that
//! the engine's worker pool services until it closes.

use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::Config;
use crate::connection::{Connection, Role};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::handshake::{client_handshake, server_handshake};
use crate::registry::{BindingRegistry, Negotiation};
use crate::transport::Transport;

type AcceptedFn = Arc<dyn Fn(&Arc<Connection>, &Negotiation) + Send + Sync>;
type FailedFn = Arc<dyn Fn(&Error) + Send + Sync>;

struct Inner {
    config: Config,
    bindings: BindingRegistry,
    dispatcher: Dispatcher,
    accepted: RwLock<Vec<AcceptedFn>>,
    failed: RwLock<Vec<FailedFn>>,
}

/// WebSocket engine
///
/// Cheap to clone; clones share the same bindings and worker pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create an engine and start its worker pool
    pub fn new(config: Config) -> Result<Self> {
        let dispatcher = Dispatcher::new(&config)?;
        info!(workers = dispatcher.worker_count(), "engine started");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                bindings: BindingRegistry::new(),
                dispatcher,
                accepted: RwLock::new(Vec::new()),
                failed: RwLock::new(Vec::new()),
            }),
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// URI bindings consulted by server handshakes
    pub fn bindings(&self) -> &BindingRegistry {
        &self.inner.bindings
    }

    /// The dispatcher servicing this engine's connections
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Observe every connection that completes a handshake
    ///
    /// Runs after the binding's success callback.
    pub fn on_connection_accepted<F>(&self, f: F)
    where
        F: Fn(&Arc<Connection>, &Negotiation) + Send + Sync + 'static,
    {
        self.inner.accepted.write().push(Arc::new(f));
    }

    /// Observe every failed handshake
    pub fn on_connection_failed<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.failed.write().push(Arc::new(f));
    }

    /// Run the server handshake on the calling thread
    ///
    /// On success the connection is handed to the worker pool and returned.
    /// On failure a best-effort `404 Not Found` has been written and the
    /// error is returned.
    pub fn accept<T: Transport>(&self, mut stream: T) -> Result<Arc<Connection>> {
        if !self.inner.dispatcher.is_running() {
            let _ = stream.shutdown();
            return Err(self.failed(Error::Shutdown));
        }

        let config = &self.inner.config;
        let handshake = match server_handshake(&mut stream, &self.inner.bindings, config.max_header_size) {
            Ok(handshake) => handshake,
            Err(e) => {
                let _ = stream.shutdown();
                return Err(self.failed(e));
            }
        };

        let negotiation = handshake.negotiation.clone();
        let conn = Connection::new(
            Box::new(stream),
            handshake.negotiation,
            handshake.leftover,
            Role::Server,
            config,
        );
        if let Some(binding) = &handshake.binding {
            binding.succeeded(&conn, &negotiation);
        }
        self.establish(conn, &negotiation)
    }

    /// Run the server handshake on a new thread
    ///
    /// The outcome is reported through the binding callbacks and the
    /// engine observers.
    pub fn accept_detached<T: Transport>(&self, stream: T) {
        let engine = self.clone();
        let spawned = thread::Builder::new()
            .name("typhoon-handshake".to_string())
            .spawn(move || {
                let _ = engine.accept(stream);
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn handshake thread");
            self.failed(e.into());
        }
    }

    /// Run the client handshake on the calling thread
    ///
    /// `uri` is the request target (e.g. `/chat`), `host` the `Host` header.
    pub fn connect<T: Transport>(
        &self,
        mut stream: T,
        host: &str,
        uri: &str,
        origin: Option<&str>,
        protocol: Option<&str>,
    ) -> Result<Arc<Connection>> {
        if !self.inner.dispatcher.is_running() {
            let _ = stream.shutdown();
            return Err(self.failed(Error::Shutdown));
        }

        let config = &self.inner.config;
        let handshake = match client_handshake(
            &mut stream,
            host,
            uri,
            origin,
            protocol,
            config.max_header_size,
        ) {
            Ok(handshake) => handshake,
            Err(e) => {
                let _ = stream.shutdown();
                return Err(self.failed(e));
            }
        };

        let negotiation = handshake.negotiation.clone();
        let conn = Connection::new(
            Box::new(stream),
            handshake.negotiation,
            handshake.leftover,
            Role::Client,
            config,
        );
        self.establish(conn, &negotiation)
    }

    fn establish(&self, conn: Arc<Connection>, negotiation: &Negotiation) -> Result<Arc<Connection>> {
        let observers = self.inner.accepted.read().clone();
        for observer in &observers {
            observer(&conn, negotiation);
        }

        if let Err(e) = self.inner.dispatcher.register(conn.clone()) {
            conn.abort();
            return Err(e);
        }
        Ok(conn)
    }

    fn failed(&self, error: Error) -> Error {
        let observers = self.inner.failed.read().clone();
        for observer in &observers {
            observer(&error);
        }
        error
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.inner.dispatcher.len()
    }

    /// Snapshot of the live connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.dispatcher.connections()
    }

    /// Stop the worker pool and release every connection
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.inner.dispatcher.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("bindings", &self.inner.bindings.len())
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}
