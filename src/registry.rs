//! URI bindings consulted during the opening handshake
//!
//! A binding says which subprotocols and origins a URI accepts, and carries
//! two optional callbacks:
//! - `on_accept` sees the negotiated request and may reject it
//! - `on_success` receives the new connection, typically to attach listeners
//!
//! Bindings are immutable once registered and matched by exact URI.
//!
//! # Example
//!
//! ```
//! use typhoon_ws::{AcceptDecision, Binding, BindingRegistry};
//!
//! let registry = BindingRegistry::new();
//! registry
//!     .register(
//!         Binding::builder(["/chat", "/chat/v2"])
//!             .accepted_protocols(["chat"])
//!             .on_accept(|negotiation| {
//!                 if negotiation.origin.is_some() {
//!                     AcceptDecision::Accept
//!                 } else {
//!                     AcceptDecision::Reject
//!                 }
//!             }),
//!     )
//!     .unwrap();
//!
//! assert!(registry.get("/chat/v2").is_some());
//! assert!(registry.get("/other").is_none());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handshake::Headers;

/// Verdict of a binding's accept callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptDecision {
    /// Continue with the handshake
    Accept,
    /// Fail the handshake
    Reject,
}

/// What a handshake settled on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Request URI
    pub uri: String,
    /// `Origin` header, if the peer sent one
    pub origin: Option<String>,
    /// Negotiated subprotocols, in the binding's order
    pub protocols: Vec<String>,
    /// The peer's handshake headers
    pub headers: Headers,
}

type AcceptFn = dyn Fn(&Negotiation) -> AcceptDecision + Send + Sync;
type SuccessFn = dyn Fn(&Arc<Connection>, &Negotiation) + Send + Sync;

/// A registered URI
#[derive(Clone)]
pub struct Binding {
    uri: String,
    accepted_protocols: Option<Arc<[String]>>,
    accepted_origins: Option<Arc<[String]>>,
    on_accept: Option<Arc<AcceptFn>>,
    on_success: Option<Arc<SuccessFn>>,
}

impl Binding {
    /// Start building bindings for one or more URIs
    pub fn builder<I, S>(uris: I) -> BindingBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BindingBuilder {
            uris: uris.into_iter().map(Into::into).collect(),
            accepted_protocols: None,
            accepted_origins: None,
            on_accept: None,
            on_success: None,
        }
    }

    /// URI this binding answers
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Accepted subprotocols; `None` means no restriction
    pub fn accepted_protocols(&self) -> Option<&[String]> {
        self.accepted_protocols.as_deref()
    }

    /// Accepted origins; `None` means no restriction
    pub fn accepted_origins(&self) -> Option<&[String]> {
        self.accepted_origins.as_deref()
    }

    /// Run the accept callback; without one every request is accepted
    pub fn decide(&self, negotiation: &Negotiation) -> AcceptDecision {
        match &self.on_accept {
            Some(f) => f(negotiation),
            None => AcceptDecision::Accept,
        }
    }

    /// Run the success callback, if any
    pub fn succeeded(&self, connection: &Arc<Connection>, negotiation: &Negotiation) {
        if let Some(f) = &self.on_success {
            f(connection, negotiation);
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("uri", &self.uri)
            .field("accepted_protocols", &self.accepted_protocols)
            .field("accepted_origins", &self.accepted_origins)
            .field("on_accept", &self.on_accept.is_some())
            .field("on_success", &self.on_success.is_some())
            .finish()
    }
}

/// Builder for [`Binding`]s sharing protocols, origins and callbacks
pub struct BindingBuilder {
    uris: Vec<String>,
    accepted_protocols: Option<Vec<String>>,
    accepted_origins: Option<Vec<String>>,
    on_accept: Option<Arc<AcceptFn>>,
    on_success: Option<Arc<SuccessFn>>,
}

fn dedup(values: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let value = value.into();
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

impl BindingBuilder {
    /// Restrict the subprotocols this URI accepts
    pub fn accepted_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_protocols = Some(dedup(protocols));
        self
    }

    /// Restrict the origins this URI accepts
    pub fn accepted_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_origins = Some(dedup(origins));
        self
    }

    /// Set the accept callback
    pub fn on_accept<F>(mut self, f: F) -> Self
    where
        F: Fn(&Negotiation) -> AcceptDecision + Send + Sync + 'static,
    {
        self.on_accept = Some(Arc::new(f));
        self
    }

    /// Set the success callback
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Connection>, &Negotiation) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    fn build(self) -> Vec<Binding> {
        let protocols: Option<Arc<[String]>> = self.accepted_protocols.map(Into::into);
        let origins: Option<Arc<[String]>> = self.accepted_origins.map(Into::into);
        self.uris
            .into_iter()
            .map(|uri| Binding {
                uri,
                accepted_protocols: protocols.clone(),
                accepted_origins: origins.clone(),
                on_accept: self.on_accept.clone(),
                on_success: self.on_success.clone(),
            })
            .collect()
    }
}

/// URI-keyed table of bindings
#[derive(Debug, Default)]
pub struct BindingRegistry {
    bindings: RwLock<HashMap<String, Arc<Binding>>>,
}

impl BindingRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every URI of the builder
    ///
    /// Nothing is registered if any URI is already bound (or listed twice).
    pub fn register(&self, builder: BindingBuilder) -> Result<()> {
        let mut bindings = self.bindings.write();

        for (i, uri) in builder.uris.iter().enumerate() {
            if bindings.contains_key(uri) || builder.uris[..i].contains(uri) {
                return Err(Error::DuplicateBinding(uri.clone()));
            }
        }

        for binding in builder.build() {
            debug!(uri = %binding.uri, "binding registered");
            bindings.insert(binding.uri.clone(), Arc::new(binding));
        }
        Ok(())
    }

    /// Remove the binding for `uri`; live connections are unaffected
    pub fn unregister(&self, uri: &str) -> bool {
        self.bindings.write().remove(uri).is_some()
    }

    /// Look up a binding by exact URI
    pub fn get(&self, uri: &str) -> Option<Arc<Binding>> {
        self.bindings.read().get(uri).cloned()
    }

    /// Number of bound URIs
    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    /// Check if no URI is bound
    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }
}
