//! WebSocket opening handshake
//!
//! This module handles the HTTP/1.1 upgrade exchange for both ends:
//! - Server side: read the request head, look up the URI binding, validate
//!   the upgrade headers, negotiate origin and subprotocols, run the
//!   binding's accept callback and answer `101 Switching Protocols`
//! - Client side: send the upgrade request and verify the server's
//!   `Sec-WebSocket-Accept` against the locally generated key
//!
//! Any failure on the server side writes a best-effort `404 Not Found`
//! before the error is returned to the caller.

use std::io::{Read, Write};
use std::sync::Arc;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::WS_GUID;
use crate::error::{Error, Result};
use crate::mask::fill_random;
use crate::registry::{AcceptDecision, Binding, BindingRegistry, Negotiation};

/// Response written when a handshake fails
pub const FAILURE_RESPONSE: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";

/// Maximum number of header lines in a handshake head
const MAX_HEADERS: usize = 64;

/// Size of each read while collecting a handshake head
const HEAD_READ_CHUNK: usize = 1024;

/// HTTP header collection with case-insensitive lookup
///
/// Repeated header names are folded into one entry: the later value is
/// appended to the earlier one with a single space between them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, folding it into an existing entry of the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some((_, existing)) => {
                existing.push(' ');
                existing.push_str(&value);
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Get a header value by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check if a header is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate over `(name, value)` pairs in arrival order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of distinct header names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn from_httparse(raw: &[httparse::Header<'_>]) -> Result<Self> {
        let mut headers = Headers::new();
        for header in raw {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| Error::InvalidHttp("invalid header value"))?;
            headers.append(header.name, value.trim());
        }
        Ok(headers)
    }
}

/// Parsed HTTP request head
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method
    pub method: String,
    /// Request target, matched verbatim against bindings
    pub uri: String,
    /// Protocol version, e.g. `HTTP/1.1`
    pub version: String,
    /// Request headers
    pub headers: Headers,
}

/// Parsed HTTP response head
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Protocol version, e.g. `HTTP/1.1`
    pub version: String,
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Response headers
    pub headers: Headers,
}

fn version_string(minor: Option<u8>) -> String {
    format!("HTTP/1.{}", minor.unwrap_or(1))
}

/// Parse an HTTP request head (CRLF or bare LF line endings)
///
/// Returns the parsed request and the number of bytes consumed, or `None`
/// if the head is not complete yet.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let request = HttpRequest {
                method: req.method.unwrap_or_default().to_string(),
                uri: req.path.unwrap_or("/").to_string(),
                version: version_string(req.version),
                headers: Headers::from_httparse(req.headers)?,
            };
            Ok(Some((request, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP request")),
    }
}

/// Parse an HTTP response head
pub fn parse_response(buf: &[u8]) -> Result<Option<(HttpResponse, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let response = HttpResponse {
                version: version_string(res.version),
                status: res.code.unwrap_or(0),
                reason: res.reason.unwrap_or_default().to_string(),
                headers: Headers::from_httparse(res.headers)?,
            };
            Ok(Some((response, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP response")),
    }
}

/// Read from `stream` until `parse` recognizes a complete head
///
/// Returns the parsed head and any bytes read past its end.
fn read_head<S, T>(
    stream: &mut S,
    max_header_size: usize,
    parse: fn(&[u8]) -> Result<Option<(T, usize)>>,
) -> Result<(T, BytesMut)>
where
    S: Read + ?Sized,
{
    let mut buf = BytesMut::with_capacity(HEAD_READ_CHUNK);
    let mut chunk = [0u8; HEAD_READ_CHUNK];

    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head, consumed)) = parse(&buf)? {
            let leftover = buf.split_off(consumed);
            return Ok((head, leftover));
        }

        if buf.len() > max_header_size {
            return Err(Error::InvalidHttp("head too large"));
        }
    }
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept
}

/// Generate a random WebSocket key: 16 random bytes, base64-encoded
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Build a WebSocket upgrade response
pub fn build_response(accept_key: &str, protocols: &[String]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if !protocols.is_empty() {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(protocols.join(", ").as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build a WebSocket upgrade request (client-side)
pub fn build_request(
    host: &str,
    path: &str,
    key: &str,
    origin: Option<&str>,
    protocol: Option<&str>,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(origin) = origin.filter(|o| !o.is_empty()) {
        buf.put_slice(b"Origin: ");
        buf.put_slice(origin.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(proto) = protocol.filter(|p| !p.is_empty()) {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    buf.put_slice(b"\r\n");
    buf.freeze()
}

fn header_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Outcome of a successful server-side negotiation
#[derive(Clone)]
pub struct Accepted {
    /// Binding the request URI resolved to
    pub binding: Arc<Binding>,
    /// Negotiated URI, origin, protocols and request headers
    pub negotiation: Negotiation,
    /// `101 Switching Protocols` response to write
    pub response: Bytes,
}

/// Validate an upgrade request against the registry
///
/// Runs the binding's accept callback last; a rejection fails with
/// [`Error::Rejected`]. No I/O is performed.
pub fn negotiate(request: &HttpRequest, registry: &BindingRegistry) -> Result<Accepted> {
    if request.method != "GET" {
        return Err(Error::InvalidHttp("method must be GET"));
    }

    let binding = registry
        .get(&request.uri)
        .ok_or_else(|| Error::BindingNotFound(request.uri.clone()))?;

    let headers = &request.headers;
    if !headers
        .get("Upgrade")
        .is_some_and(|v| header_has_token(v, "websocket"))
    {
        return Err(Error::HandshakeFailed("missing Upgrade: websocket"));
    }
    if headers.get("Sec-WebSocket-Version") != Some("13") {
        return Err(Error::HandshakeFailed("missing Sec-WebSocket-Version: 13"));
    }
    let key = headers
        .get("Sec-WebSocket-Key")
        .filter(|k| !k.is_empty())
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;

    let origin = headers.get("Origin").map(str::to_string);
    if let Some(accepted) = binding.accepted_origins() {
        match origin.as_deref() {
            Some(o) if accepted.iter().any(|a| a == o) => {}
            _ => return Err(Error::HandshakeFailed("origin not accepted")),
        }
    }

    let mut protocols = Vec::new();
    if let Some(accepted) = binding.accepted_protocols() {
        let requested = headers
            .get("Sec-WebSocket-Protocol")
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Protocol"))?;
        let requested: Vec<&str> = requested.split(',').map(str::trim).collect();
        protocols = accepted
            .iter()
            .filter(|p| requested.contains(&p.as_str()))
            .cloned()
            .collect();
        if protocols.is_empty() {
            return Err(Error::HandshakeFailed("no common subprotocol"));
        }
    }

    let negotiation = Negotiation {
        uri: request.uri.clone(),
        origin,
        protocols,
        headers: headers.clone(),
    };

    if binding.decide(&negotiation) == AcceptDecision::Reject {
        return Err(Error::Rejected);
    }

    let response = build_response(&generate_accept_key(key), &negotiation.protocols);
    Ok(Accepted {
        binding,
        negotiation,
        response,
    })
}

/// Result of a successful handshake on either side
pub struct Handshake {
    /// Negotiated URI, origin, protocols and the peer's headers
    pub negotiation: Negotiation,
    /// Binding that accepted the request (server side only)
    pub binding: Option<Arc<Binding>>,
    /// Bytes read past the end of the head; they belong to the first frames
    pub leftover: BytesMut,
}

/// Perform the server side of the handshake on a blocking stream
///
/// On failure a `404 Not Found` is written (unless the stream itself failed)
/// and the error is returned.
pub fn server_handshake<S>(
    stream: &mut S,
    registry: &BindingRegistry,
    max_header_size: usize,
) -> Result<Handshake>
where
    S: Read + Write + ?Sized,
{
    let result = read_head(stream, max_header_size, parse_request).and_then(
        |(request, leftover)| {
            let accepted = negotiate(&request, registry)?;
            stream.write_all(&accepted.response)?;
            stream.flush()?;
            Ok(Handshake {
                negotiation: accepted.negotiation,
                binding: Some(accepted.binding),
                leftover,
            })
        },
    );

    match result {
        Ok(handshake) => {
            debug!(
                uri = %handshake.negotiation.uri,
                protocols = ?handshake.negotiation.protocols,
                "server handshake complete"
            );
            Ok(handshake)
        }
        Err(e) => {
            debug!(error = %e, "server handshake failed");
            if !e.is_transport() {
                let _ = stream.write_all(FAILURE_RESPONSE);
                let _ = stream.flush();
            }
            Err(e)
        }
    }
}

/// Perform the client side of the handshake on a blocking stream
///
/// Fails unless the server answers `101` with the expected accept key.
pub fn client_handshake<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    origin: Option<&str>,
    protocol: Option<&str>,
    max_header_size: usize,
) -> Result<Handshake>
where
    S: Read + Write + ?Sized,
{
    let key = generate_key();
    let request = build_request(host, path, &key, origin, protocol);

    stream.write_all(&request)?;
    stream.flush()?;

    let (response, leftover) = read_head(stream, max_header_size, parse_response)?;

    if response.status != 101 {
        debug!(status = response.status, "client handshake refused");
        return Err(Error::HandshakeFailed("expected 101 Switching Protocols"));
    }

    let accept = response
        .headers
        .get("Sec-WebSocket-Accept")
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Accept"))?;
    if !validate_accept_key(&key, accept) {
        return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Accept"));
    }

    let protocols = response
        .headers
        .get("Sec-WebSocket-Protocol")
        .map(|p| {
            p.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    debug!(uri = %path, "client handshake complete");
    Ok(Handshake {
        negotiation: Negotiation {
            uri: path.to_string(),
            origin: origin.map(str::to_string),
            protocols,
            headers: response.headers,
        },
        binding: None,
        leftover,
    })
}
