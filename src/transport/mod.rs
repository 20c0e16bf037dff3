//! The transport layer: framed request/response over a pluggable wire
//! protocol, with a symmetric [`Sender`] and [`Receiver`].
//!
//! HTTP is the chosen realization ([`http::HttpSender`],
//! [`http::HttpReceiver`]); an in-process [`callback::CallbackNetwork`]
//! delivers the same contract directly to registered handlers, bypassing
//! the network, for testing.

pub mod callback;
pub mod http;

use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{NetfsError, Result};

/// A decoded inbound request delivered to a registered [`Handler`].
#[derive(Debug, Clone, Default)]
pub struct Request {
    params: HashMap<String, String>,
    body: Vec<u8>,
    source_ip: Option<Ipv4Addr>,
}

impl Request {
    pub fn new(params: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self { params, body, source_ip: None }
    }

    /// Tags this request with the address it was observed arriving from.
    /// `None` for transports (e.g. the in-process callback one) that have
    /// no real network origin to report.
    pub fn with_source_ip(mut self, ip: Ipv4Addr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// The address this request was observed arriving from, used by the
    /// `server/stop` local-origin check.
    pub fn source_ip(&self) -> Option<Ipv4Addr> {
        self.source_ip
    }

    /// A query parameter, e.g. `path` or `id`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The raw request body.
    pub fn raw_body(&self) -> &[u8] {
        &self.body
    }

    /// Decodes the request body as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// What a handler produces: either a structured (JSON-encoded) value, raw
/// bytes, or nothing.
#[derive(Debug, Clone, Default)]
pub struct Response {
    raw: Option<Vec<u8>>,
    json: Option<serde_json::Value>,
}

impl Response {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn raw(bytes: Vec<u8>) -> Self {
        Self { raw: Some(bytes), json: None }
    }

    pub fn json(value: impl Serialize) -> Result<Self> {
        Ok(Self { raw: None, json: Some(serde_json::to_value(value)?) })
    }

    /// The bytes a transport should actually put on the wire.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if let Some(raw) = self.raw {
            Ok(raw)
        } else if let Some(json) = self.json {
            Ok(serde_json::to_vec(&json)?)
        } else {
            Ok(Vec::new())
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An endpoint handler: `(Request) -> (rawBytes, structured, error)`,
/// object-safe so receivers can store a heterogeneous table of them.
pub trait Handler: Send + Sync {
    fn handle(&self, req: Request) -> BoxFuture<'static, Result<Response>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn handle(&self, req: Request) -> BoxFuture<'static, Result<Response>> {
        Box::pin(self(req))
    }
}

/// Sends a single request to a peer and, optionally, receives its response.
///
/// Object-safe on purpose (stored as `Arc<dyn Sender>` by the Task Engine
/// and Peer Client API); the generic JSON convenience wrappers live in the
/// free functions below instead of on the trait.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Performs one request, returning the raw response bytes.
    ///
    /// Fails with [`NetfsError::UnexpectedAnswer`] on a non-success status
    /// and [`NetfsError::Timeout`] if the configured deadline elapses.
    async fn send(&self, ip: Ipv4Addr, endpoint: &str, params: &[(String, String)], body: Option<Vec<u8>>) -> Result<Vec<u8>>;
}

/// Sends a structured body and decodes a structured response.
pub async fn send_json<T: DeserializeOwned>(
    sender: &dyn Sender,
    ip: Ipv4Addr,
    endpoint: &str,
    params: &[(String, String)],
    body: Option<&impl Serialize>,
) -> Result<T> {
    let encoded = body.map(serde_json::to_vec).transpose()?;
    let raw = sender.send(ip, endpoint, params, encoded).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Sends a structured body, discarding any response body.
pub async fn send_json_body(sender: &dyn Sender, ip: Ipv4Addr, endpoint: &str, body: &impl Serialize) -> Result<()> {
    let encoded = serde_json::to_vec(body)?;
    sender.send(ip, endpoint, &[], Some(encoded)).await?;
    Ok(())
}

/// Sends a raw byte body, discarding any response body.
pub async fn send_raw_body(sender: &dyn Sender, ip: Ipv4Addr, endpoint: &str, params: &[(String, String)], body: Vec<u8>) -> Result<()> {
    sender.send(ip, endpoint, params, Some(body)).await?;
    Ok(())
}

/// Binds endpoints to handlers and owns the listener lifecycle.
///
/// `start` is non-blocking: it spawns the serving loop and returns. `stop`
/// drains in-flight requests within a bounded grace period.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Registers a handler for an endpoint. Must be called before `start`.
    fn bind(&self, endpoint: &str, handler: Arc<dyn Handler>);

    /// Starts serving the bound endpoints. Non-blocking.
    async fn start(&self) -> Result<()>;

    /// Stops serving, draining in-flight requests with a bounded grace period.
    async fn stop(&self) -> Result<()>;
}

pub(crate) fn unsupported(protocol: &str) -> NetfsError {
    NetfsError::UnsupportedProtocol(protocol.to_string())
}
