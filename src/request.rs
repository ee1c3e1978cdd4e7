//! Incoming HTTP request type.

use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use http::request::Parts;
use http::{Extensions, HeaderMap, Method, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;

use crate::server::{Deadline, Server};

/// An incoming HTTP request with its body fully buffered.
///
/// Stages may rewrite headers and extensions before delegating downstream.
/// Requests that arrive through a [`Server`] carry a handle to it, which is
/// how a handler registers its own shutdown work with [`Request::on_shutdown`].
pub struct Request {
    pub(crate) parts: Parts,
    pub(crate) body: Bytes,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) server: Option<Server>,
}

impl Request {
    /// Wraps a plain `http` request. No server is attached.
    pub fn from_http(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self { parts, body, peer_addr: None, server: None }
    }

    pub(crate) async fn from_incoming(
        req: hyper::Request<Incoming>,
        peer_addr: Option<SocketAddr>,
    ) -> Result<Self, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Self { parts, body, peer_addr, server: None })
    }

    pub fn method(&self) -> &Method { &self.parts.method }
    pub fn uri(&self) -> &Uri { &self.parts.uri }
    pub fn path(&self) -> &str { self.parts.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.parts.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.parts.headers }
    pub fn extensions(&self) -> &Extensions { &self.parts.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.parts.extensions }
    pub fn body(&self) -> &[u8] { &self.body }

    /// The TCP peer, when the request arrived over TCP.
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer_addr }

    /// Header lookup. Names are case-insensitive; non-UTF-8 values are skipped.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The server this request arrived through, if any.
    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    /// Registers `f` to run when the owning server stops.
    ///
    /// Typical use is a streaming handler registering its own drain routine
    /// the first time it runs. Registration is best-effort: a call that
    /// races an in-flight [`Server::stop`] may be dropped.
    pub fn on_shutdown<F, Fut>(&self, f: F)
    where
        F: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match &self.server {
            Some(server) => server.on_shutdown(f),
            None => tracing::debug!(path = %self.path(), "no server attached; shutdown hook ignored"),
        }
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        Self::from_http(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let req: Request = http::Request::builder()
            .uri("/a/b?x=1")
            .header("X-Request-Id", "abc")
            .body(Bytes::from_static(b"payload"))
            .unwrap()
            .into();

        assert_eq!(req.header("x-request-id"), Some("abc"));
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.body(), b"payload");
        assert!(req.peer_addr().is_none());
    }

    #[test]
    fn shutdown_hook_without_server_is_ignored() {
        let req = Request::from_http(http::Request::new(Bytes::new()));
        assert!(req.server().is_none());
        req.on_shutdown(|_| async { unreachable!("no server to run this"); });
    }
}
