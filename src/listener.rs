//! Listener acquisition: turning an address or socket path into a bound
//! [`Endpoint`].
//!
//! # Where a TCP endpoint binds
//!
//! The first of these that is present wins:
//!
//! 1. the address passed by the caller
//! 2. `LISTEN_ADDR`
//! 3. `PORT`, bound on all interfaces
//! 4. an ephemeral port on the loopback interface only
//!
//! Unix sockets follow the same idea: the caller's path, then
//! `LISTEN_PATH`, then a fresh path under the system temporary directory.
//! The environment is read once, at bind time.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::{Error, Result};
use crate::tls::TlsSettings;

pub const LISTEN_ADDR_ENV: &str = "LISTEN_ADDR";
pub const PORT_ENV: &str = "PORT";
pub const LISTEN_PATH_ENV: &str = "LISTEN_PATH";

const EPHEMERAL_LOOPBACK: &str = "127.0.0.1:0";

// ── Addr ──────────────────────────────────────────────────────────────────────

/// The local address of a bound endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Addr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Addr {
    pub fn as_tcp(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            Self::Unix(_) => None,
        }
    }

    pub fn as_unix(&self) -> Option<&Path> {
        match self {
            Self::Tcp(_) => None,
            Self::Unix(path) => Some(path),
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// A bound, listening socket, optionally terminating TLS.
pub struct Endpoint {
    pub(crate) listener: Listener,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) addr: Addr,
}

impl Endpoint {
    pub fn local_addr(&self) -> &Addr {
        &self.addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("addr", &self.addr)
            .field("tls", &self.is_tls())
            .finish()
    }
}

pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

// ── Accepting ─────────────────────────────────────────────────────────────────

/// Any byte stream a connection can be served over.
pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub(crate) struct Accepted {
    pub(crate) io: Box<dyn Io>,
    pub(crate) peer: Option<SocketAddr>,
}

/// A source of inbound connections for the accept loop.
pub(crate) trait Accept: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<Accepted>> + Send;
}

impl Accept for Listener {
    async fn accept(&mut self) -> io::Result<Accepted> {
        match self {
            Self::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                // Latency matters more than packet count for request/response.
                let _ = stream.set_nodelay(true);
                Ok(Accepted { io: Box::new(stream), peer: Some(peer) })
            }
            #[cfg(unix)]
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Accepted { io: Box::new(stream), peer: None })
            }
        }
    }
}

// ── TCP ───────────────────────────────────────────────────────────────────────

/// Picks the TCP address to bind, reading the environment through `env`.
///
/// Returns an unresolved address string; see [`resolve_tcp_addr`].
pub fn tcp_bind_target_with<F>(explicit: Option<&str>, env: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = explicit.filter(|a| !a.is_empty()) {
        return addr.to_owned();
    }
    if let Some(addr) = env(LISTEN_ADDR_ENV).filter(|a| !a.is_empty()) {
        return addr;
    }
    // An unparsable PORT is ignored rather than reported.
    if let Some(port) = env(PORT_ENV).and_then(|p| p.trim().parse::<u16>().ok()) {
        return SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).to_string();
    }
    EPHEMERAL_LOOPBACK.to_owned()
}

/// Picks the TCP address to bind from the process environment.
pub fn tcp_bind_target(explicit: Option<&str>) -> String {
    tcp_bind_target_with(explicit, env_var)
}

/// Resolves `host:port`, `[v6]:port`, `:port` (all interfaces) or a
/// `name:port` looked up through the system resolver.
pub async fn resolve_tcp_addr(input: &str) -> Result<SocketAddr> {
    let input = input.trim();
    let full = match input.strip_prefix(':') {
        Some(port) => format!("{}:{port}", Ipv4Addr::UNSPECIFIED),
        None => input.to_owned(),
    };
    if let Ok(addr) = full.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(full.as_str())
        .await
        .map_err(|e| Error::resolution(input, e))?
        .next()
        .ok_or_else(|| Error::resolution(input, "no addresses found"))
}

/// Binds a TCP endpoint, terminating TLS when `tls` is given.
///
/// `addr` of `None` or `""` defers to the environment, then to an ephemeral
/// loopback port.
pub async fn bind(addr: Option<&str>, tls: Option<&TlsSettings>) -> Result<Endpoint> {
    let target = tcp_bind_target(addr);
    let addr = resolve_tcp_addr(&target).await?;

    let listener = TcpListener::bind(addr).await.map_err(|e| Error::bind(addr, e))?;
    let local = listener.local_addr().map_err(|e| Error::bind(addr, e))?;

    info!(address = %local, tls = tls.is_some(), "endpoint bound");

    Ok(Endpoint {
        listener: Listener::Tcp(listener),
        tls: tls.map(TlsSettings::acceptor),
        addr: Addr::Tcp(local),
    })
}

// ── Unix ──────────────────────────────────────────────────────────────────────

/// Picks the socket path to bind, reading the environment through `env`.
pub fn unix_bind_path_with<F>(explicit: Option<&Path>, env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return path.to_owned();
    }
    if let Some(path) = env(LISTEN_PATH_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    std::env::temp_dir().join(format!("sluice-{}.sock", uuid::Uuid::new_v4()))
}

/// Picks the socket path to bind from the process environment.
pub fn unix_bind_path(explicit: Option<&Path>) -> PathBuf {
    unix_bind_path_with(explicit, env_var)
}

/// Removes a Unix socket file once its server has stopped.
///
/// Nothing happens on drop: the file stays until [`remove`](Self::remove)
/// is called, and while it exists no other endpoint can bind that path.
#[must_use = "the socket file stays on disk until `remove` is called"]
#[derive(Debug)]
pub struct SocketCleanup {
    path: PathBuf,
}

impl SocketCleanup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the socket file. A file that is already gone is not an error.
    pub fn remove(self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Binds a Unix domain socket endpoint, terminating TLS when `tls` is given.
///
/// The returned [`SocketCleanup`] must be invoked after the server stops.
#[cfg(unix)]
pub async fn bind_unix(
    path: Option<&Path>,
    tls: Option<&TlsSettings>,
) -> Result<(Endpoint, SocketCleanup)> {
    let path = unix_bind_path(path);
    if path.as_os_str().as_encoded_bytes().contains(&0) {
        return Err(Error::resolution(path.display().to_string(), "path contains a NUL byte"));
    }

    let listener = UnixListener::bind(&path).map_err(|e| Error::bind(path.display(), e))?;

    info!(path = %path.display(), tls = tls.is_some(), "endpoint bound");

    let endpoint = Endpoint {
        listener: Listener::Unix(listener),
        tls: tls.map(TlsSettings::acceptor),
        addr: Addr::Unix(path.clone()),
    };
    Ok((endpoint, SocketCleanup { path }))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
