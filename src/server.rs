//! Server lifecycle and coordinated shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Running ──stop()──▶ ShuttingDown ──all branches returned──▶ Stopped
//! ```
//!
//! [`Server::stop`] runs once per server no matter how many callers race
//! it. It flips the server to `ShuttingDown` (waking everything parked on
//! [`Server::shutdown_started`]) and then, in parallel:
//!
//! - drains the transport: the listener is dropped so nothing new is
//!   accepted, and open connections are asked to finish gracefully. If the
//!   deadline passes first, every connection is torn down.
//! - runs every registered shutdown participant with the same deadline.
//!
//! The server is `Stopped` once every branch has returned. Participants are
//! trusted to honour their deadline: a participant that never returns holds
//! `stop` open with it.
//!
//! If the accept loop hits an error it cannot retry, the server stops itself
//! with an already-expired deadline rather than leave a dead listener behind.

use std::fmt;
use std::future::Future;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::listener::{self, Accept, Accepted, Addr, Endpoint, Io, SocketCleanup};
use crate::pipeline::{Next, Pipeline, Stage};
use crate::request::Request;
use crate::response::Response;
use crate::tls::TlsSettings;

/// How long aborted connections get to unwind before shutdown stops
/// waiting for them.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A TLS client that has not finished its handshake by then is dropped.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

// ── Deadline ──────────────────────────────────────────────────────────────────

/// The point in time by which shutdown work should be finished.
///
/// Every shutdown branch receives the same `Deadline`. It is advisory: work
/// that outlives it is not cancelled, but it is expected to wrap up
/// forcefully once [`expired`](Self::expired) resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    /// A deadline that has already passed: stop without a graceful window.
    pub fn expired_now() -> Self {
        Self(Instant::now())
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Resolves when the deadline passes.
    pub async fn expired(self) {
        tokio::time::sleep_until(self.0).await;
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Self::after(timeout)
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Where a server is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Running,
    ShuttingDown,
    Stopped,
}

type ParticipantFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Participant = Box<dyn FnOnce(Deadline) -> ParticipantFuture + Send>;

/// Handle to a running server. Cloning it is cheap; every clone controls
/// the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    addr: Addr,
    phase: watch::Sender<Phase>,
    state: Mutex<State>,
}

/// Everything registration and shutdown touch, behind one lock.
struct State {
    closed: bool,
    participants: Vec<Participant>,
    transport: Option<Transport>,
}

/// What the first `stop` takes out of [`State`].
struct Pending {
    participants: Vec<Participant>,
    transport: Option<Transport>,
}

/// The shutdown side of the accept loop.
struct Transport {
    drain: oneshot::Sender<Deadline>,
    done: oneshot::Receiver<()>,
}

impl Transport {
    async fn drain(self, deadline: Deadline) {
        // A send error means the loop is already gone; `done` still resolves.
        let _ = self.drain.send(deadline);
        let _ = self.done.await;
    }
}

impl Server {
    fn start<A: Accept>(pipeline: Pipeline, listener: A, tls: Option<TlsAcceptor>, addr: Addr) -> Self {
        let (drain_tx, drain_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let server = Self {
            inner: Arc::new(Inner {
                addr,
                phase: watch::Sender::new(Phase::Running),
                state: Mutex::new(State {
                    closed: false,
                    participants: Vec::new(),
                    transport: Some(Transport { drain: drain_tx, done: done_rx }),
                }),
            }),
        };

        info!(addr = %server.inner.addr, tls = tls.is_some(), "sluice listening");

        let pipeline = pipeline.filter(attach(server.clone()));
        tokio::spawn(accept_loop(listener, tls, pipeline, server.clone(), drain_rx, done_tx));
        server
    }

    pub fn local_addr(&self) -> &Addr {
        &self.inner.addr
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    /// Resolves once shutdown has begun. The server may still be draining.
    ///
    /// The returned future does not borrow the server, so it can be moved
    /// into background tasks that should wind down with it.
    pub fn shutdown_started(&self) -> impl Future<Output = ()> + Send + use<> {
        self.wait_for(|phase| phase != Phase::Running)
    }

    /// Resolves once shutdown has completed.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + use<> {
        self.wait_for(|phase| phase == Phase::Stopped)
    }

    fn wait_for(&self, done: fn(Phase) -> bool) -> impl Future<Output = ()> + Send + use<> {
        let mut rx = self.inner.phase.subscribe();
        async move {
            // The sender lives as long as `Inner`, which `rx` does not keep
            // alive; a closed channel means the server is gone anyway.
            let _ = rx.wait_for(|phase| done(*phase)).await;
        }
    }

    /// Registers `f` to run, in parallel with the transport drain, when the
    /// server stops.
    ///
    /// Registration never blocks. Once shutdown has begun it is too late:
    /// the participant is dropped without being called.
    pub fn on_shutdown<F, Fut>(&self, f: F)
    where
        F: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.closed {
            debug!(addr = %self.inner.addr, "shutdown already started; participant dropped");
            return;
        }
        state.participants.push(Box::new(move |deadline: Deadline| -> ParticipantFuture {
            Box::pin(f(deadline))
        }));
    }

    /// Stops the server, returning once every connection is closed and every
    /// participant has returned.
    ///
    /// Connections are drained gracefully until `deadline`, then closed
    /// forcefully. Only the first call does anything; every other call,
    /// concurrent or later, waits for that one to finish.
    pub async fn stop(&self, deadline: impl Into<Deadline>) {
        let deadline = deadline.into();
        if let Some(work) = self.begin_shutdown() {
            // Spawned so that dropping this future cannot abandon shutdown
            // halfway for the callers waiting below.
            tokio::spawn(self.clone().finish_shutdown(work, deadline));
        }
        self.stopped().await;
    }

    fn begin_shutdown(&self) -> Option<Pending> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        let participants = mem::take(&mut state.participants);
        let transport = state.transport.take();

        // Flipped under the lock: no registration can land after this point
        // and still be missed.
        self.inner.phase.send_replace(Phase::ShuttingDown);
        Some(Pending { participants, transport })
    }

    async fn finish_shutdown(self, work: Pending, deadline: Deadline) {
        let Pending { participants, transport } = work;
        info!(
            addr = %self.inner.addr,
            participants = participants.len(),
            grace = ?deadline.remaining(),
            "shutting down",
        );

        let mut branches = JoinSet::new();
        if let Some(transport) = transport {
            branches.spawn(transport.drain(deadline));
        }
        for participant in participants {
            branches.spawn(async move { participant(deadline).await });
        }

        while let Some(res) = branches.join_next().await {
            if let Err(e) = res {
                warn!(addr = %self.inner.addr, "shutdown participant failed: {e}");
            }
        }

        self.inner.phase.send_replace(Phase::Stopped);
        info!(addr = %self.inner.addr, "sluice stopped");
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.inner.addr)
            .field("phase", &self.phase())
            .finish()
    }
}

/// The stage that gives every request a handle back to its server.
fn attach(server: Server) -> impl Stage {
    move |mut req: Request, next: Next| {
        req.server = Some(server.clone());
        next.run(req)
    }
}

// ── Starting ──────────────────────────────────────────────────────────────────

/// Starts serving `pipeline` on an already-bound endpoint.
///
/// Must be called from within a tokio runtime.
pub fn serve(pipeline: Pipeline, endpoint: Endpoint) -> Server {
    let Endpoint { listener, tls, addr } = endpoint;
    Server::start(pipeline, listener, tls, addr)
}

/// Binds a TCP endpoint (see [`listener::bind`]) and serves `pipeline` on it.
pub async fn listen(pipeline: Pipeline, addr: Option<&str>) -> Result<Server> {
    Ok(serve(pipeline, listener::bind(addr, None).await?))
}

/// Binds a TLS-over-TCP endpoint and serves `pipeline` on it.
pub async fn listen_tls(pipeline: Pipeline, addr: Option<&str>, tls: &TlsSettings) -> Result<Server> {
    Ok(serve(pipeline, listener::bind(addr, Some(tls)).await?))
}

/// Binds a Unix socket endpoint and serves `pipeline` on it.
///
/// Call [`SocketCleanup::remove`] after the server stops.
#[cfg(unix)]
pub async fn listen_unix(
    pipeline: Pipeline,
    path: Option<&std::path::Path>,
) -> Result<(Server, SocketCleanup)> {
    let (endpoint, cleanup) = listener::bind_unix(path, None).await?;
    Ok((serve(pipeline, endpoint), cleanup))
}

/// Binds a TLS-over-Unix-socket endpoint and serves `pipeline` on it.
#[cfg(unix)]
pub async fn listen_unix_tls(
    pipeline: Pipeline,
    path: Option<&std::path::Path>,
    tls: &TlsSettings,
) -> Result<(Server, SocketCleanup)> {
    let (endpoint, cleanup) = listener::bind_unix(path, Some(tls)).await?;
    Ok((serve(pipeline, endpoint), cleanup))
}

// ── Accept loop ───────────────────────────────────────────────────────────────

enum Exit {
    Stop(Deadline),
    Failed,
}

async fn accept_loop<A: Accept>(
    mut listener: A,
    tls: Option<TlsAcceptor>,
    pipeline: Pipeline,
    server: Server,
    mut drain: oneshot::Receiver<Deadline>,
    done: oneshot::Sender<()>,
) {
    let graceful = GracefulShutdown::new();
    // Flipped when draining begins. Connections still in their TLS
    // handshake are not watched by `graceful` and listen for this instead.
    let (draining, _) = watch::channel(false);
    let mut conns = JoinSet::new();
    let mut backoff: Option<Duration> = None;

    let exit = loop {
        let res = tokio::select! {
            // Check for shutdown first so a stop request wins over a queue
            // of pending connections.
            biased;

            deadline = &mut drain => {
                break Exit::Stop(deadline.unwrap_or_else(|_| Deadline::expired_now()));
            }

            // Reap finished connection tasks so the set does not grow
            // without bound on long-running servers.
            Some(res) = conns.join_next(), if !conns.is_empty() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        warn!(addr = %server.inner.addr, "connection task panicked: {e}");
                    }
                }
                continue;
            }

            res = listener.accept() => res,
        };

        match res {
            Ok(accepted) => {
                backoff = None;
                let handshake = Handshake { tls: tls.clone(), draining: draining.subscribe() };
                spawn_connection(&mut conns, &graceful, accepted, handshake, pipeline.clone());
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.map_or(ACCEPT_BACKOFF_MIN, |d| (d * 2).min(ACCEPT_BACKOFF_MAX));
                backoff = Some(delay);
                warn!(addr = %server.inner.addr, retry_in = ?delay, "accept error: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(addr = %server.inner.addr, "serve error, forcing shutdown: {e}");
                break Exit::Failed;
            }
        }
    };

    let deadline = match exit {
        Exit::Stop(deadline) => deadline,
        Exit::Failed => {
            let stopper = server.clone();
            tokio::spawn(async move { stopper.stop(Deadline::expired_now()).await });
            // Whoever ends up running shutdown sends its deadline here.
            drain.await.unwrap_or_else(|_| Deadline::expired_now())
        }
    };

    // Dropping the listener releases the endpoint.
    drop(listener);
    draining.send_replace(true);
    drain_connections(graceful, &mut conns, deadline).await;
    let _ = done.send(());
}

/// What a new connection needs before it can be served.
struct Handshake {
    tls: Option<TlsAcceptor>,
    draining: watch::Receiver<bool>,
}

impl Handshake {
    /// Terminates TLS when configured. Gives up on timeout, on a failed
    /// handshake, or once the server starts draining.
    async fn run(self, io: Box<dyn Io>, peer: Option<SocketAddr>) -> Option<Box<dyn Io>> {
        let Some(acceptor) = self.tls else {
            return Some(io);
        };
        let mut draining = self.draining;

        tokio::select! {
            res = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(io)) => match res {
                Ok(Ok(stream)) => {
                    let stream: Box<dyn Io> = Box::new(stream);
                    Some(stream)
                }
                Ok(Err(e)) => {
                    debug!(peer = ?peer, "tls handshake failed: {e}");
                    None
                }
                Err(_) => {
                    debug!(peer = ?peer, "tls handshake timed out");
                    None
                }
            },
            () = async {
                let _ = draining.wait_for(|draining| *draining).await;
            } => {
                debug!(peer = ?peer, "server draining; dropping connection mid-handshake");
                None
            }
        }
    }
}

fn spawn_connection(
    conns: &mut JoinSet<()>,
    graceful: &GracefulShutdown,
    accepted: Accepted,
    handshake: Handshake,
    pipeline: Pipeline,
) {
    let watcher = graceful.watcher();
    let Accepted { io, peer } = accepted;

    conns.spawn(async move {
        let Some(io) = handshake.run(io, peer).await else {
            return;
        };

        // Called once per request on the connection, not once per connection.
        let svc = service_fn(move |req| dispatch(pipeline.clone(), req, peer));

        // `auto::Builder` serves HTTP/1.1 and HTTP/2, whichever the client
        // speaks. HTTP/2 streams run on `StreamTasks`, which this task owns.
        let builder = ConnBuilder::new(StreamTasks::default());
        let conn = builder.serve_connection(TokioIo::new(io), svc);
        if let Err(e) = watcher.watch(conn).await {
            debug!(peer = ?peer, "connection error: {e}");
        }
    });
}

/// Executor for the HTTP/2 streams of one connection.
///
/// The streams live in a `JoinSet` shared by every clone, and the only
/// clones are held by the connection's builder and `Connection`. When the
/// connection task ends, aborted or not, the set is dropped and every stream
/// still running is aborted with it.
#[derive(Clone, Default)]
struct StreamTasks {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl<F> hyper::rt::Executor<F> for StreamTasks
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        let mut tasks = self.tasks.lock();
        // Forget finished streams so a long-lived connection does not grow.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            fut.await;
        });
    }
}

/// Runs one request through the pipeline. Failures become responses, so
/// hyper never sees an error.
async fn dispatch(
    pipeline: Pipeline,
    req: hyper::Request<Incoming>,
    peer: Option<SocketAddr>,
) -> std::result::Result<http::Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match Request::from_incoming(req, peer).await {
        Ok(req) => pipeline.call(req).await,
        Err(e) => {
            debug!(peer = ?peer, "failed to read request body: {e}");
            Response::status(StatusCode::BAD_REQUEST)
        }
    };
    Ok(response.into_inner())
}

// ── Draining ──────────────────────────────────────────────────────────────────

async fn drain_connections(graceful: GracefulShutdown, conns: &mut JoinSet<()>, deadline: Deadline) {
    if deadline.is_expired() {
        debug!(open = conns.len(), "deadline already passed; closing connections");
        force_close(conns).await;
        return;
    }

    debug!(open = conns.len(), grace = ?deadline.remaining(), "draining connections");
    let drained = async {
        graceful.shutdown().await;
        // Connections still in their TLS handshake are not watched yet.
        while conns.join_next().await.is_some() {}
    };

    if tokio::time::timeout_at(deadline.instant(), drained).await.is_err() {
        debug!(open = conns.len(), "graceful drain timed out; forcibly closing connections");
        force_close(conns).await;
    } else {
        debug!("connections drained");
    }
}

/// Aborts every connection task and waits briefly for them to unwind.
///
/// A task only sees its abort at its next yield point, so a handler busy
/// with blocking work outlives the grace. Such tasks are detached: their
/// sockets close as soon as the handler returns control to the runtime.
async fn force_close(conns: &mut JoinSet<()>) {
    conns.abort_all();
    let reaped = tokio::time::timeout(FORCE_CLOSE_GRACE, async {
        while conns.join_next().await.is_some() {}
    })
    .await;

    if reaped.is_err() {
        error!(stuck = conns.len(), "aborted connections did not unwind in time; detaching them");
        conns.detach_all();
    }
}

// ── Accept errors ─────────────────────────────────────────────────────────────

/// Errors that concern one connection, or a momentary shortage, rather than
/// the listener itself.
fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind::*;

    matches!(
        e.kind(),
        ConnectionAborted | ConnectionRefused | ConnectionReset | Interrupted | OutOfMemory
            | TimedOut | WouldBlock
    ) || is_fd_exhaustion(e)
}

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    // ENFILE and EMFILE share these values on every Unix tokio supports.
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(e.raw_os_error(), Some(ENFILE | EMFILE))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_: &io::Error) -> bool {
    false
}
