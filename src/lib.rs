//! # sluice
//!
//! A small HTTP server harness: compose a request pipeline, bind it to a TCP
//! port, a TLS port or a Unix socket, and stop it cleanly.
//!
//! ## The contract
//!
//! sluice owns the part of a service that is the same everywhere: getting
//! an endpoint, running requests through a fixed stack of stages, and
//! shutting down without dropping work. Routing, body parsing and
//! everything else that differs between applications stays in your
//! handler.
//!
//! - **Pipelines**: one terminal handler wrapped by [`Stage`]s, the last
//!   added outermost. See [`Pipeline`].
//! - **Endpoints**: explicit address, then `LISTEN_ADDR` / `PORT` (or
//!   `LISTEN_PATH` for Unix sockets), then an ephemeral loopback port. See
//!   [`listener`].
//! - **Shutdown**: [`Server::stop`] drains connections and runs every
//!   registered participant in parallel against one deadline, exactly once.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use sluice::{middleware, Pipeline, Request, Response};
//!
//! #[tokio::main]
//! async fn main() -> sluice::Result<()> {
//!     let pipeline = Pipeline::new(ping).filter(middleware::trace());
//!     let server = sluice::listen(pipeline, Some(":3000")).await?;
//!
//!     sluice::shutdown_signal().await;
//!     server.stop(Duration::from_secs(10)).await;
//!     Ok(())
//! }
//!
//! async fn ping(req: Request) -> Response {
//!     req.on_shutdown(|deadline| async move {
//!         // flush buffers, close streams, ... before `deadline`
//!         let _ = deadline;
//!     });
//!     Response::text("pong")
//! }
//! ```

mod config;
mod error;
mod handler;
mod pipeline;
mod request;
mod response;
mod server;
mod signal;

pub mod listener;
pub mod middleware;
pub mod tls;

pub use config::{Config, ConfigError, TlsFiles};
pub use error::{Error, Result};
pub use handler::{boxed, BoxedHandler, Handler};
pub use listener::{Addr, Endpoint, SocketCleanup};
pub use pipeline::{compose, Next, Pipeline, Stage};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
#[cfg(unix)]
pub use server::{listen_unix, listen_unix_tls};
pub use server::{listen, listen_tls, serve, Deadline, Phase, Server};
pub use signal::shutdown_signal;
pub use tls::TlsSettings;
