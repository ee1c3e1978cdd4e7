//! Serves `/ping` until SIGINT or SIGTERM, then drains and exits.
//!
//! ```text
//! cargo run --example ping                 # env vars or an ephemeral port
//! cargo run --example ping -- sluice.toml  # settings from a file
//! RUST_LOG=debug PORT=8080 cargo run --example ping
//! ```

use http::StatusCode;
use sluice::{middleware, Config, Pipeline, Request, Response, Server, SocketCleanup};
use tracing_subscriber::EnvFilter;

async fn ping(req: Request) -> Response {
    match req.path() {
        "/ping" => Response::text("pong"),
        _ => Response::status(StatusCode::NOT_FOUND),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let tls = config.tls_settings()?;

    let mut pipeline = Pipeline::new(ping);
    if let Some(max_age) = config.hsts_max_age.filter(|_| tls.is_some()) {
        pipeline = pipeline.filter(middleware::hsts(max_age));
    }
    let pipeline = pipeline.filter(middleware::trace());

    let (server, cleanup) = start(pipeline, &config, tls.as_ref()).await?;
    tracing::info!(addr = %server.local_addr(), "try GET /ping");

    sluice::shutdown_signal().await;
    server.stop(config.shutdown_timeout()).await;

    if let Some(cleanup) = cleanup {
        cleanup.remove()?;
    }
    Ok(())
}

async fn start(
    pipeline: Pipeline,
    config: &Config,
    tls: Option<&sluice::TlsSettings>,
) -> sluice::Result<(Server, Option<SocketCleanup>)> {
    #[cfg(unix)]
    {
        let env_path = std::env::var_os(sluice::listener::LISTEN_PATH_ENV);
        if config.listen_path.is_some() || env_path.is_some() {
            let path = config.listen_path.as_deref();
            let (server, cleanup) = match tls {
                Some(tls) => sluice::listen_unix_tls(pipeline, path, tls).await?,
                None => sluice::listen_unix(pipeline, path).await?,
            };
            return Ok((server, Some(cleanup)));
        }
    }

    let addr = config.listen_addr.as_deref();
    let server = match tls {
        Some(tls) => sluice::listen_tls(pipeline, addr, tls).await?,
        None => sluice::listen(pipeline, addr).await?,
    };
    Ok((server, None))
}
