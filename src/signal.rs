//! Process signal trapping for applications that embed a [`Server`](crate::Server).
//!
//! ```rust,no_run
//! # async fn run(server: sluice::Server) {
//! sluice::shutdown_signal().await;
//! server.stop(std::time::Duration::from_secs(10)).await;
//! # }
//! ```

use tracing::{error, info};

/// Resolves on Ctrl-C (SIGINT) or, on Unix, SIGTERM.
///
/// A handler that cannot be installed is logged and its arm never fires;
/// the other one still works.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received SIGINT"),
            Err(e) => {
                error!("failed to install Ctrl-C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received SIGTERM");
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` never resolves: without Unix signals the SIGTERM arm is off.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
