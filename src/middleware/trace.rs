use std::time::Instant;

use tracing::{info, info_span, Instrument};

use crate::pipeline::{Next, Stage};
use crate::request::Request;

/// Wraps each request in a `request` span carrying its method and path, and
/// logs the response status and latency when the downstream pipeline returns.
pub fn trace() -> impl Stage + Clone {
    |req: Request, next: Next| async move {
        let span = info_span!("request", method = %req.method(), path = %req.path());
        let started = Instant::now();

        let res = next.run(req).instrument(span.clone()).await;

        span.in_scope(|| {
            info!(status = res.status_code().as_u16(), latency = ?started.elapsed(), "request completed");
        });
        res
    }
}
