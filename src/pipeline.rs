//! Request pipeline composition.
//!
//! A [`Pipeline`] is a terminal handler wrapped by zero or more [`Stage`]s.
//! Every call to [`Pipeline::filter`] wraps everything composed so far, so
//! the stage added *last* is the outermost layer: it sees the request first
//! and the response last.
//!
//! ```text
//! Pipeline::new(t).filter(a).filter(b)
//!
//!   request ──▶ b ──▶ a ──▶ t
//!   response ◀── b ◀── a ◀──┘
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::handler::{BoxedHandler, ErasedHandler, BoxFuture, Handler};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

// ── Next ──────────────────────────────────────────────────────────────────────

/// The downstream part of a pipeline, as seen by the stage wrapping it.
///
/// Cloning is one atomic increment.
#[derive(Clone)]
pub struct Next(BoxedHandler);

impl Next {
    /// Passes `req` to the rest of the pipeline.
    pub fn run(&self, req: Request) -> impl Future<Output = Response> + Send + use<> {
        self.0.call(req)
    }
}

// ── Stage ─────────────────────────────────────────────────────────────────────

/// A decorator over the downstream pipeline.
///
/// Implemented automatically for any closure of the shape
/// `Fn(Request, Next) -> impl Future<Output = impl IntoResponse>` that is
/// `Clone`. Implement it by hand for configurable stages:
///
/// ```rust
/// use sluice::{boxed, BoxedHandler, Next, Request, Stage};
///
/// struct PoweredBy(&'static str);
///
/// impl Stage for PoweredBy {
///     fn wrap(&self, next: Next) -> BoxedHandler {
///         let value = self.0;
///         boxed(move |req: Request| {
///             let next = next.clone();
///             async move {
///                 let mut res = next.run(req).await;
///                 res.set_header("x-powered-by", value);
///                 res
///             }
///         })
///     }
/// }
/// ```
pub trait Stage: Send + Sync + 'static {
    fn wrap(&self, next: Next) -> BoxedHandler;
}

impl<F, Fut, R> Stage for F
where
    F: Fn(Request, Next) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn wrap(&self, next: Next) -> BoxedHandler {
        Arc::new(FnStage { stage: self.clone(), next })
    }
}

struct FnStage<F> {
    stage: F,
    next: Next,
}

impl<F, Fut, R> ErasedHandler for FnStage<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.stage)(req, self.next.clone());
        Box::pin(async move { fut.await.into_response() })
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// The effective request-processing function: a terminal handler plus its
/// stages, fixed once built.
#[derive(Clone)]
pub struct Pipeline {
    inner: BoxedHandler,
}

impl Pipeline {
    pub fn new(handler: impl Handler) -> Self {
        Self { inner: handler.into_boxed_handler() }
    }

    /// Wraps the pipeline assembled so far in `stage`, which becomes the new
    /// outermost layer.
    pub fn filter(self, stage: impl Stage) -> Self {
        Self { inner: stage.wrap(Next(self.inner)) }
    }

    /// Runs `req` through every layer.
    pub fn call(&self, req: Request) -> impl Future<Output = Response> + Send + use<> {
        self.inner.call(req)
    }
}

/// Builds a pipeline from `handler` and `stages`, first stage innermost.
///
/// Equivalent to calling [`Pipeline::filter`] once per stage in order.
pub fn compose<S: Stage>(handler: impl Handler, stages: impl IntoIterator<Item = S>) -> Pipeline {
    stages.into_iter().fold(Pipeline::new(handler), Pipeline::filter)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use http::StatusCode;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn request(path: &str) -> Request {
        Request::from_http(http::Request::builder().uri(path).body(Bytes::new()).unwrap())
    }

    fn recording(log: Log, name: &'static str) -> impl Stage + Clone {
        move |req: Request, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{name} pre"));
                let res = next.run(req).await;
                log.lock().unwrap().push(format!("{name} post"));
                res
            }
        }
    }

    fn terminal(log: Log) -> impl Handler {
        move |_req: Request| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push("t".to_owned());
                "done"
            }
        }
    }

    #[tokio::test]
    async fn last_registered_stage_is_outermost() {
        let log = Log::default();
        let pipeline = Pipeline::new(terminal(log.clone()))
            .filter(recording(log.clone(), "a"))
            .filter(recording(log.clone(), "b"));

        let res = pipeline.call(request("/")).await;

        assert_eq!(res.body(), b"done");
        assert_eq!(*log.lock().unwrap(), ["b pre", "a pre", "t", "a post", "b post"]);
    }

    #[tokio::test]
    async fn compose_matches_filter_order() {
        let log = Log::default();
        let stages = vec![recording(log.clone(), "a"), recording(log.clone(), "b"), recording(log.clone(), "c")];
        let pipeline = compose(terminal(log.clone()), stages);

        pipeline.call(request("/")).await;

        assert_eq!(
            *log.lock().unwrap(),
            ["c pre", "b pre", "a pre", "t", "a post", "b post", "c post"],
        );
    }

    #[tokio::test]
    async fn no_stages_calls_terminal_directly() {
        let pipeline = compose(|_req: Request| async { StatusCode::NO_CONTENT }, Vec::<fn(Request, Next) -> BoxFuture>::new());
        let res = pipeline.call(request("/")).await;
        assert_eq!(res.status_code(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn stage_can_short_circuit_and_rewrite_request() {
        let pipeline = Pipeline::new(|req: Request| async move {
            req.header("x-seen").unwrap_or("missing").to_owned()
        })
        .filter(|mut req: Request, next: Next| async move {
            if req.path() == "/blocked" {
                return Response::status(StatusCode::FORBIDDEN);
            }
            req.headers_mut().insert("x-seen", http::HeaderValue::from_static("yes"));
            next.run(req).await
        });

        assert_eq!(pipeline.call(request("/blocked")).await.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(pipeline.call(request("/open")).await.body(), b"yes");
    }
}
