//! Terminal handlers and the erased form every pipeline layer shares.
//!
//! A pipeline mixes layer types freely: the handler at the bottom is some
//! user closure, each stage above it is another. They all end up behind one
//! vtable, `dyn ErasedHandler`, so a layer only ever holds an `Arc` to the
//! layer below it.
//!
//! ```text
//! Pipeline::new(ping)           ping: async fn(Request) -> impl IntoResponse
//!   └─ Handler::into_boxed_handler
//!        └─ Arc<Terminal<ping>>          stored as BoxedHandler
//!             └─ .call(req)              BoxFuture, once per request
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// What every erased layer returns from `call`.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// Object-safe call interface behind [`BoxedHandler`].
///
/// Public only because [`BoxedHandler`] names it.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture;
}

/// One erased pipeline layer, shared by every request in flight.
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// A terminal handler: any `Fn(Request) -> impl Future<Output = impl IntoResponse>`
/// that can be shared across tasks.
///
/// Sealed. Plain `async fn`s and closures qualify through the blanket impl.
pub trait Handler: sealed::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod sealed {
    pub trait Sealed {}
}

impl<F, Fut, R> sealed::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(Terminal(self))
    }
}

struct Terminal<F>(F);

impl<F, Fut, R> ErasedHandler for Terminal<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let pending = (self.0)(req);
        Box::pin(async move { pending.await.into_response() })
    }
}

/// Erases a handler into a [`BoxedHandler`].
///
/// This is what a [`Stage`](crate::Stage) implementation returns from
/// [`wrap`](crate::Stage::wrap): usually a closure that calls `next`.
pub fn boxed(handler: impl Handler) -> BoxedHandler {
    handler.into_boxed_handler()
}
