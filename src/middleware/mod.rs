//! Ready-made stages.
//!
//! Both are ordinary [`Stage`](crate::Stage)s and compose like any other:
//!
//! ```rust
//! use sluice::{middleware, Pipeline, Request};
//!
//! let pipeline = Pipeline::new(|_req: Request| async { "ok" })
//!     .filter(middleware::hsts(middleware::HSTS_DEFAULT_MAX_AGE))
//!     .filter(middleware::trace());
//! ```

mod hsts;
mod trace;

pub use hsts::{hsts, Hsts, HSTS_DEFAULT_MAX_AGE};
pub use trace::trace;
