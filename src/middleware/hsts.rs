use crate::handler::{boxed, BoxedHandler};
use crate::pipeline::{Next, Stage};
use crate::request::Request;

/// Two years, the value browser preload lists ask for.
pub const HSTS_DEFAULT_MAX_AGE: u64 = 63_072_000;

const HEADER: &str = "strict-transport-security";

/// Sets `Strict-Transport-Security` on every response, replacing any value
/// set further down the pipeline.
#[derive(Clone, Debug)]
pub struct Hsts {
    max_age: u64,
}

/// Builds an [`Hsts`] stage with `max-age=<max_age>; includeSubDomains`.
pub fn hsts(max_age: u64) -> Hsts {
    Hsts { max_age }
}

impl Hsts {
    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    fn value(&self) -> String {
        format!("max-age={}; includeSubDomains", self.max_age)
    }
}

impl Stage for Hsts {
    fn wrap(&self, next: Next) -> BoxedHandler {
        let value = self.value();
        boxed(move |req: Request| {
            let next = next.clone();
            let value = value.clone();
            async move {
                let mut res = next.run(req).await;
                res.set_header(HEADER, value);
                res
            }
        })
    }
}
