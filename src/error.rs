//! Unified error type.

use std::io;

/// The error type returned by sluice's fallible setup operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// failures to acquire an endpoint. Failures of a running server are never
/// returned: a broken accept loop shuts its server down instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The address or socket path could not be turned into an endpoint.
    #[error("cannot resolve `{input}`: {reason}")]
    Resolution { input: String, reason: String },

    /// The operating system refused to bind or listen.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Certificate or key material is missing or unusable.
    #[error("tls: {0}")]
    Tls(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn resolution(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::Resolution { input: input.into(), reason: reason.to_string() }
    }

    pub(crate) fn bind(addr: impl ToString, source: io::Error) -> Self {
        Self::Bind { addr: addr.to_string(), source }
    }
}

/// `Result` with [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
