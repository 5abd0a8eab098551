//! The error taxonomy shared by every module in this crate.

use thiserror::Error;

/// Errors produced anywhere in the description-resolution, loading or
/// supervision pipeline.
///
/// Every fallible operation in this crate returns `Result<_, Error>`. The
/// variants mirror the failure taxonomy of the supervision model: some are
/// terminal for a single component's construction (`InvalidSpec`), some
/// drive a parent container's restart policy (`MissingChild`,
/// `ShutdownChild`), and some are only ever produced by the supervisor
/// itself (`Hang`, `Fatal`).
#[derive(Error, Debug)]
pub enum Error {
    /// A spec failed validation before any component was instantiated.
    #[error("invalid spec for `{name}`: {reason}")]
    InvalidSpec { name: String, reason: String },

    /// A named child is absent from its parent's context.
    #[error("component `{0}` is missing")]
    MissingChild(String),

    /// A named child is present but already shut down.
    #[error("component `{0}` has already shut down")]
    ShutdownChild(String),

    /// The loader exhausted every resolver trying to locate an artefact.
    #[error("artefact `{name}` not found (tried resolvers: {tried:?})")]
    ArtefactNotFound { name: String, tried: Vec<String> },

    /// The factory returned an application-level error.
    #[error("factory for `{module}` failed: {message}")]
    FactoryError { module: String, message: String },

    /// The factory panicked instead of returning an error.
    #[error("factory for `{module}` panicked: {message}")]
    FactoryException {
        module: String,
        message: String,
        was_thrown: bool,
    },

    /// `retry_with_delay` exhausted its attempt budget.
    #[error("retry exhausted after {attempts} attempt(s)")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A timeout wrapper's deadline elapsed before the wrapped operation did.
    #[error("operation timed out")]
    Timeout,

    /// The supervisor observed a health-check tick still in flight when the
    /// next one was due.
    #[error("health-check tick still in progress (hang #{consecutive})")]
    Hang { consecutive: u32 },

    /// The supervisor decided the tree is unrecoverable and is terminating.
    #[error("fatal supervisor error: {0}")]
    Fatal(String),
}

impl Error {
    pub fn invalid_spec(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidSpec {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Mirrors the source's `timeout = true` marker on timeout errors.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Mirrors the source's `checkingForHang = true` marker.
    pub fn is_hang(&self) -> bool {
        matches!(self, Error::Hang { .. })
    }

    /// Mirrors the source's `wasThrown` marker distinguishing a thrown
    /// exception from an ordinary application error.
    pub fn was_thrown(&self) -> bool {
        matches!(self, Error::FactoryException { was_thrown: true, .. })
    }

    /// True for errors a static container should treat as "child missing or
    /// unhealthy", i.e. worth restarting over.
    pub fn is_child_health_failure(&self) -> bool {
        matches!(self, Error::MissingChild(_) | Error::ShutdownChild(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
