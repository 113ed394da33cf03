use thiserror::Error;

/// Murmur's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Murmur's crate-wide error type.
///
/// Every failure mode the service can surface maps onto one of these kinds;
/// the HTTP layer translates kinds into status codes and the CLI into exit
/// codes. Decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input the caller can fix: missing file, invalid language,
    /// a path escaping the store root, an unreadable media container.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Unknown model id or a remote that reported 404 during a download.
    #[error("not found: {0}")]
    NotFound(String),

    /// The context pool is at capacity; the caller should retry later.
    #[error("no inference context available, try again later")]
    PoolExhausted,

    /// The native library refused to load a model artifact.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Cancellation tripped while an inference run or download was in flight.
    #[error("cancelled")]
    RunAborted,

    /// The native inference call returned a non-zero status.
    #[error("inference failed: {0}")]
    RunFailed(String),

    /// The remote model server returned an unexpected status or the
    /// connection broke mid-transfer.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Local filesystem or network I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A primary failure plus errors from cleanup steps that also failed.
    /// Cleanup always runs; nothing it reports is allowed to mask the
    /// original error.
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    pub(crate) fn bad_parameter(message: impl Into<String>) -> Self {
        Self::BadParameter(message.into())
    }

    /// Combine this error with a secondary failure from a cleanup step.
    ///
    /// The first error stays first: it decides the kind the caller sees.
    pub(crate) fn join(self, other: Error) -> Error {
        match self {
            Error::Aggregate(mut errs) => {
                errs.push(other);
                Error::Aggregate(errs)
            }
            primary => Error::Aggregate(vec![primary, other]),
        }
    }

    /// The kind that drives status mapping, ignoring aggregated cleanup
    /// failures.
    pub fn primary(&self) -> &Error {
        match self {
            Error::Aggregate(errs) => errs.first().map(Error::primary).unwrap_or(self),
            other => other,
        }
    }
}

fn format_aggregate(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
