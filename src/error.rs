use thiserror::Error;

/// Failure of a single RPC to a single peer. These are accumulated per
/// lookup rather than failing it outright.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("rpc timed out")]
    Timeout,

    #[error("transport: {0}")]
    Transport(String),

    /// The response echoed a request id we never sent with this request.
    #[error("response request id does not match the request")]
    MismatchedRequestId,
}

/// Errors surfaced by the engine to its callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed, unsigned, or signature-mismatched request; rejected before
    /// any state is touched.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    /// The per-lookup error budget was exceeded.
    #[error("lookup errored after {errors} failed queries")]
    LookupErrored { errors: usize },

    /// The lookup ran out of unqueried peers before it could finish.
    #[error("lookup exhausted all candidates")]
    LookupExhausted,

    /// No value is stored under the requested key.
    #[error("key not found")]
    NotFound,

    /// Non-recoverable: signer failure, corrupted state. Aborts the lookup.
    #[error("fatal: {0}")]
    Fatal(String),
}
