//! Error types for the election client.

use snafu::Snafu;

use crate::store::StoreError;

/// Result type for client operations.
pub type Result<T, E = ElectionError> = std::result::Result<T, E>;

/// Errors surfaced by [`Client`](crate::Client) operations.
///
/// Background tasks never surface errors through this type; transient store
/// failures inside the voter and watcher loops are logged and retried.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ElectionError {
    /// A required collaborator was missing at construction.
    #[snafu(display("invalid configuration: {}", reason))]
    InvalidConfig {
        /// What was missing or malformed.
        reason: String,
    },

    /// Lease terms below one second are rejected.
    #[snafu(display("election term of {} ms is below the one second minimum", term_ms))]
    TermTooShort {
        /// The rejected term in milliseconds.
        term_ms: u64,
    },

    /// A voter is already registered with different parameters.
    #[snafu(display("a voter for key '{}' is already registered with different parameters", existing_key))]
    VoterMismatch {
        /// Key the running voter was registered with.
        existing_key: String,
    },

    /// The voter loop has not been started.
    #[snafu(display("voter loop is not running"))]
    VoterNotRunning,

    /// The client has been closed.
    #[snafu(display("client is closed"))]
    Closed,

    /// A store operation failed during an election round.
    #[snafu(display("store operation failed: {}", source))]
    Store {
        /// The underlying store error.
        source: StoreError,
    },
}
