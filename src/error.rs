use thiserror::Error;

/// Errors that can escape the public API.
///
/// Per-command failures (reservation contention, unknown vehicle, rejected
/// ACKs, ...) never surface here — executors in [`crate::commands`] convert
/// those into a [`crate::commands::CommandOutcome`] instead. Only link
/// construction returns a `Result`; worker threads log and terminate.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The MAVLink codec refused the transport URL/baud.
    #[error("failed to open MAVLink transport {url}: {source}")]
    OpenFailure {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    /// The five-second discovery window elapsed without a single heartbeat.
    #[error("no heartbeats received within the discovery window")]
    NoHeartbeats,

    /// An operation was attempted while the link was not in the `Running` state.
    #[error("link is not ready (state: {0})")]
    NotReady(&'static str),
}

pub type Result<T> = std::result::Result<T, LinkError>;
