//! Error taxonomy for the core (spec §7).
//!
//! Transport errors are recovered locally with retry; these variants are the
//! semantic errors that cross subsystem boundaries. The gRPC layer
//! (`grpc.rs`) is the only place that converts a `CoreError` into a
//! `tonic::Status` — the core itself never depends on tonic.

use thiserror::Error;

use crate::types::RvLocation;

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("unknown location: {0}")]
    UnknownLocation(String),

    /// Requested RV precedes the log's compaction horizon; caller must re-list.
    #[error("requested resource version for {location:?} is too old, re-list required")]
    TooOld { location: RvLocation },

    /// Watch channel saturated past `WatchIdleTimeout`.
    #[error("client {0} exceeded the watch idle timeout and was disconnected")]
    ClientSlow(String),

    /// Aggregator pull failed; retried with backoff and only surfaced once it
    /// persists long enough to expire allocation freshness.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Persistent store operation failed; logged and retried, non-fatal
    /// except during cold start.
    #[error("persistent store error: {0}")]
    Storage(String),

    /// Invariant violation. Fatal.
    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("log is closed")]
    Closed,

    #[error("operation canceled")]
    Canceled,
}
