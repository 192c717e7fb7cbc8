//! The closed error taxonomy for this crate.
//!
//! `CacheError` is what flows into [`crate::response::Response::error`].
//! Missing-file and expired-unlocked-record are deliberately *not* part of
//! this enum: both are reported as [`crate::response::CacheResult::NotFound`]
//! rather than an error.

use std::sync::Arc;

use snafu::Snafu;

use crate::header::HeaderError;

#[derive(Debug, Snafu, Clone)]
pub enum CacheError {
    #[snafu(display("{source}"))]
    Header { source: HeaderError },

    #[snafu(display("payload on disk is shorter than declared: expected {expected}, found {found}"))]
    WrongPayloadSize { expected: u64, found: u64 },

    /// Reserved: returned for a record whose `StreamIncomplete` flag makes
    /// it look like a concurrent writer has it open. This crate does not
    /// implement streaming writes, so no code path produces this today.
    #[snafu(display("record is an incomplete stream and cannot be read"))]
    RecordIsStreamAndBusy,

    #[snafu(display("internal inconsistency: {detail}"))]
    InternalInconsistency { detail: String },

    /// Wrapped in `Arc` rather than held bare: `std::io::Error` isn't
    /// `Clone`, and `Response` (which carries this error to the caller)
    /// needs to be.
    #[snafu(display("I/O error: {source}"))]
    Io { source: Arc<std::io::Error> },
}

impl From<HeaderError> for CacheError {
    fn from(source: HeaderError) -> Self {
        CacheError::Header { source }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(source: std::io::Error) -> Self {
        CacheError::Io { source: Arc::new(source) }
    }
}
