//! # Journal Error Kinds
//!
//! Fallible operations return `eyre::Result` with rich context, as
//! elsewhere in Burrow. The root cause of a journal failure is always one
//! of the [`JournalError`] kinds below, so callers that need to distinguish
//! a corrupt record from a filesystem failure or an API misuse can downcast
//! the report:
//!
//! ```ignore
//! if let Err(report) = journal.recover() {
//!     if matches!(report.downcast_ref(), Some(JournalError::IllegalState(_))) {
//!         // recover() called twice
//!     }
//! }
//! ```
//!
//! During recovery these kinds are never surfaced: any failure while
//! parsing a segment marks the journal dirty from that file onward and the
//! scan continues, so a crash-truncated journal always starts up.

use thiserror::Error;

/// Root causes of journal failures.
#[derive(Debug, Error)]
pub enum JournalError {
    /// A well-formed record structure was violated: an impossible length, a
    /// handle with no preceding identification record, or a page or size
    /// mismatch between a record and the request that read it.
    #[error("corrupt journal: {0}")]
    Corrupt(String),

    /// The underlying filesystem failed. Terminal for the journal's current
    /// lifecycle; recovery detects the damage on the next start.
    #[error("journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was invoked before recovery completed or after close.
    #[error("illegal journal state: {0}")]
    IllegalState(&'static str),
}

/// A `Corrupt` report ready to return through `eyre`.
pub(crate) fn corrupt(message: impl Into<String>) -> eyre::Report {
    eyre::Report::new(JournalError::Corrupt(message.into()))
}

/// An `IllegalState` report ready to return through `eyre`.
pub(crate) fn illegal_state(message: &'static str) -> eyre::Report {
    eyre::Report::new(JournalError::IllegalState(message))
}
