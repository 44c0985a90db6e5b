//! Cooperative cancellation and observational events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::SvnError;
use crate::merge::MergeStatus;
use crate::sequence::DiffBlock;

/// A cancellation check polled by long-running operations.
///
/// Returning an error aborts the operation; implementations should return
/// [`SvnError::Cancelled`].
pub trait Canceller: Send + Sync {
    /// Returns `Err` once the operation should stop.
    fn check(&self) -> Result<(), SvnError>;
}

/// A [`Canceller`] that never cancels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCancel;

impl Canceller for NeverCancel {
    fn check(&self) -> Result<(), SvnError> {
        Ok(())
    }
}

/// A shareable cancellation flag.
///
/// Clones share the same flag, so one clone can be handed to the operation
/// while another is kept to call [`CancelFlag::cancel`].
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Creates a flag in the "not cancelled" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`CancelFlag::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Canceller for CancelFlag {
    fn check(&self) -> Result<(), SvnError> {
        if self.is_cancelled() {
            Err(SvnError::Cancelled("operation cancelled".to_string()))
        } else {
            Ok(())
        }
    }
}

/// A unit of completed work reported to an [`EventSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A diff block was produced.
    DiffBlock(DiffBlock),
    /// An `ra_svn` command round-trip completed.
    CommandCompleted {
        /// Command name.
        command: String,
    },
    /// An HTTP request completed.
    RequestCompleted {
        /// HTTP method.
        method: String,
        /// Final status code.
        status: u16,
    },
    /// A three-way merge completed.
    MergeCompleted {
        /// Merge outcome.
        status: MergeStatus,
    },
}

/// Receives [`Event`]s. Never affects the operation that emits them.
pub trait EventSink: Send + Sync {
    /// Called after each completed unit of work.
    fn on_event(&self, event: &Event);
}

/// An [`EventSink`] that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoEvents;

impl EventSink for NoEvents {
    fn on_event(&self, _event: &Event) {}
}
