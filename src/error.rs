//! # Error types
//!
//! This module contains the error types surfaced by the dispatcher to its
//! callers. It mirrors the shape of a typical `thiserror` error enum: one
//! variant per documented failure kind, each carrying enough context to log
//! or report usefully.
//!
//! `DeliveryFailed` is deliberately **not** a variant here: per the delivery
//! contract a failed HTTP POST never surfaces to the publisher. It is
//! represented internally as [`crate::transport::DeliveryOutcome::Failure`].

/// Errors surfaced synchronously by the dispatcher's public operations.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DispatchError {
    /// An event was missing a required field (no channel, or no resource and
    /// no origins).
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A subscription-set document failed to parse or was missing a required
    /// field (no owner, no channels on a subscription, a multi-recipient
    /// subscription without a proxy `destination_uri`).
    #[error("malformed subscription: {0}")]
    MalformedSubscription(String),

    /// `replace` was called with a document whose owner differs from the
    /// set currently registered at that location.
    #[error("owner mismatch for location {location}: expected {expected}, got {actual}")]
    OwnerMismatch {
        /// Location the caller tried to replace.
        location: String,
        /// Owner URI currently registered.
        expected: String,
        /// Owner URI found in the replacement document.
        actual: String,
    },

    /// `replace` was called with a document whose `has_expiration` differs
    /// from the set currently registered at that location.
    #[error("expiration type changed for location {0}")]
    ExpirationTypeChanged(String),

    /// The event's `via` already contains this dispatcher's own owner URI.
    #[error("loop detected: event {event_id} already visited this dispatcher")]
    LoopDetected {
        /// Id of the looping event.
        event_id: String,
    },

    /// The in-process dispatch pipeline rejected the event because it is
    /// shutting down.
    #[error("failed to enqueue event {event_id} onto the dispatch pipeline")]
    EnqueueFailed {
        /// Id of the event that could not be enqueued.
        event_id: String,
    },

    /// A durable queue write or read failed in a way that is not a normal
    /// record-level recovery case (disk full, permission denied, ...). The
    /// owning queue transitions to `Disposed` and further enqueues fail fast.
    #[error("durable queue I/O error at {location}: {details}")]
    QueueIoError {
        /// Location of the queue that hit the I/O error.
        location: String,
        /// Underlying error description.
        details: String,
    },

    /// A durable record's version byte did not match any version this reader
    /// supports. The containing segment is skipped with a warning; other
    /// segments continue to recover normally.
    #[error("unsupported record version {found} (expected {expected}) in segment {segment}")]
    UnsupportedRecordVersion {
        /// Segment file in which the bad record was found.
        segment: String,
        /// Version byte actually read.
        found: u8,
        /// Version byte this reader supports.
        expected: u8,
    },
}

impl DispatchError {
    /// Short, stable kind name, useful for metrics/log grouping without
    /// matching on the full error text.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEvent(_) => "malformed_event",
            Self::MalformedSubscription(_) => "malformed_subscription",
            Self::OwnerMismatch { .. } => "owner_mismatch",
            Self::ExpirationTypeChanged(_) => "expiration_type_changed",
            Self::LoopDetected { .. } => "loop_detected",
            Self::EnqueueFailed { .. } => "enqueue_failed",
            Self::QueueIoError { .. } => "queue_io_error",
            Self::UnsupportedRecordVersion { .. } => "unsupported_record_version",
        }
    }
}
