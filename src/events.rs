//! Observability surface (spec §6, ambient stack §10.1).
//!
//! Three streams — state change, request processed, error — are exposed
//! through a single [`EventSink`] capability injected at [`crate::ua::UserAgent`]
//! construction. [`TracingEventSink`] folds them into `tracing` events for
//! applications that only want logs; [`ChannelEventSink`] forwards them
//! over a bounded `tokio::sync::mpsc` channel for applications that want
//! to consume them programmatically. Both are at-most-once: a full
//! channel drops the event and bumps [`ChannelEventSink::dropped_count`]
//! rather than blocking the dialog that produced it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::dialog::{DialogId, DialogState};
use crate::errors::DialogError;

/// Outcome of processing one in-dialog or dialog-establishing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { status: u16 },
    Failure { status: u16, reason: String },
    Cancelled,
}

/// One observability event on the three streams named in spec §6.
#[derive(Debug, Clone)]
pub enum Event {
    StateChange {
        dialog_id: DialogId,
        old_state: DialogState,
        new_state: DialogState,
    },
    RequestProcessed {
        dialog_id: DialogId,
        method: String,
        outcome: RequestOutcome,
        duration: Duration,
    },
    Error {
        dialog_id: Option<DialogId>,
        operation: String,
        error: DialogError,
    },
}

/// An injected sink for dialog observability events.
///
/// Implementations must not block the caller for long: handler/sink
/// dispatch runs after a dialog's state transition is already committed
/// (spec §5), never while holding the per-dialog lock, but a slow sink
/// still delays the next event on the same dispatch task.
pub trait EventSink: Send + Sync {
    fn on_state_change(&self, dialog_id: &DialogId, old_state: DialogState, new_state: DialogState);
    fn on_request_processed(
        &self,
        dialog_id: &DialogId,
        method: &str,
        outcome: &RequestOutcome,
        duration: Duration,
    );
    fn on_error(&self, dialog_id: Option<&DialogId>, operation: &str, error: &DialogError);

    /// Count of events dropped due to sink back-pressure. Sinks that
    /// cannot drop (e.g. [`TracingEventSink`]) always return 0.
    fn dropped_count(&self) -> u64 {
        0
    }
}

/// The default sink: every event becomes a `tracing` event at a level
/// matching its severity. Never drops anything, never blocks (tracing
/// subscribers own their own back-pressure policy).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_state_change(&self, dialog_id: &DialogId, old_state: DialogState, new_state: DialogState) {
        info!(%dialog_id, ?old_state, ?new_state, "dialog state change");
    }

    fn on_request_processed(
        &self,
        dialog_id: &DialogId,
        method: &str,
        outcome: &RequestOutcome,
        duration: Duration,
    ) {
        match outcome {
            RequestOutcome::Success { status } => {
                info!(%dialog_id, method, status, ?duration, "request processed");
            }
            RequestOutcome::Failure { status, reason } => {
                warn!(%dialog_id, method, status, reason, ?duration, "request failed");
            }
            RequestOutcome::Cancelled => {
                warn!(%dialog_id, method, ?duration, "request cancelled");
            }
        }
    }

    fn on_error(&self, dialog_id: Option<&DialogId>, operation: &str, error: &DialogError) {
        error!(dialog_id = ?dialog_id.map(ToString::to_string), operation, %error, "dialog error");
    }
}

/// A sink that forwards every event onto a bounded `mpsc` channel.
///
/// Use [`ChannelEventSink::new`] to get the sink plus the paired
/// `tokio::sync::mpsc::Receiver<Event>` to drain it from application
/// code. Back-pressure drops the oldest-style blocking send in favor of
/// `try_send`: a full channel increments [`ChannelEventSink::dropped_count`]
/// instead of stalling the dialog task that raised the event.
pub struct ChannelEventSink {
    tx: tokio::sync::mpsc::Sender<Event>,
    dropped: AtomicU64,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Arc<Self>, tokio::sync::mpsc::Receiver<Event>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx,
                dropped: AtomicU64::new(0),
            }),
            rx,
        )
    }

    fn send(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl EventSink for ChannelEventSink {
    fn on_state_change(&self, dialog_id: &DialogId, old_state: DialogState, new_state: DialogState) {
        self.send(Event::StateChange {
            dialog_id: dialog_id.clone(),
            old_state,
            new_state,
        });
    }

    fn on_request_processed(
        &self,
        dialog_id: &DialogId,
        method: &str,
        outcome: &RequestOutcome,
        duration: Duration,
    ) {
        self.send(Event::RequestProcessed {
            dialog_id: dialog_id.clone(),
            method: method.to_string(),
            outcome: outcome.clone(),
            duration,
        });
    }

    fn on_error(&self, dialog_id: Option<&DialogId>, operation: &str, error: &DialogError) {
        self.send(Event::Error {
            dialog_id: dialog_id.cloned(),
            operation: operation.to_string(),
            error: error.clone(),
        });
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_state_change() {
        let (sink, mut rx) = ChannelEventSink::new(4);
        let id = DialogId::new("c1", "a1", "b1");
        sink.on_state_change(&id, DialogState::Trying, DialogState::Early);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::StateChange { .. }));
    }

    #[test]
    fn channel_sink_counts_drops_on_full_queue() {
        let (sink, _rx) = ChannelEventSink::new(1);
        let id = DialogId::new("c1", "a1", "b1");
        for _ in 0..5 {
            sink.on_state_change(&id, DialogState::Trying, DialogState::Early);
        }
        assert!(sink.dropped_count() > 0);
    }
}
