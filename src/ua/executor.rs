//! Bounded handler-callback dispatch (spec §5, ambient stack §10.1).
//!
//! Handler callbacks must not run while a dialog's per-dialog lock is
//! held and must not be able to poison the registry if they panic. This
//! executor spawns each dispatch on its own task under a `JoinSet`
//! capped at a fixed number of in-flight callbacks (back-pressure on
//! `spawn` beyond that blocks the caller briefly rather than growing
//! unbounded), and isolates a panicking callback with `catch_unwind` so
//! it surfaces on the error stream instead of taking down the UA.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tracing::error;

use crate::dialog::DialogId;
use crate::errors::DialogError;
use crate::events::EventSink;

/// Caps the number of handler callbacks running concurrently across the
/// whole [`crate::ua::UserAgent`], independent of how many dialogs exist.
const MAX_CONCURRENT_CALLBACKS: usize = 64;

pub struct CallbackExecutor {
    events: Arc<dyn EventSink>,
    permits: Arc<Semaphore>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl CallbackExecutor {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            events,
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_CALLBACKS)),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Runs `callback` on its own task, catching any panic and reporting
    /// it on the error stream rather than propagating it. Never runs
    /// inline: by the time this returns the caller may already have
    /// released whatever lock guarded the state the callback inspects.
    pub async fn dispatch(
        &self,
        dialog_id: Option<DialogId>,
        operation: &'static str,
        callback: impl FnOnce() + Send + 'static,
    ) {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                // All slots busy: wait for one rather than spawning an
                // unbounded number of pending callback tasks.
                self.permits
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed")
            }
            Err(TryAcquireError::Closed) => return,
        };

        let events = self.events.clone();
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            let result = AssertUnwindSafe(async { callback() }).catch_unwind().await;
            drop(permit);
            if let Err(panic) = result {
                let message = panic_message(&panic);
                error!(operation, message, "handler callback panicked");
                events.on_error(
                    dialog_id.as_ref(),
                    operation,
                    &DialogError::internal(operation, format!("handler panicked: {message}")),
                );
            }
        });
        // Reap finished tasks so the JoinSet doesn't grow without bound
        // across a long-lived UA; this never blocks since it only drains
        // already-completed entries.
        while tasks.try_join_next().is_some() {}
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEventSink;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn dispatch_runs_callback_off_the_caller_task() {
        let executor = CallbackExecutor::new(Arc::new(TracingEventSink));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        executor
            .dispatch(None, "test", move || flag.store(true, Ordering::SeqCst))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_callback_is_isolated() {
        let executor = CallbackExecutor::new(Arc::new(TracingEventSink));
        executor
            .dispatch(None, "test-panic", || panic!("boom"))
            .await;
        // The executor itself must still be usable afterward.
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        executor
            .dispatch(None, "test", move || flag.store(true, Ordering::SeqCst))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
