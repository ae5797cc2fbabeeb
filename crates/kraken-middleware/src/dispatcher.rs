//! The event dispatcher task.
//!
//! A single task owns the receiving end of the event queue. For every event
//! it copies the matching listeners out of the table, drops the table lock,
//! and only then calls the handlers. Handlers are therefore free to
//! subscribe, unsubscribe or post without deadlocking the bus; the cost is
//! that a listener added after the snapshot misses the event, and one
//! removed after the snapshot still sees it once.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use kraken_types::{Event, EventType, UserData};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, trace, warn};

use crate::bus::EventHandler;

/// One `(event_type, handler)` subscription.
#[derive(Clone)]
pub(crate) struct Listener {
    pub(crate) event_type: EventType,
    pub(crate) handler: EventHandler,
    pub(crate) user_data: Option<UserData>,
}

impl Listener {
    /// Composite identity: same event type and the very same handler `Arc`.
    pub(crate) fn is(&self, event_type: EventType, handler: &EventHandler) -> bool {
        self.event_type == event_type
            && std::ptr::addr_eq(Arc::as_ptr(&self.handler), Arc::as_ptr(handler))
    }

    fn invoke(&self, event: &Event) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (self.handler)(event, self.user_data.as_ref())
        }));
        if outcome.is_err() {
            error!(
                event_type = %event.event_type,
                listener_type = %self.event_type,
                "event handler panicked; continuing with remaining listeners"
            );
        }
    }
}

pub(crate) type ListenerTable = Arc<Mutex<Vec<Listener>>>;

/// Drain `queue` until it is closed, fanning each event out to the
/// listeners that match it.
pub(crate) async fn run(
    mut queue: mpsc::Receiver<Event>,
    listeners: ListenerTable,
    snapshot_timeout: Duration,
    scratch_capacity: usize,
) {
    debug!("event dispatcher running");
    while let Some(event) = queue.recv().await {
        let Some(snapshot) =
            take_snapshot(&listeners, &event, snapshot_timeout, scratch_capacity).await
        else {
            continue;
        };

        trace!(
            event_type = %event.event_type,
            listeners = snapshot.len(),
            "dispatching event"
        );
        for listener in &snapshot {
            listener.invoke(&event);
        }
    }
    debug!("event queue closed, dispatcher exiting");
}

async fn take_snapshot(
    listeners: &ListenerTable,
    event: &Event,
    lock_timeout: Duration,
    scratch_capacity: usize,
) -> Option<Vec<Listener>> {
    let Ok(table) = tokio::time::timeout(lock_timeout, listeners.lock()).await else {
        warn!(
            event_type = %event.event_type,
            id = %event.id,
            "listener table lock timed out, event dropped"
        );
        return None;
    };

    let mut scratch = Vec::with_capacity(scratch_capacity);
    scratch.extend(
        table
            .iter()
            .filter(|l| l.event_type.matches(event.event_type))
            .cloned(),
    );
    Some(scratch)
}
