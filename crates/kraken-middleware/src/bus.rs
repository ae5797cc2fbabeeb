//! Asynchronous publish/subscribe event bus with a bounded queue.
//!
//! Producers [`post`](EventBus::post) into a Tokio `mpsc` channel; a single
//! dispatcher task (see [`crate::dispatcher`]) drains it in FIFO order and
//! calls every listener whose event type matches, or which subscribed to
//! [`EventType::Any`].
//!
//! | Operation | Waits on | Failure on expiry |
//! |---|---|---|
//! | `subscribe` / `unsubscribe` | listener table lock | `Timeout` |
//! | `post` | free queue slot | `Timeout`, event dropped |
//! | `post_from_isr` | nothing | `Timeout` if the queue is full |
//! | dispatcher snapshot | listener table lock | event dropped and logged |

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use kraken_types::{Event, EventPayload, EventType, KernelError, UserData};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::{self, Listener, ListenerTable};

/// Callback invoked by the dispatcher for every matching event.
///
/// Identity matters: [`EventBus::unsubscribe`] removes the listener whose
/// handler is the *same* `Arc`, so keep a clone of what you subscribed with.
pub type EventHandler = Arc<dyn Fn(&Event, Option<&UserData>) + Send + Sync>;

/// Wrap a closure as an [`EventHandler`].
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(&Event, Option<&UserData>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Capacities and bounded waits of the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of simultaneous subscriptions.
    pub max_listeners: usize,
    /// Depth of the event queue.
    pub queue_capacity: usize,
    pub listener_lock_timeout_ms: u64,
    pub dispatch_lock_timeout_ms: u64,
    pub post_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_listeners: 32,
            queue_capacity: 32,
            listener_lock_timeout_ms: 1000,
            dispatch_lock_timeout_ms: 100,
            post_timeout_ms: 100,
        }
    }
}

impl BusConfig {
    pub fn listener_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_lock_timeout_ms)
    }

    pub fn dispatch_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_lock_timeout_ms)
    }

    pub fn post_timeout(&self) -> Duration {
        Duration::from_millis(self.post_timeout_ms)
    }

    fn validate(&self) -> Result<(), KernelError> {
        if self.max_listeners == 0 {
            return Err(KernelError::InvalidArgument(
                "bus.max_listeners must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(KernelError::InvalidArgument(
                "bus.queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

enum DispatcherSlot {
    /// Queue built, dispatcher not spawned yet; holds the receiving end.
    Idle(mpsc::Receiver<Event>),
    Running(JoinHandle<()>),
    Stopped,
}

/// The kernel event bus.
///
/// Construct with [`EventBus::new`], then call
/// [`spawn_dispatcher`](EventBus::spawn_dispatcher) to start delivery.
/// Events posted before the dispatcher runs wait in the queue.
pub struct EventBus {
    config: BusConfig,
    epoch: Instant,
    listeners: ListenerTable,
    sender: mpsc::Sender<Event>,
    dispatcher: StdMutex<DispatcherSlot>,
}

impl EventBus {
    /// Build the listener table and event queue.
    ///
    /// `epoch` is the kernel clock origin used for event timestamps.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] when a capacity is zero.
    pub fn new(config: BusConfig, epoch: Instant) -> Result<Self, KernelError> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        Ok(Self {
            listeners: Arc::new(Mutex::new(Vec::with_capacity(config.max_listeners))),
            config,
            epoch,
            sender,
            dispatcher: StdMutex::new(DispatcherSlot::Idle(receiver)),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Spawn the dispatcher task on the current Tokio runtime.
    ///
    /// Calling it again while the dispatcher runs is a no-op.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidState`] outside a Tokio runtime, or after
    ///   [`shutdown`](EventBus::shutdown).
    pub fn spawn_dispatcher(&self) -> Result<(), KernelError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            KernelError::InvalidState("event dispatcher needs a Tokio runtime".into())
        })?;

        let mut slot = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *slot, DispatcherSlot::Stopped) {
            DispatcherSlot::Idle(queue) => {
                let task = runtime.spawn(dispatcher::run(
                    queue,
                    Arc::clone(&self.listeners),
                    self.config.dispatch_lock_timeout(),
                    self.config.max_listeners,
                ));
                *slot = DispatcherSlot::Running(task);
                info!("event dispatcher started");
                Ok(())
            }
            running @ DispatcherSlot::Running(_) => {
                *slot = running;
                Ok(())
            }
            DispatcherSlot::Stopped => Err(KernelError::InvalidState(
                "event bus has been shut down".into(),
            )),
        }
    }

    /// Stop the dispatcher and close the queue. Idempotent.
    ///
    /// A handler already executing runs to completion; events still queued
    /// are discarded.
    pub async fn shutdown(&self) {
        let previous = {
            let mut slot = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, DispatcherSlot::Stopped)
        };
        if let DispatcherSlot::Running(task) = previous {
            task.abort();
            // Cancellation is the expected outcome here.
            let _ = task.await;
            info!("event dispatcher stopped");
        }
    }

    pub fn is_dispatching(&self) -> bool {
        let slot = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(&*slot, DispatcherSlot::Running(task) if !task.is_finished())
    }

    /// Add a listener for `event_type` (or every event, for
    /// [`EventType::Any`]). The same handler may be subscribed under several
    /// event types.
    ///
    /// # Errors
    ///
    /// - [`KernelError::ResourceExhausted`] – the listener table is full.
    /// - [`KernelError::Timeout`] – the table lock was not acquired in time.
    pub async fn subscribe(
        &self,
        event_type: EventType,
        handler: EventHandler,
        user_data: Option<UserData>,
    ) -> Result<(), KernelError> {
        let mut table = self.lock_listeners().await?;
        if table.len() >= self.config.max_listeners {
            warn!(%event_type, capacity = self.config.max_listeners, "max event listeners reached");
            return Err(KernelError::ResourceExhausted(format!(
                "listener table full ({} entries)",
                self.config.max_listeners
            )));
        }
        table.push(Listener {
            event_type,
            handler,
            user_data,
        });
        debug!(%event_type, listeners = table.len(), "event subscribed");
        Ok(())
    }

    /// Remove the listener registered with exactly this `(event_type,
    /// handler)` pair. Remaining listeners keep their relative order.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NotFound`] – no listener matches the pair.
    /// - [`KernelError::Timeout`] – the table lock was not acquired in time.
    pub async fn unsubscribe(
        &self,
        event_type: EventType,
        handler: &EventHandler,
    ) -> Result<(), KernelError> {
        let mut table = self.lock_listeners().await?;
        let Some(index) = table.iter().position(|l| l.is(event_type, handler)) else {
            return Err(KernelError::NotFound(format!(
                "no listener for {event_type} with that handler"
            )));
        };
        table.remove(index);
        debug!(%event_type, listeners = table.len(), "event unsubscribed");
        Ok(())
    }

    /// Number of active subscriptions.
    pub async fn listener_count(&self) -> Result<usize, KernelError> {
        Ok(self.lock_listeners().await?.len())
    }

    /// Enqueue an event, waiting up to `post_timeout` for a free slot.
    ///
    /// Success means "accepted into the queue", nothing more. Returns the id
    /// of the queued event.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidArgument`] – `event_type` is the wildcard.
    /// - [`KernelError::Timeout`] – the queue stayed full; the event is
    ///   dropped.
    /// - [`KernelError::InvalidState`] – the bus has been shut down.
    pub async fn post(
        &self,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<Uuid, KernelError> {
        let event = self.make_event(event_type, payload)?;
        let id = event.id;
        match self.sender.send_timeout(event, self.config.post_timeout()).await {
            Ok(()) => Ok(id),
            Err(SendTimeoutError::Timeout(dropped)) => {
                warn!(event_type = %dropped.event_type, "event queue full, event dropped");
                Err(KernelError::Timeout("event queue slot".into()))
            }
            Err(SendTimeoutError::Closed(_)) => Err(closed()),
        }
    }

    /// Non-blocking enqueue, safe to call from contexts that must never
    /// wait (signal handlers, sync callbacks, other event handlers).
    ///
    /// The channel wakes the dispatcher directly; there is no separate
    /// yield step.
    ///
    /// # Errors
    ///
    /// Same as [`post`](EventBus::post), except a full queue fails
    /// immediately.
    pub fn post_from_isr(
        &self,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<Uuid, KernelError> {
        let event = self.make_event(event_type, payload)?;
        let id = event.id;
        match self.sender.try_send(event) {
            Ok(()) => Ok(id),
            Err(TrySendError::Full(_)) => Err(KernelError::Timeout("event queue slot".into())),
            Err(TrySendError::Closed(_)) => Err(closed()),
        }
    }

    /// Milliseconds elapsed since the bus epoch.
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn make_event(
        &self,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<Event, KernelError> {
        if event_type.is_wildcard() {
            return Err(KernelError::InvalidArgument(
                "the wildcard event type cannot be posted".into(),
            ));
        }
        Ok(Event::new(event_type, payload, self.now_ms()))
    }

    async fn lock_listeners(&self) -> Result<MutexGuard<'_, Vec<Listener>>, KernelError> {
        tokio::time::timeout(self.config.listener_lock_timeout(), self.listeners.lock())
            .await
            .map_err(|_| KernelError::Timeout("listener table lock".into()))
    }
}

fn closed() -> KernelError {
    KernelError::InvalidState("event bus has been shut down".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus_with(config: BusConfig) -> Arc<EventBus> {
        Arc::new(EventBus::new(config, Instant::now()).expect("valid config"))
    }

    fn running_bus() -> Arc<EventBus> {
        let bus = bus_with(BusConfig::default());
        bus.spawn_dispatcher().expect("dispatcher spawns");
        bus
    }

    async fn wait_until(cond: impl Fn() -> bool) -> bool {
        for _ in 0..400 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    fn recorder(log: &Arc<StdMutex<Vec<&'static str>>>, tag: &'static str) -> EventHandler {
        let log = Arc::clone(log);
        handler(move |_, _| log.lock().unwrap().push(tag))
    }

    fn counter(count: &Arc<AtomicUsize>) -> EventHandler {
        let count = Arc::clone(count);
        handler(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn two_listeners_same_type_invoked_once_in_subscription_order() {
        let bus = running_bus();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(EventType::InputUp, recorder(&log, "first"), None)
            .await
            .unwrap();
        bus.subscribe(EventType::InputUp, recorder(&log, "second"), None)
            .await
            .unwrap();

        bus.post(EventType::InputUp, EventPayload::None).await.unwrap();

        assert!(wait_until(|| log.lock().unwrap().len() == 2).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn unsubscribed_listener_is_not_invoked() {
        let bus = running_bus();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let first = recorder(&log, "first");
        bus.subscribe(EventType::InputUp, first.clone(), None).await.unwrap();
        bus.subscribe(EventType::InputUp, recorder(&log, "second"), None)
            .await
            .unwrap();

        bus.unsubscribe(EventType::InputUp, &first).await.unwrap();
        bus.post(EventType::InputUp, EventPayload::None).await.unwrap();

        assert!(wait_until(|| !log.lock().unwrap().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn wildcard_sees_every_type_specific_sees_only_its_own() {
        let bus = running_bus();
        let seen_all = Arc::new(StdMutex::new(Vec::new()));
        let seen_wifi = Arc::new(StdMutex::new(Vec::new()));

        let all = Arc::clone(&seen_all);
        bus.subscribe(
            EventType::Any,
            handler(move |e, _| all.lock().unwrap().push(e.event_type)),
            None,
        )
        .await
        .unwrap();
        let wifi = Arc::clone(&seen_wifi);
        bus.subscribe(
            EventType::WifiConnected,
            handler(move |e, _| wifi.lock().unwrap().push(e.event_type)),
            None,
        )
        .await
        .unwrap();

        let posted = [
            EventType::WifiConnected,
            EventType::BtConnected,
            EventType::SystemTimeSync,
            EventType::Custom(5),
        ];
        for ty in posted {
            bus.post(ty, EventPayload::None).await.unwrap();
        }

        assert!(wait_until(|| seen_all.lock().unwrap().len() == posted.len()).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen_all.lock().unwrap(), posted.to_vec());
        assert_eq!(*seen_wifi.lock().unwrap(), vec![EventType::WifiConnected]);
    }

    #[tokio::test]
    async fn full_queue_times_out_and_excess_is_never_delivered() {
        let bus = bus_with(BusConfig {
            queue_capacity: 4,
            post_timeout_ms: 20,
            ..BusConfig::default()
        });
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        bus.subscribe(
            EventType::Any,
            handler(move |e, _| sink.lock().unwrap().push(e.id)),
            None,
        )
        .await
        .unwrap();

        // Dispatcher not running yet: nothing drains the queue.
        let mut accepted = Vec::new();
        for _ in 0..4 {
            accepted.push(bus.post(EventType::DisplayRefresh, EventPayload::None).await.unwrap());
        }
        let overflow = bus.post(EventType::DisplayRefresh, EventPayload::None).await;
        assert!(matches!(overflow, Err(KernelError::Timeout(_))));
        let isr_overflow = bus.post_from_isr(EventType::DisplayRefresh, EventPayload::None);
        assert!(matches!(isr_overflow, Err(KernelError::Timeout(_))));

        bus.spawn_dispatcher().unwrap();
        assert!(wait_until(|| delivered.lock().unwrap().len() == 4).await);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let got = delivered.lock().unwrap().clone();
        assert_eq!(got, accepted, "FIFO order, no duplicates, no extras");
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_round_trip_and_mismatched_pair() {
        let bus = running_bus();
        let count = Arc::new(AtomicUsize::new(0));
        let h = counter(&count);
        let before = bus.listener_count().await.unwrap();

        bus.subscribe(EventType::BtScanDone, h.clone(), None).await.unwrap();
        assert_eq!(bus.listener_count().await.unwrap(), before + 1);

        let mismatched = bus.unsubscribe(EventType::BtConnected, &h).await;
        assert!(matches!(mismatched, Err(KernelError::NotFound(_))));

        bus.unsubscribe(EventType::BtScanDone, &h).await.unwrap();
        assert_eq!(bus.listener_count().await.unwrap(), before);
    }

    #[tokio::test]
    async fn same_handler_under_two_types_is_two_listeners() {
        let bus = running_bus();
        let count = Arc::new(AtomicUsize::new(0));
        let h = counter(&count);
        bus.subscribe(EventType::InputLeft, h.clone(), None).await.unwrap();
        bus.subscribe(EventType::InputRight, h.clone(), None).await.unwrap();

        bus.unsubscribe(EventType::InputLeft, &h).await.unwrap();
        bus.post(EventType::InputLeft, EventPayload::None).await.unwrap();
        bus.post(EventType::InputRight, EventPayload::None).await.unwrap();

        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_table_capacity_is_enforced() {
        let bus = bus_with(BusConfig {
            max_listeners: 2,
            ..BusConfig::default()
        });
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventType::InputUp, counter(&count), None).await.unwrap();
        bus.subscribe(EventType::InputUp, counter(&count), None).await.unwrap();
        let third = bus.subscribe(EventType::InputUp, counter(&count), None).await;
        assert!(matches!(third, Err(KernelError::ResourceExhausted(_))));
        assert_eq!(bus.listener_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn user_data_and_payload_reach_the_handler() {
        let bus = running_bus();
        let seen = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&seen);
        let context: UserData = Arc::new(String::from("topbar"));
        bus.subscribe(
            EventType::WifiScanDone,
            handler(move |e, data| {
                let tag = data
                    .and_then(|d| d.downcast_ref::<String>())
                    .cloned()
                    .unwrap_or_default();
                *sink.lock().unwrap() = Some((tag, e.payload.clone()));
            }),
            Some(context),
        )
        .await
        .unwrap();

        bus.post(EventType::WifiScanDone, EventPayload::ScanResults { count: 3 })
            .await
            .unwrap();

        assert!(wait_until(|| seen.lock().unwrap().is_some()).await);
        let (tag, payload) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(tag, "topbar");
        assert_eq!(payload, EventPayload::ScanResults { count: 3 });
    }

    #[tokio::test]
    async fn posting_the_wildcard_is_rejected() {
        let bus = running_bus();
        assert!(matches!(
            bus.post(EventType::Any, EventPayload::None).await,
            Err(KernelError::InvalidArgument(_))
        ));
        assert!(matches!(
            bus.post_from_isr(EventType::Any, EventPayload::None),
            Err(KernelError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn handler_may_post_from_inside_dispatch() {
        let bus = running_bus();
        let follow_ups = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&bus);
        bus.subscribe(
            EventType::InputCenter,
            handler(move |_, _| {
                inner
                    .post_from_isr(EventType::DisplayRefresh, EventPayload::None)
                    .expect("queue has room");
            }),
            None,
        )
        .await
        .unwrap();
        bus.subscribe(EventType::DisplayRefresh, counter(&follow_ups), None)
            .await
            .unwrap();

        bus.post(EventType::InputCenter, EventPayload::None).await.unwrap();
        assert!(wait_until(|| follow_ups.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_dispatcher() {
        let bus = running_bus();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventType::SystemWatchdog, handler(|_, _| panic!("boom")), None)
            .await
            .unwrap();
        bus.subscribe(EventType::SystemWatchdog, counter(&count), None)
            .await
            .unwrap();

        bus.post(EventType::SystemWatchdog, EventPayload::None).await.unwrap();
        bus.post(EventType::SystemWatchdog, EventPayload::None).await.unwrap();

        assert!(wait_until(|| count.load(Ordering::SeqCst) == 2).await);
        assert!(bus.is_dispatching());
    }

    #[tokio::test]
    async fn shutdown_closes_the_queue() {
        let bus = running_bus();
        bus.shutdown().await;
        bus.shutdown().await;
        assert!(!bus.is_dispatching());
        assert!(matches!(
            bus.post(EventType::InputUp, EventPayload::None).await,
            Err(KernelError::InvalidState(_))
        ));
        assert!(matches!(bus.spawn_dispatcher(), Err(KernelError::InvalidState(_))));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result = EventBus::new(
            BusConfig {
                queue_capacity: 0,
                ..BusConfig::default()
            },
            Instant::now(),
        );
        assert!(matches!(result, Err(KernelError::InvalidArgument(_))));
    }

    #[test]
    fn spawning_outside_a_runtime_fails() {
        let bus = bus_with(BusConfig::default());
        assert!(matches!(bus.spawn_dispatcher(), Err(KernelError::InvalidState(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_deliver_exactly_n_times_m() {
        const PRODUCERS: usize = 8;
        const EVENTS_EACH: usize = 50;

        let bus = bus_with(BusConfig {
            post_timeout_ms: 2000,
            ..BusConfig::default()
        });
        let ids = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&ids);
        bus.subscribe(
            EventType::Custom(1),
            handler(move |e, _| sink.lock().unwrap().push(e.id)),
            None,
        )
        .await
        .unwrap();
        bus.spawn_dispatcher().unwrap();

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let bus = Arc::clone(&bus);
            producers.push(tokio::spawn(async move {
                for i in 0..EVENTS_EACH {
                    let body = format!("{p}:{i}").into_bytes();
                    bus.post(EventType::Custom(1), EventPayload::bytes(body))
                        .await
                        .expect("post accepted");
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let total = PRODUCERS * EVENTS_EACH;
        assert!(wait_until(|| ids.lock().unwrap().len() == total).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let ids = ids.lock().unwrap();
        assert_eq!(ids.len(), total);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), total);
    }
}
