//! [`Kernel`] – the handle every service and call site shares.
//!
//! A `Kernel` is a cheap, cloneable handle. [`init`](Kernel::init) builds the
//! service registry and then the event bus with its dispatcher;
//! [`deinit`](Kernel::deinit) tears them down in reverse. Between the two,
//! every registry and bus operation is delegated; outside that window they
//! fail with [`KernelError::InvalidState`].

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use kraken_middleware::{EventBus, EventHandler};
use kraken_types::{EventPayload, EventType, KernelError, Permissions, UserData};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::service_registry::{ServiceHook, ServiceInfo, ServiceRegistry, ServiceState};
use crate::timer::{SoftTimer, TimerCallback};

struct KernelState {
    registry: ServiceRegistry,
    bus: EventBus,
    epoch: Instant,
}

struct KernelShared {
    config: KernelConfig,
    state: RwLock<Option<Arc<KernelState>>>,
    /// Serialises `init` against `deinit`.
    lifecycle: Mutex<()>,
}

/// Shared handle to the kernel.
///
/// # Example
///
/// ```
/// use kraken_kernel::{Kernel, KernelConfig};
/// use kraken_types::Permissions;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), kraken_types::KernelError> {
/// let kernel = Kernel::new(KernelConfig::default());
/// kernel.init().await?;
/// kernel.register("display", Permissions::DISPLAY, None, None).await?;
/// assert!(kernel.has_permission("display", Permissions::DISPLAY).await);
/// kernel.deinit().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Kernel {
    shared: Arc<KernelShared>,
}

impl Kernel {
    /// Create an uninitialised kernel.
    pub fn new(config: KernelConfig) -> Self {
        Self {
            shared: Arc::new(KernelShared {
                config,
                state: RwLock::new(None),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    /// Build the registry, then the event bus, then spawn the dispatcher.
    /// Calling it on an initialised kernel is a no-op.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] for a zero capacity, or
    /// [`KernelError::InvalidState`] if the dispatcher cannot be spawned.
    /// Nothing built before the failure survives it.
    #[instrument(skip(self))]
    pub async fn init(&self) -> Result<(), KernelError> {
        let _guard = self.shared.lifecycle.lock().await;
        if self.is_initialized() {
            warn!("kernel already initialized");
            return Ok(());
        }

        let config = &self.shared.config;
        let epoch = Instant::now();
        let registry = ServiceRegistry::new(config)?;
        let bus = EventBus::new(config.bus.clone(), epoch)?;
        bus.spawn_dispatcher()?;

        *self.write_state() = Some(Arc::new(KernelState {
            registry,
            bus,
            epoch,
        }));
        info!(
            max_services = config.max_services,
            max_listeners = config.bus.max_listeners,
            queue_capacity = config.bus.queue_capacity,
            "kraken kernel initialized"
        );
        Ok(())
    }

    /// Stop the dispatcher and drop the bus, then the registry. Idempotent.
    ///
    /// Services are not stopped: quiesce them first. Outstanding
    /// capability tokens report [`KernelError::InvalidState`] afterwards.
    #[instrument(skip(self))]
    pub async fn deinit(&self) {
        let _guard = self.shared.lifecycle.lock().await;
        let Some(state) = self.write_state().take() else {
            return;
        };

        if let Ok(services) = state.registry.list().await {
            let running = services
                .iter()
                .filter(|s| s.state != ServiceState::Registered)
                .count();
            if running > 0 {
                warn!(running, "kernel deinit with services still running");
            }
        }

        state.bus.shutdown().await;
        drop(state);
        info!("kraken kernel deinitialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.read_state().is_some()
    }

    // ── services ────────────────────────────────────────────────────────────

    /// See [`ServiceRegistry::register`].
    pub async fn register(
        &self,
        name: &str,
        permissions: Permissions,
        init: Option<ServiceHook>,
        deinit: Option<ServiceHook>,
    ) -> Result<(), KernelError> {
        self.state()?.registry.register(name, permissions, init, deinit).await
    }

    /// See [`ServiceRegistry::unregister`].
    pub async fn unregister(&self, name: &str) -> Result<(), KernelError> {
        self.state()?.registry.unregister(name).await
    }

    /// See [`ServiceRegistry::start`].
    pub async fn start(&self, name: &str) -> Result<(), KernelError> {
        self.state()?.registry.start(name).await
    }

    /// See [`ServiceRegistry::stop`].
    pub async fn stop(&self, name: &str) -> Result<(), KernelError> {
        self.state()?.registry.stop(name).await
    }

    /// See [`ServiceRegistry::has_permission`]. `false` before `init`.
    pub async fn has_permission(&self, name: &str, permission: Permissions) -> bool {
        match self.state() {
            Ok(state) => state.registry.has_permission(name, permission).await,
            Err(_) => false,
        }
    }

    /// See [`ServiceRegistry::check_caller_permission`].
    pub async fn check_caller_permission(
        &self,
        permission: Permissions,
    ) -> Result<(), KernelError> {
        self.state()?.registry.check_caller_permission(permission).await
    }

    pub async fn service_info(&self, name: &str) -> Result<ServiceInfo, KernelError> {
        self.state()?.registry.info(name).await
    }

    /// Every registered service, in registration order.
    pub async fn services(&self) -> Result<Vec<ServiceInfo>, KernelError> {
        self.state()?.registry.list().await
    }

    // ── events ──────────────────────────────────────────────────────────────

    /// See [`EventBus::subscribe`].
    pub async fn subscribe(
        &self,
        event_type: EventType,
        handler: EventHandler,
        user_data: Option<UserData>,
    ) -> Result<(), KernelError> {
        self.state()?.bus.subscribe(event_type, handler, user_data).await
    }

    /// See [`EventBus::unsubscribe`].
    pub async fn unsubscribe(
        &self,
        event_type: EventType,
        handler: &EventHandler,
    ) -> Result<(), KernelError> {
        self.state()?.bus.unsubscribe(event_type, handler).await
    }

    /// See [`EventBus::post`].
    pub async fn post(
        &self,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<Uuid, KernelError> {
        self.state()?.bus.post(event_type, payload).await
    }

    /// See [`EventBus::post_from_isr`]. Never waits.
    pub fn post_from_isr(
        &self,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<Uuid, KernelError> {
        self.state()?.bus.post_from_isr(event_type, payload)
    }

    pub async fn listener_count(&self) -> Result<usize, KernelError> {
        self.state()?.bus.listener_count().await
    }

    // ── clock & timers ──────────────────────────────────────────────────────

    /// Milliseconds since [`init`](Kernel::init); `0` before it.
    pub fn tick_count_ms(&self) -> u64 {
        self.read_state()
            .as_ref()
            .map(|state| u64::try_from(state.epoch.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Create a disarmed [`SoftTimer`].
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] before `init`;
    /// [`KernelError::InvalidArgument`] for an empty name or zero period.
    pub fn timer_create(
        &self,
        name: &str,
        period: Duration,
        auto_reload: bool,
        callback: TimerCallback,
    ) -> Result<SoftTimer, KernelError> {
        self.state()?;
        SoftTimer::new(name, period, auto_reload, callback)
    }

    fn state(&self) -> Result<Arc<KernelState>, KernelError> {
        self.read_state()
            .clone()
            .ok_or_else(|| KernelError::InvalidState("kernel is not initialized".into()))
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<KernelState>>> {
        self.shared.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<KernelState>>> {
        self.shared.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
