//! [`SystemService`] – clock synchronisation and the directional-input
//! monitor.
//!
//! On `init` the service proves it holds [`Permissions::SYSTEM`], announces
//! the current wall-clock time with a `SystemTimeSync` event, and re-syncs
//! whenever the network reports an address. The input monitor is a task
//! that turns [`InputKey`]s from a channel into `Input*` events; it checks
//! `SYSTEM` with the service's capability token before every post.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use kraken_kernel::{CapabilityToken, HookFuture, Kernel, ServiceContext};
use kraken_middleware::{EventHandler, handler};
use kraken_types::{EventPayload, EventType, KernelError, Permissions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::Service;

// ─────────────────────────────────────────────────────────────────────────────
// Input keys
// ─────────────────────────────────────────────────────────────────────────────

/// One press of the five-way navigation pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKey {
    Up,
    Down,
    Left,
    Right,
    Select,
}

impl InputKey {
    pub fn event_type(self) -> EventType {
        match self {
            InputKey::Up => EventType::InputUp,
            InputKey::Down => EventType::InputDown,
            InputKey::Left => EventType::InputLeft,
            InputKey::Right => EventType::InputRight,
            InputKey::Select => EventType::InputCenter,
        }
    }

    pub fn from_event(event_type: EventType) -> Option<Self> {
        match event_type {
            EventType::InputUp => Some(InputKey::Up),
            EventType::InputDown => Some(InputKey::Down),
            EventType::InputLeft => Some(InputKey::Left),
            EventType::InputRight => Some(InputKey::Right),
            EventType::InputCenter => Some(InputKey::Select),
            _ => None,
        }
    }
}

impl FromStr for InputKey {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(InputKey::Up),
            "down" => Ok(InputKey::Down),
            "left" => Ok(InputKey::Left),
            "right" => Ok(InputKey::Right),
            "select" | "center" | "enter" => Ok(InputKey::Select),
            other => Err(KernelError::InvalidArgument(format!("unknown input key '{other}'"))),
        }
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputKey::Up => "up",
            InputKey::Down => "down",
            InputKey::Left => "left",
            InputKey::Right => "right",
            InputKey::Select => "select",
        };
        f.write_str(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SystemService
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SystemInner {
    token: Option<CapabilityToken>,
    on_got_ip: Option<EventHandler>,
    monitor: Option<JoinHandle<()>>,
}

pub struct SystemService {
    kernel: Kernel,
    time_synced: Arc<AtomicBool>,
    inner: Mutex<SystemInner>,
}

impl SystemService {
    pub const NAME: &'static str = "system";

    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            time_synced: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(SystemInner::default()),
        }
    }

    /// `true` once a `SystemTimeSync` event has been accepted by the bus.
    pub fn is_time_synced(&self) -> bool {
        self.time_synced.load(Ordering::Acquire)
    }

    /// Spawn the input monitor, feeding it from `keys`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidState`] – the service is not running, or no
    ///   Tokio runtime is available.
    /// - [`KernelError::AlreadyExists`] – a monitor is already running.
    pub fn start_input_monitor(&self, keys: mpsc::Receiver<InputKey>) -> Result<(), KernelError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| KernelError::InvalidState("input monitor needs a Tokio runtime".into()))?;
        let mut inner = self.lock();
        let Some(token) = inner.token.clone() else {
            return Err(KernelError::InvalidState("system service is not running".into()));
        };
        if inner.monitor.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(KernelError::AlreadyExists("input monitor".into()));
        }
        inner.monitor = Some(runtime.spawn(input_monitor(self.kernel.clone(), token, keys)));
        info!("input monitor started");
        Ok(())
    }

    /// Abort the input monitor. Idempotent.
    pub fn stop_input_monitor(&self) {
        if let Some(task) = self.lock().monitor.take() {
            task.abort();
            info!("input monitor stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock()
            .monitor
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SystemInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Service for SystemService {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn default_permissions(&self) -> Permissions {
        Permissions::SYSTEM | Permissions::ALL
    }

    fn init(self: Arc<Self>, ctx: ServiceContext) -> HookFuture {
        Box::pin(async move {
            self.kernel.check_caller_permission(Permissions::SYSTEM).await?;

            let on_got_ip = {
                let kernel = self.kernel.clone();
                let synced = Arc::clone(&self.time_synced);
                handler(move |_, _| {
                    info!("network up, syncing time");
                    match kernel.post_from_isr(EventType::SystemTimeSync, time_sync_payload()) {
                        Ok(_) => synced.store(true, Ordering::Release),
                        Err(err) => warn!(%err, "time sync event dropped"),
                    }
                })
            };
            self.kernel
                .subscribe(EventType::WifiGotIp, on_got_ip.clone(), None)
                .await?;

            match self
                .kernel
                .post(EventType::SystemTimeSync, time_sync_payload())
                .await
            {
                Ok(_) => self.time_synced.store(true, Ordering::Release),
                Err(err) => warn!(%err, "initial time sync event dropped"),
            }

            let mut inner = self.lock();
            inner.token = Some(ctx.token());
            inner.on_got_ip = Some(on_got_ip);
            info!("system service initialized");
            Ok(())
        })
    }

    fn deinit(self: Arc<Self>, _ctx: ServiceContext) -> HookFuture {
        Box::pin(async move {
            self.stop_input_monitor();
            let on_got_ip = {
                let mut inner = self.lock();
                inner.token = None;
                inner.on_got_ip.take()
            };
            if let Some(on_got_ip) = on_got_ip {
                self.kernel.unsubscribe(EventType::WifiGotIp, &on_got_ip).await?;
            }
            self.time_synced.store(false, Ordering::Release);
            info!("system service deinitialized");
            Ok(())
        })
    }
}

async fn input_monitor(kernel: Kernel, token: CapabilityToken, mut keys: mpsc::Receiver<InputKey>) {
    while let Some(key) = keys.recv().await {
        if let Err(err) = token.check(Permissions::SYSTEM).await {
            error!(%err, "input monitor lost its SYSTEM capability");
            break;
        }
        info!(%key, "input");
        if let Err(err) = kernel.post(key.event_type(), EventPayload::None).await {
            warn!(%key, %err, "input event dropped");
        }
    }
}

fn time_sync_payload() -> EventPayload {
    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    EventPayload::TimeSync { unix_secs }
}
