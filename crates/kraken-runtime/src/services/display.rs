//! [`DisplayService`] – the status bar and main menu, minus the panel.
//!
//! The service keeps no link to the other services. It subscribes one
//! handler to the connectivity, clock and input events it cares about and
//! folds them into a [`StatusBar`] snapshot; a periodic soft timer stands in
//! for the UI refresh tick.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kraken_kernel::{HookFuture, Kernel, ServiceContext, SoftTimer};
use kraken_middleware::{EventHandler, handler};
use kraken_types::{Event, EventPayload, EventType, KernelError, Permissions};
use tracing::{debug, info, warn};

use super::Service;
use super::bluetooth::BtAddress;
use super::system::InputKey;

/// Event types the display listens to.
const WATCHED: [EventType; 11] = [
    EventType::WifiConnected,
    EventType::WifiDisconnected,
    EventType::WifiGotIp,
    EventType::BtConnected,
    EventType::BtDisconnected,
    EventType::SystemTimeSync,
    EventType::InputUp,
    EventType::InputDown,
    EventType::InputLeft,
    EventType::InputRight,
    EventType::InputCenter,
];

pub const MENU: [&str; 4] = ["Network", "Bluetooth", "Audio", "Settings"];

/// What the top bar and menu currently show.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusBar {
    pub wifi_ssid: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub bt_peer: Option<BtAddress>,
    /// Unix time of the last clock sync.
    pub clock: Option<i64>,
    pub last_input: Option<InputKey>,
    /// Highlighted entry of [`MENU`].
    pub cursor: usize,
    /// Entry opened with select/right, closed with left.
    pub opened: Option<&'static str>,
    pub events_seen: u64,
    pub refreshes: u64,
}

impl StatusBar {
    pub fn wifi_connected(&self) -> bool {
        self.wifi_ssid.is_some()
    }

    pub fn time_synced(&self) -> bool {
        self.clock.is_some()
    }

    fn apply(&mut self, event: &Event) {
        self.events_seen += 1;
        match (event.event_type, &event.payload) {
            (EventType::WifiConnected, EventPayload::Text(ssid)) => {
                self.wifi_ssid = Some(ssid.clone());
            }
            (EventType::WifiConnected, _) => {
                self.wifi_ssid.get_or_insert_with(String::new);
            }
            (EventType::WifiGotIp, EventPayload::AddressAcquired { ip }) => self.ip = Some(*ip),
            (EventType::WifiDisconnected, _) => {
                self.wifi_ssid = None;
                self.ip = None;
            }
            (EventType::BtConnected, EventPayload::Peer { address }) => {
                self.bt_peer = Some(BtAddress(*address));
            }
            (EventType::BtDisconnected, _) => self.bt_peer = None,
            (EventType::SystemTimeSync, EventPayload::TimeSync { unix_secs }) => {
                self.clock = Some(*unix_secs);
            }
            (other, _) => {
                if let Some(key) = InputKey::from_event(other) {
                    self.navigate(key);
                }
            }
        }
    }

    fn navigate(&mut self, key: InputKey) {
        self.last_input = Some(key);
        match key {
            InputKey::Up => self.cursor = (self.cursor + MENU.len() - 1) % MENU.len(),
            InputKey::Down => self.cursor = (self.cursor + 1) % MENU.len(),
            InputKey::Select | InputKey::Right => self.opened = Some(MENU[self.cursor]),
            InputKey::Left => self.opened = None,
        }
    }
}

impl fmt::Display for StatusBar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.wifi_ssid, self.ip) {
            (Some(ssid), Some(ip)) => write!(f, "[wifi {ssid} {ip}]")?,
            (Some(ssid), None) => write!(f, "[wifi {ssid}]")?,
            (None, _) => write!(f, "[wifi off]")?,
        }
        match self.bt_peer {
            Some(peer) => write!(f, " [bt {peer}]")?,
            None => write!(f, " [bt off]")?,
        }
        match self.clock {
            Some(unix) => {
                let day_secs = unix.rem_euclid(86_400);
                write!(f, " [{:02}:{:02} UTC]", day_secs / 3600, day_secs % 3600 / 60)?;
            }
            None => write!(f, " [--:--]")?,
        }
        write!(f, " menu: {}", MENU[self.cursor % MENU.len()])?;
        if let Some(opened) = self.opened {
            write!(f, " (open: {opened})")?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct DisplayInner {
    handler: Option<EventHandler>,
    refresh_timer: Option<SoftTimer>,
}

pub struct DisplayService {
    kernel: Kernel,
    refresh_period: Duration,
    status: Arc<Mutex<StatusBar>>,
    inner: Mutex<DisplayInner>,
}

impl DisplayService {
    pub const NAME: &'static str = "display";

    pub fn new(kernel: Kernel, refresh_period: Duration) -> Self {
        Self {
            kernel,
            refresh_period,
            status: Arc::new(Mutex::new(StatusBar::default())),
            inner: Mutex::new(DisplayInner::default()),
        }
    }

    /// Snapshot of the status bar.
    pub fn status(&self) -> StatusBar {
        lock(&self.status).clone()
    }

    async fn unsubscribe_all(&self, on_event: &EventHandler, event_types: &[EventType]) {
        for &event_type in event_types {
            if let Err(err) = self.kernel.unsubscribe(event_type, on_event).await {
                warn!(%event_type, %err, "display listener not removed");
            }
        }
    }
}

impl Service for DisplayService {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn default_permissions(&self) -> Permissions {
        Permissions::DISPLAY
    }

    fn init(self: Arc<Self>, _ctx: ServiceContext) -> HookFuture {
        Box::pin(async move {
            self.kernel.check_caller_permission(Permissions::DISPLAY).await?;

            let on_event = {
                let status = Arc::clone(&self.status);
                handler(move |event: &Event, _| {
                    debug!(event_type = %event.event_type, "display update");
                    lock(&status).apply(event);
                })
            };
            for (i, &event_type) in WATCHED.iter().enumerate() {
                if let Err(err) = self.kernel.subscribe(event_type, on_event.clone(), None).await {
                    self.unsubscribe_all(&on_event, &WATCHED[..i]).await;
                    return Err(err);
                }
            }

            let mut refresh_timer = {
                let status = Arc::clone(&self.status);
                match self.kernel.timer_create(
                    "ui_update",
                    self.refresh_period,
                    true,
                    Arc::new(move || lock(&status).refreshes += 1),
                ) {
                    Ok(timer) => timer,
                    Err(err) => {
                        self.unsubscribe_all(&on_event, &WATCHED).await;
                        return Err(err);
                    }
                }
            };
            if let Err(err) = refresh_timer.start() {
                self.unsubscribe_all(&on_event, &WATCHED).await;
                return Err(err);
            }

            let mut inner = lock(&self.inner);
            inner.handler = Some(on_event);
            inner.refresh_timer = Some(refresh_timer);
            info!(listeners = WATCHED.len(), "display service initialized");
            Ok(())
        })
    }

    fn deinit(self: Arc<Self>, _ctx: ServiceContext) -> HookFuture {
        Box::pin(async move {
            let (on_event, refresh_timer) = {
                let mut inner = lock(&self.inner);
                (inner.handler.take(), inner.refresh_timer.take())
            };
            if let Some(timer) = refresh_timer {
                timer.delete();
            }
            if let Some(on_event) = on_event {
                self.unsubscribe_all(&on_event, &WATCHED).await;
            }
            info!("display service deinitialized");
            Ok(())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
