//! Collaborator services booted by the firmware.
//!
//! Each service is a hardware-free simulation that speaks only the kernel
//! contract: it checks its own capabilities from inside `init`, keeps the
//! [`CapabilityToken`](kraken_kernel::CapabilityToken) it was handed for
//! later work, and talks to the other services exclusively through events.

use std::sync::Arc;

use kraken_kernel::{HookFuture, ServiceContext, ServiceHook};
use kraken_types::Permissions;

pub mod bluetooth;
pub mod display;
pub mod system;
pub mod wifi;

pub use bluetooth::{BluetoothService, BtAddress};
pub use display::{DisplayService, MENU, StatusBar};
pub use system::{InputKey, SystemService};
pub use wifi::{WifiConnection, WifiService};

/// A service the firmware knows how to register.
pub trait Service: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Capability mask granted when the boot manifest does not override it.
    fn default_permissions(&self) -> Permissions;

    fn init(self: Arc<Self>, ctx: ServiceContext) -> HookFuture;

    fn deinit(self: Arc<Self>, ctx: ServiceContext) -> HookFuture;
}

/// Build the registry hooks that forward to `service`.
pub fn hooks(service: Arc<dyn Service>) -> (ServiceHook, ServiceHook) {
    let on_init = Arc::clone(&service);
    let init: ServiceHook = Arc::new(move |ctx| Arc::clone(&on_init).init(ctx));
    let deinit: ServiceHook = Arc::new(move |ctx| Arc::clone(&service).deinit(ctx));
    (init, deinit)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;
    use std::time::Duration;

    use kraken_kernel::{Kernel, KernelConfig};
    use kraken_middleware::handler;
    use kraken_types::{Event, EventType};

    pub(crate) async fn booted_kernel() -> Kernel {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.init().await.unwrap();
        kernel
    }

    /// Subscribe a wildcard listener that records every delivered event.
    pub(crate) async fn record_events(kernel: &Kernel) -> std::sync::Arc<Mutex<Vec<Event>>> {
        let log = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&log);
        kernel
            .subscribe(
                EventType::Any,
                handler(move |event: &Event, _| sink.lock().unwrap().push(event.clone())),
                None,
            )
            .await
            .unwrap();
        log
    }

    pub(crate) fn types_of(log: &Mutex<Vec<Event>>) -> Vec<EventType> {
        log.lock().unwrap().iter().map(|e| e.event_type).collect()
    }

    pub(crate) async fn wait_until(cond: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }
}
