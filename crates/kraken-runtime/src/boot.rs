//! [`Firmware`] – the boot sequence.
//!
//! ```text
//! Kernel::init
//!   ├─ register wifi, bluetooth, display, system   (BootConfig::services)
//!   ├─ start system, display, wifi                 (BootConfig::start_order)
//!   └─ spawn the input monitor                     (if system is running)
//! ```
//!
//! [`Firmware::shutdown`] walks the same path backwards. A boot that fails
//! half-way undoes what it already did before reporting the error.

use std::sync::Arc;
use std::time::Duration;

use kraken_kernel::{Kernel, KernelConfig};
use kraken_types::{KernelError, Permissions};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::services::{
    self, BluetoothService, DisplayService, InputKey, Service, SystemService, WifiService,
};

/// Depth of the channel feeding the input monitor.
const INPUT_QUEUE_DEPTH: usize = 16;

// ─────────────────────────────────────────────────────────────────────────────
// Boot manifest
// ─────────────────────────────────────────────────────────────────────────────

/// One entry of the boot manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Falls back to the service's own default mask when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
}

/// Which services to register, with what permissions, and which to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Started in this order once everything is registered.
    pub start_order: Vec<String>,
    /// Spawn the input monitor once `system` is running.
    pub input_monitor: bool,
    /// Period of the display refresh tick.
    pub display_refresh_ms: u64,
    /// Registered in this order.
    pub services: Vec<ServiceSpec>,
}

impl Default for BootConfig {
    fn default() -> Self {
        let spec = |name: &str, permissions| ServiceSpec {
            name: name.to_string(),
            permissions: Some(permissions),
        };
        Self {
            services: vec![
                spec(WifiService::NAME, Permissions::WIFI | Permissions::NETWORK),
                spec(BluetoothService::NAME, Permissions::BLUETOOTH),
                spec(DisplayService::NAME, Permissions::DISPLAY),
                spec(SystemService::NAME, Permissions::SYSTEM | Permissions::ALL),
            ],
            start_order: vec![
                SystemService::NAME.to_string(),
                DisplayService::NAME.to_string(),
                WifiService::NAME.to_string(),
            ],
            input_monitor: true,
            display_refresh_ms: 1000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Firmware
// ─────────────────────────────────────────────────────────────────────────────

/// A booted kernel plus the collaborator services running on it.
pub struct Firmware {
    kernel: Kernel,
    system: Arc<SystemService>,
    display: Arc<DisplayService>,
    wifi: Arc<WifiService>,
    bluetooth: Arc<BluetoothService>,
    registered: Vec<String>,
    started: Vec<String>,
    input: Option<mpsc::Sender<InputKey>>,
}

impl Firmware {
    /// Initialise the kernel and bring the services up as `boot` says.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidArgument`] – the manifest names an unknown
    ///   service or starts one it does not register.
    /// - Any error from kernel init, registration, a service's `init`, or
    ///   the input monitor.
    #[instrument(skip_all)]
    pub async fn boot(kernel_config: KernelConfig, boot: BootConfig) -> Result<Self, KernelError> {
        info!("Kraken OS starting...");
        let kernel = Kernel::new(kernel_config);
        let mut firmware = Self {
            system: Arc::new(SystemService::new(kernel.clone())),
            display: Arc::new(DisplayService::new(
                kernel.clone(),
                Duration::from_millis(boot.display_refresh_ms),
            )),
            wifi: Arc::new(WifiService::new(kernel.clone())),
            bluetooth: Arc::new(BluetoothService::new(kernel.clone())),
            kernel,
            registered: Vec::new(),
            started: Vec::new(),
            input: None,
        };

        if let Err(err) = firmware.bring_up(&boot).await {
            error!(%err, "boot failed, unwinding");
            firmware.shutdown().await;
            return Err(err);
        }
        info!(
            services = firmware.registered.len(),
            running = firmware.started.len(),
            "Kraken OS started successfully"
        );
        Ok(firmware)
    }

    async fn bring_up(&mut self, boot: &BootConfig) -> Result<(), KernelError> {
        for name in &boot.start_order {
            if !boot.services.iter().any(|s| &s.name == name) {
                return Err(KernelError::InvalidArgument(format!(
                    "start_order names unregistered service '{name}'"
                )));
            }
        }

        self.kernel.init().await?;

        for spec in &boot.services {
            let service = self.service(&spec.name)?;
            let permissions = spec
                .permissions
                .unwrap_or_else(|| service.default_permissions());
            debug!(service = service.name(), ?permissions, "registering");
            let (init, deinit) = services::hooks(service);
            self.kernel
                .register(&spec.name, permissions, Some(init), Some(deinit))
                .await?;
            self.registered.push(spec.name.clone());
        }

        for name in &boot.start_order {
            self.kernel.start(name).await?;
            self.started.push(name.clone());
        }

        if boot.input_monitor && self.started.iter().any(|n| n == SystemService::NAME) {
            let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
            self.system.start_input_monitor(rx)?;
            self.input = Some(tx);
        }
        Ok(())
    }

    fn service(&self, name: &str) -> Result<Arc<dyn Service>, KernelError> {
        let service: Arc<dyn Service> = match name {
            SystemService::NAME => self.system.clone(),
            DisplayService::NAME => self.display.clone(),
            WifiService::NAME => self.wifi.clone(),
            BluetoothService::NAME => self.bluetooth.clone(),
            other => {
                return Err(KernelError::InvalidArgument(format!("unknown service '{other}'")));
            }
        };
        Ok(service)
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn system(&self) -> &SystemService {
        &self.system
    }

    pub fn display(&self) -> &DisplayService {
        &self.display
    }

    pub fn wifi(&self) -> &WifiService {
        &self.wifi
    }

    pub fn bluetooth(&self) -> &BluetoothService {
        &self.bluetooth
    }

    /// Feed one key press to the input monitor.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] when no monitor is running.
    pub async fn press(&self, key: InputKey) -> Result<(), KernelError> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| KernelError::InvalidState("input monitor is not running".into()))?;
        input
            .send(key)
            .await
            .map_err(|_| KernelError::InvalidState("input monitor has stopped".into()))
    }

    /// Stop the input monitor, stop the started services in reverse order,
    /// unregister everything, and deinitialise the kernel. Failures are
    /// logged and do not interrupt the sequence.
    #[instrument(skip_all)]
    pub async fn shutdown(&mut self) {
        self.input = None;
        self.system.stop_input_monitor();

        while let Some(name) = self.started.pop() {
            if let Err(err) = self.kernel.stop(&name).await {
                warn!(service = %name, %err, "stop during shutdown failed");
            }
        }
        while let Some(name) = self.registered.pop() {
            if let Err(err) = self.kernel.unregister(&name).await {
                warn!(service = %name, %err, "unregister during shutdown failed");
            }
        }
        self.kernel.deinit().await;
        info!("Kraken OS stopped");
    }
}
