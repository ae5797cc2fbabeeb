//! [`WifiService`] – simulated station-mode Wi-Fi.
//!
//! Connecting "associates" immediately and leases an address from a fake
//! DHCP pool, posting `WifiConnected` followed by `WifiGotIp`. Every radio
//! operation re-checks [`Permissions::WIFI`] with the token the service was
//! handed in `init`.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use kraken_kernel::{CapabilityToken, HookFuture, Kernel, ServiceContext};
use kraken_types::{EventPayload, EventType, KernelError, Permissions};
use tracing::{info, instrument, warn};

use super::Service;

/// Longest SSID accepted by 802.11.
const SSID_MAX_LEN: usize = 32;

/// Access points every scan "finds".
const SIMULATED_NETWORKS: &[&str] = &["kraken-lab", "workshop", "guest"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiConnection {
    pub ssid: String,
    pub ip: Ipv4Addr,
}

#[derive(Default)]
struct WifiInner {
    token: Option<CapabilityToken>,
    connection: Option<WifiConnection>,
    leases: u8,
}

pub struct WifiService {
    kernel: Kernel,
    inner: Mutex<WifiInner>,
}

impl WifiService {
    pub const NAME: &'static str = "wifi";

    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            inner: Mutex::new(WifiInner::default()),
        }
    }

    pub fn connection(&self) -> Option<WifiConnection> {
        self.lock().connection.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connection.is_some()
    }

    /// Associate with `ssid` and lease an address. Reconnecting to a
    /// different network drops the old association first.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidArgument`] – empty or over-long SSID.
    /// - [`KernelError::InvalidState`] – the service is not running.
    /// - Any error from the capability check or from posting the events.
    #[instrument(skip(self))]
    pub async fn connect(&self, ssid: &str) -> Result<Ipv4Addr, KernelError> {
        if ssid.is_empty() || ssid.len() > SSID_MAX_LEN {
            return Err(KernelError::InvalidArgument(format!(
                "SSID must be 1..={SSID_MAX_LEN} bytes"
            )));
        }
        let token = self.token()?;
        token.check(Permissions::WIFI).await?;

        if self.connection().is_some_and(|c| c.ssid != ssid) {
            self.disconnect().await?;
        }

        let ip = {
            let mut inner = self.lock();
            let ip = Ipv4Addr::new(192, 168, 4, 2 + inner.leases % 250);
            inner.leases = inner.leases.wrapping_add(1);
            inner.connection = Some(WifiConnection {
                ssid: ssid.to_string(),
                ip,
            });
            ip
        };

        info!(%ip, "connected");
        self.kernel
            .post(EventType::WifiConnected, EventPayload::Text(ssid.to_string()))
            .await?;
        self.kernel
            .post(EventType::WifiGotIp, EventPayload::AddressAcquired { ip })
            .await?;
        Ok(ip)
    }

    /// Drop the current association. A no-op when not connected.
    pub async fn disconnect(&self) -> Result<(), KernelError> {
        let token = self.token()?;
        token.check(Permissions::WIFI).await?;
        let Some(previous) = self.lock().connection.take() else {
            return Ok(());
        };
        info!(ssid = %previous.ssid, "disconnected");
        self.kernel
            .post(EventType::WifiDisconnected, EventPayload::Text(previous.ssid))
            .await?;
        Ok(())
    }

    /// Scan for access points and announce the result count.
    pub async fn scan(&self) -> Result<Vec<String>, KernelError> {
        let token = self.token()?;
        token.check(Permissions::WIFI).await?;
        let found: Vec<String> = SIMULATED_NETWORKS.iter().map(|s| s.to_string()).collect();
        info!(count = found.len(), "scan done");
        self.kernel
            .post(
                EventType::WifiScanDone,
                EventPayload::ScanResults {
                    count: u16::try_from(found.len()).unwrap_or(u16::MAX),
                },
            )
            .await?;
        Ok(found)
    }

    fn token(&self) -> Result<CapabilityToken, KernelError> {
        self.lock()
            .token
            .clone()
            .ok_or_else(|| KernelError::InvalidState("wifi service is not running".into()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WifiInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Service for WifiService {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn default_permissions(&self) -> Permissions {
        Permissions::WIFI | Permissions::NETWORK
    }

    fn init(self: Arc<Self>, ctx: ServiceContext) -> HookFuture {
        Box::pin(async move {
            self.kernel.check_caller_permission(Permissions::WIFI).await?;
            self.lock().token = Some(ctx.token());
            info!("wifi service initialized");
            Ok(())
        })
    }

    fn deinit(self: Arc<Self>, _ctx: ServiceContext) -> HookFuture {
        Box::pin(async move {
            if let Err(err) = self.disconnect().await {
                warn!(%err, "disconnect during deinit failed");
            }
            self.lock().token = None;
            info!("wifi service deinitialized");
            Ok(())
        })
    }
}
