//! [`BluetoothService`] – simulated BLE central.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use kraken_kernel::{CapabilityToken, HookFuture, Kernel, ServiceContext};
use kraken_types::{EventPayload, EventType, KernelError, Permissions};
use tracing::{info, warn};

use super::Service;

/// Peers every scan "finds".
const SIMULATED_PEERS: &[BtAddress] = &[
    BtAddress([0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56]),
    BtAddress([0x7C, 0xDF, 0xA1, 0x00, 0xBE, 0xEF]),
];

/// A 48-bit device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BtAddress(pub [u8; 6]);

impl FromStr for BtAddress {
    type Err = KernelError;

    /// Parse the usual colon-separated form, e.g. `24:0A:C4:12:34:56`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KernelError::InvalidArgument(format!("bad bluetooth address '{s}'"));
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(BtAddress(bytes))
    }
}

impl fmt::Display for BtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[derive(Default)]
struct BtInner {
    token: Option<CapabilityToken>,
    peer: Option<BtAddress>,
}

pub struct BluetoothService {
    kernel: Kernel,
    inner: Mutex<BtInner>,
}

impl BluetoothService {
    pub const NAME: &'static str = "bluetooth";

    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            inner: Mutex::new(BtInner::default()),
        }
    }

    pub fn peer(&self) -> Option<BtAddress> {
        self.lock().peer
    }

    pub async fn scan(&self) -> Result<Vec<BtAddress>, KernelError> {
        self.authorize().await?;
        info!(count = SIMULATED_PEERS.len(), "bluetooth scan done");
        self.kernel
            .post(
                EventType::BtScanDone,
                EventPayload::ScanResults {
                    count: u16::try_from(SIMULATED_PEERS.len()).unwrap_or(u16::MAX),
                },
            )
            .await?;
        Ok(SIMULATED_PEERS.to_vec())
    }

    /// Open a link to `address`.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] when the service is not running or a
    /// different peer is already connected.
    pub async fn connect(&self, address: BtAddress) -> Result<(), KernelError> {
        self.authorize().await?;
        {
            let mut inner = self.lock();
            match inner.peer {
                Some(current) if current == address => return Ok(()),
                Some(current) => {
                    return Err(KernelError::InvalidState(format!(
                        "already connected to {current}"
                    )));
                }
                None => inner.peer = Some(address),
            }
        }
        info!(%address, "bluetooth connected");
        self.kernel
            .post(EventType::BtConnected, EventPayload::Peer { address: address.0 })
            .await?;
        Ok(())
    }

    /// Close the current link. A no-op when not connected.
    pub async fn disconnect(&self) -> Result<(), KernelError> {
        self.authorize().await?;
        let Some(address) = self.lock().peer.take() else {
            return Ok(());
        };
        info!(%address, "bluetooth disconnected");
        self.kernel
            .post(EventType::BtDisconnected, EventPayload::Peer { address: address.0 })
            .await?;
        Ok(())
    }

    async fn authorize(&self) -> Result<(), KernelError> {
        let token = self
            .lock()
            .token
            .clone()
            .ok_or_else(|| KernelError::InvalidState("bluetooth service is not running".into()))?;
        token.check(Permissions::BLUETOOTH).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BtInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Service for BluetoothService {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn default_permissions(&self) -> Permissions {
        Permissions::BLUETOOTH
    }

    fn init(self: Arc<Self>, ctx: ServiceContext) -> HookFuture {
        Box::pin(async move {
            self.kernel.check_caller_permission(Permissions::BLUETOOTH).await?;
            self.lock().token = Some(ctx.token());
            info!("bluetooth service initialized");
            Ok(())
        })
    }

    fn deinit(self: Arc<Self>, _ctx: ServiceContext) -> HookFuture {
        Box::pin(async move {
            if let Err(err) = self.disconnect().await {
                warn!(%err, "disconnect during deinit failed");
            }
            self.lock().token = None;
            info!("bluetooth service deinitialized");
            Ok(())
        })
    }
}
