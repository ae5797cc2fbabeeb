use std::any::Any;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

bitflags! {
    /// Capability bits granted to a service at registration time.
    ///
    /// Serialises as text (`"WIFI | NETWORK"`) in human-readable formats so
    /// boot manifests stay legible.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u32 {
        /// Wi-Fi radio control.
        const WIFI = 1 << 0;
        /// Bluetooth radio control.
        const BLUETOOTH = 1 << 1;
        /// Display and UI drawing.
        const DISPLAY = 1 << 2;
        /// Audio playback and capture.
        const AUDIO = 1 << 3;
        /// Persistent storage.
        const STORAGE = 1 << 4;
        /// IP network stack.
        const NETWORK = 1 << 5;
        /// Clock, input and power management.
        const SYSTEM = 1 << 6;
        /// Superset of every present and future capability bit.
        const ALL = u32::MAX;
    }
}

/// Kind of an [`Event`] routed over the kernel event bus.
///
/// Every variant maps to a stable numeric code (see [`EventType::code`]) so
/// collaborators that log or persist raw codes keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Wildcard: a listener subscribed with `Any` receives every event.
    Any,

    WifiScanDone,
    WifiConnected,
    WifiDisconnected,
    WifiGotIp,

    BtScanDone,
    BtConnected,
    BtDisconnected,

    InputUp,
    InputDown,
    InputLeft,
    InputRight,
    InputCenter,

    DisplayRefresh,
    DisplayTouch,

    AudioPlayDone,
    AudioRecordDone,

    SystemTimeSync,
    SystemLowMemory,
    SystemWatchdog,

    AppInstalled,
    AppUninstalled,
    AppStarted,
    AppStopped,

    /// Collaborator-defined event; encoded as `1000 + n`.
    Custom(u32),
}

/// Coarse grouping of [`EventType`]s, mostly useful for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    Wildcard,
    Network,
    Radio,
    Input,
    Display,
    Media,
    System,
    Application,
    User,
}

const CUSTOM_BASE: u32 = 1000;

impl EventType {
    /// Stable numeric code of this event type.
    pub fn code(self) -> u32 {
        match self {
            EventType::Any => 0,
            EventType::WifiScanDone => 100,
            EventType::WifiConnected => 101,
            EventType::WifiDisconnected => 102,
            EventType::WifiGotIp => 103,
            EventType::BtScanDone => 200,
            EventType::BtConnected => 201,
            EventType::BtDisconnected => 202,
            EventType::InputUp => 300,
            EventType::InputDown => 301,
            EventType::InputLeft => 302,
            EventType::InputRight => 303,
            EventType::InputCenter => 304,
            EventType::DisplayRefresh => 400,
            EventType::DisplayTouch => 401,
            EventType::AudioPlayDone => 500,
            EventType::AudioRecordDone => 501,
            EventType::SystemTimeSync => 600,
            EventType::SystemLowMemory => 601,
            EventType::SystemWatchdog => 602,
            EventType::AppInstalled => 700,
            EventType::AppUninstalled => 701,
            EventType::AppStarted => 702,
            EventType::AppStopped => 703,
            EventType::Custom(n) => CUSTOM_BASE.saturating_add(n),
        }
    }

    /// Inverse of [`EventType::code`]. Returns `None` for unassigned codes.
    pub fn from_code(code: u32) -> Option<Self> {
        let ty = match code {
            0 => EventType::Any,
            100 => EventType::WifiScanDone,
            101 => EventType::WifiConnected,
            102 => EventType::WifiDisconnected,
            103 => EventType::WifiGotIp,
            200 => EventType::BtScanDone,
            201 => EventType::BtConnected,
            202 => EventType::BtDisconnected,
            300 => EventType::InputUp,
            301 => EventType::InputDown,
            302 => EventType::InputLeft,
            303 => EventType::InputRight,
            304 => EventType::InputCenter,
            400 => EventType::DisplayRefresh,
            401 => EventType::DisplayTouch,
            500 => EventType::AudioPlayDone,
            501 => EventType::AudioRecordDone,
            600 => EventType::SystemTimeSync,
            601 => EventType::SystemLowMemory,
            602 => EventType::SystemWatchdog,
            700 => EventType::AppInstalled,
            701 => EventType::AppUninstalled,
            702 => EventType::AppStarted,
            703 => EventType::AppStopped,
            n if n >= CUSTOM_BASE => EventType::Custom(n - CUSTOM_BASE),
            _ => return None,
        };
        Some(ty)
    }

    pub fn category(self) -> EventCategory {
        match self.code() {
            0 => EventCategory::Wildcard,
            100..=199 => EventCategory::Network,
            200..=299 => EventCategory::Radio,
            300..=399 => EventCategory::Input,
            400..=499 => EventCategory::Display,
            500..=599 => EventCategory::Media,
            600..=699 => EventCategory::System,
            700..=799 => EventCategory::Application,
            _ => EventCategory::User,
        }
    }

    /// `true` when a listener subscribed to `self` should receive an event
    /// of type `other`.
    pub fn matches(self, other: EventType) -> bool {
        self == EventType::Any || self == other
    }

    pub fn is_wildcard(self) -> bool {
        self == EventType::Any
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Custom(n) => write!(f, "Custom({n})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Data carried by an [`Event`].
///
/// Payloads are owned by the event, so a producer may return or drop its own
/// buffers as soon as `post` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum EventPayload {
    #[default]
    None,
    /// Opaque bytes for collaborator-specific events.
    Bytes(Arc<[u8]>),
    Text(String),
    /// Number of access points or peers found by a scan.
    ScanResults { count: u16 },
    /// Address assigned by DHCP after a network connection.
    AddressAcquired { ip: Ipv4Addr },
    /// Short-range radio peer address.
    Peer { address: [u8; 6] },
    Touch { x: u16, y: u16 },
    TimeSync { unix_secs: i64 },
    LowMemory { free_bytes: usize },
    App { name: String },
}

impl EventPayload {
    pub fn bytes(data: impl Into<Arc<[u8]>>) -> Self {
        EventPayload::Bytes(data.into())
    }

    /// Length in bytes of an opaque payload, `0` for every structured variant.
    pub fn len(&self) -> usize {
        match self {
            EventPayload::Bytes(b) => b.len(),
            EventPayload::Text(s) => s.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, EventPayload::None) || self.len() == 0
    }
}

/// A transient message delivered by the event bus dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub payload: EventPayload,
    /// Milliseconds since the kernel clock epoch, taken at enqueue time.
    pub timestamp_ms: u64,
}

impl Event {
    pub fn new(event_type: EventType, payload: EventPayload, timestamp_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            payload,
            timestamp_ms,
        }
    }
}

/// Opaque subscriber context handed back to an event handler.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Kernel-wide error type shared by the registry, the event bus and every
/// collaborator hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Service '{service}' is not allowed: requires {required:?}")]
    NotAllowed {
        service: String,
        required: Permissions,
    },

    #[error("Security violation: permission tampering detected for '{0}'")]
    SecurityViolation(String),

    #[error("Operation failed: {0}")]
    Failed(String),
}

impl KernelError {
    /// `true` for lock or queue waits that expired; callers may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, KernelError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_roundtrip_through_catalogue() {
        let all = [
            EventType::Any,
            EventType::WifiGotIp,
            EventType::BtDisconnected,
            EventType::InputCenter,
            EventType::DisplayTouch,
            EventType::AudioRecordDone,
            EventType::SystemWatchdog,
            EventType::AppStopped,
            EventType::Custom(0),
            EventType::Custom(42),
        ];
        for ty in all {
            assert_eq!(EventType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(EventType::InputUp.code(), 300);
        assert_eq!(EventType::Custom(7).code(), 1007);
    }

    #[test]
    fn unassigned_codes_are_rejected() {
        assert_eq!(EventType::from_code(1), None);
        assert_eq!(EventType::from_code(104), None);
        assert_eq!(EventType::from_code(999), None);
    }

    #[test]
    fn wildcard_matches_everything_specific_matches_itself() {
        assert!(EventType::Any.matches(EventType::WifiConnected));
        assert!(EventType::Any.matches(EventType::Custom(3)));
        assert!(EventType::InputUp.matches(EventType::InputUp));
        assert!(!EventType::InputUp.matches(EventType::InputDown));
        assert!(!EventType::Custom(1).matches(EventType::Custom(2)));
    }

    #[test]
    fn categories_follow_code_ranges() {
        assert_eq!(EventType::WifiScanDone.category(), EventCategory::Network);
        assert_eq!(EventType::BtConnected.category(), EventCategory::Radio);
        assert_eq!(EventType::InputLeft.category(), EventCategory::Input);
        assert_eq!(EventType::SystemLowMemory.category(), EventCategory::System);
        assert_eq!(EventType::Custom(9).category(), EventCategory::User);
    }

    #[test]
    fn permissions_parse_from_text() {
        let perms: Permissions = serde_json::from_str("\"WIFI | NETWORK\"").unwrap();
        assert_eq!(perms, Permissions::WIFI | Permissions::NETWORK);
        assert!(perms.contains(Permissions::WIFI));
        assert!(!perms.contains(Permissions::BLUETOOTH));
    }

    #[test]
    fn all_contains_every_named_bit() {
        for (_, flag) in Permissions::all().iter_names() {
            assert!(Permissions::ALL.contains(flag));
        }
        assert_eq!(Permissions::ALL.bits(), u32::MAX);
    }

    #[test]
    fn payload_len_reports_opaque_bytes_only() {
        assert_eq!(EventPayload::bytes(vec![1u8, 2, 3]).len(), 3);
        assert_eq!(EventPayload::ScanResults { count: 4 }.len(), 0);
        assert!(EventPayload::None.is_empty());
    }

    #[test]
    fn not_allowed_display_names_service() {
        let err = KernelError::NotAllowed {
            service: "wifi".into(),
            required: Permissions::BLUETOOTH,
        };
        assert!(err.to_string().contains("wifi"));
        assert!(KernelError::Timeout("registry lock".into()).is_timeout());
    }
}
