//! `kraken-kernel` – Services, Permissions & Orchestration
//!
//! The kernel does no work of its own. It keeps track of which services
//! exist, what they are allowed to do, and wires them together through the
//! event bus.
//!
//! # Modules
//!
//! - [`capability_verifier`] – FNV-style checksum binding a service name to
//!   its [`Permissions`][kraken_types::Permissions]; a mismatch means the
//!   mask was tampered with and every query against it is denied.
//! - [`service_registry`] – [`ServiceRegistry`][service_registry::ServiceRegistry]:
//!   the fixed-capacity table of named services, their `init`/`deinit`
//!   lifecycle and permission queries.
//! - [`context`] – who is calling: the task-local current-service marker
//!   visible inside lifecycle hooks, and the
//!   [`CapabilityToken`][context::CapabilityToken] a service keeps for its
//!   long-running tasks.
//! - [`kernel`] – [`Kernel`][kernel::Kernel]: the cloneable handle that owns
//!   the registry and the [`EventBus`][kraken_middleware::EventBus] between
//!   `init` and `deinit`.
//! - [`timer`] – [`SoftTimer`][timer::SoftTimer] and [`delay_ms`].
//! - [`config`] – [`KernelConfig`][config::KernelConfig].

pub mod capability_verifier;
pub mod config;
pub mod context;
pub mod kernel;
pub mod service_registry;
pub mod timer;

pub use config::KernelConfig;
pub use context::{CapabilityToken, ServiceContext, current_service};
pub use kernel::Kernel;
pub use service_registry::{
    HookFuture, ServiceHook, ServiceInfo, ServiceRegistry, ServiceState, hook,
};
pub use timer::{SoftTimer, TimerCallback, delay_ms};
