//! `kraken-runtime` – Firmware Boot & Collaborator Services
//!
//! Everything above the kernel: tracing setup, the boot sequence, and the
//! services that run on top of the kernel contract.
//!
//! # Modules
//!
//! - [`boot`] – [`Firmware`][boot::Firmware]: initialises the kernel,
//!   registers and starts the services named in a
//!   [`BootConfig`][boot::BootConfig], spawns the input monitor, and tears
//!   it all down again in reverse.
//! - [`services`] – the [`Service`][services::Service] trait and its four
//!   hardware-free implementations: system (clock sync and input), display
//!   (status bar and menu), Wi-Fi and Bluetooth.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter. Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to ship kernel spans to any
//!   OTLP-compatible collector.

pub mod boot;
pub mod services;
pub mod telemetry;

pub use boot::{BootConfig, Firmware, ServiceSpec};
pub use services::{InputKey, StatusBar};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
