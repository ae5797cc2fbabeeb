//! `kraken-middleware` – The Event Bus
//!
//! Decouples event producers from consumers with asynchronous, many-to-many
//! fan-out.
//!
//! # Modules
//!
//! - [`bus`] – [`EventBus`]: the fixed-capacity listener table, the bounded
//!   event queue, and the blocking and interrupt-safe `post` paths.
//! - [`dispatcher`] – the single long-lived task that drains the queue,
//!   snapshots matching listeners under the table lock, releases it, and
//!   then invokes each handler in registration order.

pub mod bus;
pub mod dispatcher;

pub use bus::{BusConfig, EventBus, EventHandler, handler};
