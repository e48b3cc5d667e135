//! Tessera Events - Event Bus
//!
//! Publishes lifecycle, sharing and synchronization events to subscribers.
//!
//! # Delivery
//!
//! - `publish` never awaits; each subscriber owns an unbounded FIFO queue.
//! - A subscriber sees events in publish order. Publishers that need
//!   per-context ordering publish while holding that context's guard.
//! - Handler failures are logged and counted; they never reach the publisher.
//! - A bounded history of recent events is kept for inspection.

mod bus;
mod handler;

pub use bus::{BusStats, EventBus, EventSelector};
pub use handler::{handler_fn, EventHandler, FnHandler, SharedHandler};

pub use tessera_core::{ContextEvent, EventType, EventTypeFilter};
