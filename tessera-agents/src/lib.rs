//! Tessera Agents - Multi-Agent Coordination
//!
//! Agent registry, context sharing, subscriptions and conflict-aware
//! synchronization on top of the strategy engine.

mod coordinator;
mod registry;
mod resolution;
mod transport;

pub use coordinator::{BroadcastReport, DistributedCoordinator, ShareResult, SyncResult};
pub use registry::AgentRegistry;
pub use resolution::{auto_resolve, detect_conflicts, last_writer_wins, settled_value, shallow_merge};
pub use transport::{AgentTransport, MailboxTransport, SharedTransport};
