//! Cross-agent delivery seam.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{AgentId, ContextEvent, TesseraError, TesseraResult};
use tracing::debug;

/// Delivers events to remote agents. A failed delivery is reported, never retried.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn deliver(&self, agent_id: AgentId, event: ContextEvent) -> TesseraResult<()>;
}

pub type SharedTransport = Arc<dyn AgentTransport>;

#[derive(Default)]
struct Mailboxes {
    inbox: DashMap<AgentId, Vec<ContextEvent>>,
    unreachable: DashSet<AgentId>,
    latency_ms: AtomicU64,
}

/// In-process transport: each agent has a mailbox. Agents can be marked
/// unreachable and a delivery latency can be injected.
#[derive(Clone, Default)]
pub struct MailboxTransport {
    inner: Arc<Mailboxes>,
}

impl std::fmt::Debug for MailboxTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxTransport")
            .field("mailboxes", &self.inner.inbox.len())
            .field("unreachable", &self.inner.unreachable.len())
            .finish()
    }
}

impl MailboxTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, agent_id: AgentId, unreachable: bool) {
        if unreachable {
            self.inner.unreachable.insert(agent_id);
        } else {
            self.inner.unreachable.remove(&agent_id);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Events delivered to `agent_id` so far, oldest first.
    pub fn received(&self, agent_id: AgentId) -> Vec<ContextEvent> {
        self.inner
            .inbox
            .get(&agent_id)
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Take and clear the agent's mailbox.
    pub fn drain(&self, agent_id: AgentId) -> Vec<ContextEvent> {
        self.inner
            .inbox
            .remove(&agent_id)
            .map(|(_, events)| events)
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentTransport for MailboxTransport {
    async fn deliver(&self, agent_id: AgentId, event: ContextEvent) -> TesseraResult<()> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.unreachable.contains(&agent_id) {
            return Err(TesseraError::storage(
                "mailbox",
                format!("agent {} unreachable", agent_id),
            ));
        }
        debug!(agent_id = %agent_id, event_type = %event.event_type, "event delivered");
        self.inner.inbox.entry(agent_id).or_default().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{new_entity_id, ErrorKind, EventType};

    #[tokio::test]
    async fn test_deliver_and_drain() {
        let transport = MailboxTransport::new();
        let agent = new_entity_id();
        transport
            .deliver(agent, ContextEvent::for_agent(EventType::SyncCompleted, agent))
            .await
            .unwrap();
        assert_eq!(transport.received(agent).len(), 1);
        assert_eq!(transport.drain(agent).len(), 1);
        assert!(transport.received(agent).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_agent_fails() {
        let transport = MailboxTransport::new();
        let agent = new_entity_id();
        transport.set_unreachable(agent, true);
        let err = transport
            .deliver(agent, ContextEvent::new(EventType::SyncCompleted))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(transport.received(agent).is_empty());

        transport.set_unreachable(agent, false);
        transport
            .deliver(agent, ContextEvent::new(EventType::SyncCompleted))
            .await
            .unwrap();
    }
}
