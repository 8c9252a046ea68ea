//! Event bus - pub/sub delivery of agent events
//!
//! Tokio broadcast channels deliver events to all subscribers with minimal
//! latency. The engine emits through a per-run [`EventEmitter`] that stamps
//! run identity and the monotonic sequence number.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{AgentEvent, AgentEventKind};

/// Default channel capacity (events).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Central event bus for agent activity streaming.
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Subscribe to receive events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Create an emitter bound to one run.
    ///
    /// The sequence counter is shared with the run's trace log so that
    /// events and traces interleave on one strictly monotonic series.
    pub fn emitter_for(
        &self,
        agent_id: impl Into<String>,
        parent_agent_id: Option<String>,
        seq: Arc<AtomicU64>,
    ) -> EventEmitter {
        let agent_id = agent_id.into();
        debug!(%agent_id, "EventBus::emitter_for: creating emitter");
        EventEmitter {
            tx: self.tx.clone(),
            agent_id,
            parent_agent_id,
            seq,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Per-run handle for emitting events without owning the bus.
///
/// Cheap to clone; every emitted event carries the run's identity and the
/// next sequence number. Emission is fire-and-forget: with no subscribers
/// the event is dropped.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<AgentEvent>,
    agent_id: String,
    parent_agent_id: Option<String>,
    seq: Arc<AtomicU64>,
}

impl EventEmitter {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Emit one event, stamping identity, timestamp and sequence number.
    pub fn emit(&self, kind: AgentEventKind) {
        let event = AgentEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            agent_id: self.agent_id.clone(),
            parent_agent_id: self.parent_agent_id.clone(),
            at: Utc::now(),
            kind,
        };
        debug!(event_type = event.kind.event_type(), seq = event.seq, "EventEmitter::emit");
        // Ignore send errors (no subscribers is OK)
        let _ = self.tx.send(event);
    }

    /// Emit a status change.
    pub fn status(&self, status: &str, detail: impl Into<String>) {
        self.emit(AgentEventKind::StatusChange {
            status: status.to_string(),
            detail: detail.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_emit_stamps_identity_and_seq() {
        let bus = EventBus::with_default_capacity();
        let mut rx = bus.subscribe();
        let emitter = bus.emitter_for("agent-1", Some("parent-1".to_string()), Arc::new(AtomicU64::new(0)));

        emitter.status("scoping", "classifying task");
        emitter.status("executing", "iteration 1");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].agent_id, "agent-1");
        assert_eq!(events[0].parent_agent_id.as_deref(), Some("parent-1"));
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::with_default_capacity();
        let emitter = bus.emitter_for("agent-1", None, Arc::new(AtomicU64::new(0)));
        // No subscriber: must not panic or error
        emitter.status("executing", "nothing listening");
    }

    #[tokio::test]
    async fn test_shared_seq_across_emitters() {
        let bus = EventBus::with_default_capacity();
        let mut rx = bus.subscribe();
        let seq = Arc::new(AtomicU64::new(0));
        let a = bus.emitter_for("agent-1", None, Arc::clone(&seq));
        let b = a.clone();

        a.status("executing", "a");
        b.status("executing", "b");
        a.status("executing", "c");

        let seqs: Vec<u64> = drain(&mut rx).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}
