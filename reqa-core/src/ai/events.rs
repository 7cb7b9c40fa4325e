//! Engine events
//!
//! Status updates (pipeline state, workspace changes, degraded mode) are
//! published through an injected [`EventPublisher`] owned by the engine, so
//! front-ends subscribe to the engine they created instead of process-wide
//! state.

use crate::ai::guard::FabricationKind;
use crate::ai::pipeline::PipelineState;
use serde::Serialize;
use tokio::sync::broadcast;

/// Something observable happened inside the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    StateChanged {
        requirement_id: String,
        state: PipelineState,
    },
    WorkspaceContextChanged {
        context: String,
    },
    WorkspaceResolved {
        context: String,
        slug: String,
        created: bool,
    },
    /// RAG failed and the analysis continued with a direct prompt
    DegradedMode {
        requirement_id: String,
        reason: String,
    },
    TimeoutReached {
        requirement_id: String,
        window: u32,
        waited_secs: u64,
    },
    FabricationFlagged {
        requirement_id: String,
        kind: FabricationKind,
    },
    AnalysisCompleted {
        requirement_id: String,
        from_cache: bool,
        is_analyzed: bool,
    },
    BatchProgress {
        requirement_id: String,
        completed: usize,
        total: usize,
    },
}

/// Receives engine events. Implementations must not block.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: EngineEvent) {}
}

/// Fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: EngineEvent) {
        // no subscribers is not an error
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish(EngineEvent::WorkspaceContextChanged {
            context: "Decagon".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            EngineEvent::WorkspaceContextChanged {
                context: "Decagon".to_string()
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = BroadcastPublisher::default();
        publisher.publish(EngineEvent::WorkspaceContextChanged {
            context: "x".to_string(),
        });
        NullPublisher.publish(EngineEvent::WorkspaceContextChanged {
            context: "x".to_string(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::DegradedMode {
            requirement_id: "REQ-1".to_string(),
            reason: "no workspace".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "degradedMode");
        assert_eq!(json["requirement_id"], "REQ-1");
    }
}
