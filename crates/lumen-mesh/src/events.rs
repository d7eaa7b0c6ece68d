use serde::Serialize;
use tokio::sync::broadcast;

use lumen_common::types::{ControllerId, GroupId};

/// Broadcast capacity; slow receivers lose the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State changes published to UI and other subsystems.
///
/// Delivery is at most once and never replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    /// A controller entered the liveness table.
    HostVisible {
        id: ControllerId,
        hostname: String,
        ip: String,
    },
    /// A controller's ttl ran out.
    HostOffline { id: ControllerId },
    /// A controller was purged from the liveness table.
    HostExpired { id: ControllerId },
    LeadershipChanged { is_leader: bool },
    GroupLeadershipChanged { group_id: GroupId, leading: bool },
}

/// Sending half shared by every component that reports state changes.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<MeshEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Fire and forget. Having no subscribers is not an error.
    pub fn emit(&self, event: MeshEvent) {
        tracing::trace!(?event, "Mesh event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventSink::new().emit(MeshEvent::HostOffline { id: ControllerId(5) });
    }

    #[test]
    fn subscribers_receive_events() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.emit(MeshEvent::LeadershipChanged { is_leader: true });
        assert_eq!(
            rx.try_recv().unwrap(),
            MeshEvent::LeadershipChanged { is_leader: true }
        );
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(MeshEvent::GroupLeadershipChanged {
            group_id: GroupId(2),
            leading: true,
        })
        .unwrap();
        assert_eq!(json["event"], "group_leadership_changed");
        assert_eq!(json["group_id"], 2);
    }
}
