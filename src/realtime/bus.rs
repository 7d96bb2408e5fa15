use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};
use uuid::Uuid;

use super::broker::RoomBroker;
use super::events::RoomEvent;
use super::registry::{ConnectionHandle, RoomRegistry};

/// Publish/subscribe fabric for project rooms.
///
/// `publish` serializes an event once, fans it out to local room members in
/// publish order, and forwards an origin-tagged envelope through the broker
/// so sessions held by other process instances receive it too. Frames coming
/// back from the broker with our own origin are dropped, keeping delivery
/// at-most-once per connection per publish.
pub struct EventBus {
    registry: Arc<RoomRegistry>,
    broker: Arc<dyn RoomBroker>,
    /// Identifies this process instance in broker envelopes.
    origin: Uuid,
    /// One relay task per room with local members.
    relays: DashMap<Uuid, tokio::task::JoinHandle<()>>,
}

/// What actually travels over the broker: the serialized frame plus the
/// publishing instance's id.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    frame: String,
}

fn topic(room: Uuid) -> String {
    format!("project_{}", room)
}

impl EventBus {
    pub fn new(registry: Arc<RoomRegistry>, broker: Arc<dyn RoomBroker>) -> Self {
        Self {
            registry,
            broker,
            origin: Uuid::new_v4(),
            relays: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Attach a connection to a room, starting the room's broker relay when
    /// this is its first local member.
    pub fn join(&self, room: Uuid, handle: ConnectionHandle) {
        if self.registry.join(room, handle) {
            self.spawn_relay(room);
        }
    }

    /// Detach a connection. Idempotent. When the room has no local members
    /// left (whether removed here or pruned earlier during fan-out), its
    /// broker relay is stopped.
    pub fn leave(&self, room: Uuid, connection_id: Uuid) {
        self.registry.leave(room, connection_id);
        if !self.registry.contains(room)
            && let Some((_, task)) = self.relays.remove(&room)
        {
            task.abort();
        }
    }

    /// Broadcast an event to a room. Best-effort on every leg: serialization
    /// failures are logged and dropped, local fan-out prunes dead
    /// connections, and the broker forward is fire-and-forget.
    pub fn publish(&self, room: Uuid, event: &RoomEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%room, error = %err, "failed to serialize room event");
                return;
            }
        };

        let delivered = self.registry.deliver(room, &frame);
        trace!(%room, delivered, "fanned out room event");

        let payload = match serde_json::to_string(&Envelope {
            origin: self.origin,
            frame,
        }) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%room, error = %err, "failed to serialize broker envelope");
                return;
            }
        };
        let broker = Arc::clone(&self.broker);
        let topic = topic(room);
        tokio::spawn(async move {
            if let Err(err) = broker.publish(&topic, payload).await {
                warn!(topic, error = %err, "cross-process publish failed");
            }
        });
    }

    fn spawn_relay(&self, room: Uuid) {
        let registry = Arc::clone(&self.registry);
        let broker = Arc::clone(&self.broker);
        let origin = self.origin;
        let task = tokio::spawn(async move {
            let topic = topic(room);
            let mut subscription = match broker.subscribe(&topic).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(topic, error = %err, "broker subscription failed; room is process-local");
                    return;
                }
            };
            while let Some(payload) = subscription.recv().await {
                match serde_json::from_str::<Envelope>(&payload) {
                    Ok(envelope) if envelope.origin != origin => {
                        registry.deliver(room, &envelope.frame);
                    }
                    Ok(_) => {} // our own publish, already delivered locally
                    Err(err) => {
                        warn!(topic, error = %err, "dropping malformed broker envelope");
                    }
                }
            }
        });
        if let Some(stale) = self.relays.insert(room, task) {
            stale.abort();
        }
    }
}
