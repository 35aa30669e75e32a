use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use matchpoint_types::events::ChatEvent;

/// Fans chat events out to all connected clients and tracks presence.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// All connected clients receive all events; conversation-scoped events
    /// are filtered per connection against its subscriptions.
    broadcast_tx: broadcast::Sender<ChatEvent>,

    /// user_id -> (display name, live connection count). A user may hold
    /// several connections; presence flips only on the first and last.
    online_users: RwLock<HashMap<Uuid, (String, u32)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                online_users: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the event stream. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: ChatEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a connection for a user, announcing them if it is their first.
    pub async fn user_online(&self, user_id: Uuid, display_name: String) {
        let first = {
            let mut users = self.inner.online_users.write().await;
            let entry = users
                .entry(user_id)
                .or_insert_with(|| (display_name.clone(), 0));
            entry.0 = display_name.clone();
            entry.1 += 1;
            entry.1 == 1
        };

        if first {
            self.broadcast(ChatEvent::PresenceUpdate {
                user_id,
                display_name,
                online: true,
            });
        }
    }

    /// Drop one connection for a user, announcing offline when none remain.
    pub async fn user_offline(&self, user_id: Uuid) {
        let gone = {
            let mut users = self.inner.online_users.write().await;
            match users.get_mut(&user_id) {
                Some(entry) => {
                    entry.1 = entry.1.saturating_sub(1);
                    if entry.1 == 0 {
                        users.remove(&user_id).map(|(name, _)| name)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(display_name) = gone {
            self.broadcast(ChatEvent::PresenceUpdate {
                user_id,
                display_name,
                online: false,
            });
        }
    }

    /// Snapshot of who is online.
    pub async fn online_users(&self) -> Vec<(Uuid, String)> {
        self.inner
            .online_users
            .read()
            .await
            .iter()
            .map(|(id, (name, _))| (*id, name.clone()))
            .collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
