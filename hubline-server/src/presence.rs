//! Roster and visitor-count broadcasts.
//!
//! Every registry change publishes a full snapshot to every connection that
//! wants presence. Snapshots are computed and queued under one lock, so on
//! any connection a newer snapshot never arrives before an older one.

use std::sync::Arc;

use hubline_sdk::protocol::{OnlineUser, ServerEvent};
use parking_lot::Mutex;

use crate::registry::{ClientConnection, ConnectionRegistry};

pub struct PresenceReporter {
    registry: Arc<ConnectionRegistry>,
    publish_lock: Mutex<()>,
}

impl PresenceReporter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            publish_lock: Mutex::new(()),
        }
    }

    /// Online users (sorted by identity) and the visitor count.
    pub fn roster(&self) -> (Vec<OnlineUser>, usize) {
        let online = self
            .registry
            .online_roster()
            .into_iter()
            .map(|(id, clients)| OnlineUser { id, clients })
            .collect();
        (online, self.registry.visitor_count())
    }

    pub fn snapshot(&self) -> ServerEvent {
        let (online, visitor_count) = self.roster();
        ServerEvent::PresenceUpdated {
            online,
            visitor_count,
        }
    }

    /// Bring a single connection up to date, e.g. after it opts back in.
    pub fn send_snapshot(&self, conn: &ClientConnection) -> bool {
        let _guard = self.publish_lock.lock();
        match self.snapshot().to_frame_json() {
            Ok(json) => conn.push(Arc::new(json)),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode presence snapshot");
                false
            }
        }
    }

    /// Push a fresh snapshot to interested connections. Returns how many
    /// connections it was queued to.
    pub fn publish(&self) -> usize {
        let _guard = self.publish_lock.lock();
        let frame = match self.snapshot().to_frame_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode presence snapshot");
                return 0;
            }
        };

        let mut delivered = 0;
        for conn in self.registry.all_connections() {
            if conn.wants_presence() && conn.push(Arc::clone(&frame)) {
                delivered += 1;
            }
        }
        tracing::debug!(delivered, "presence published");
        delivered
    }
}
