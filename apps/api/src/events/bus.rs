use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use super::messages::ServerEvent;

/// Per-session queue depth. A session that falls this far behind loses
/// events rather than stalling publishers.
const SESSION_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    User(Uuid),
    Recruiter(Uuid),
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::User(id) => write!(f, "user:{id}"),
            Group::Recruiter(id) => write!(f, "recruiter:{id}"),
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ServerEvent>,
}

type Registry = Mutex<HashMap<Group, Vec<Subscriber>>>;

/// At-most-once fan-out to currently connected sessions. No replay.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

/// A live session's registration. Dropping it unsubscribes.
pub struct Subscription {
    registry: Arc<Registry>,
    group: Group,
    id: u64,
    pub rx: mpsc::Receiver<ServerEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut groups = match self.registry.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(subs) = groups.get_mut(&self.group) {
            subs.retain(|s| s.id != self.id);
            if subs.is_empty() {
                groups.remove(&self.group);
            }
        }
        debug!(group = %self.group, session = self.id, "Session unsubscribed");
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, group: Group) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        self.lock().entry(group).or_default().push(Subscriber { id, tx });
        debug!(%group, session = id, "Session subscribed");
        Subscription {
            registry: self.registry.clone(),
            group,
            id,
            rx,
        }
    }

    /// Delivers to every session in `group`; returns how many accepted it.
    pub fn publish(&self, group: Group, event: ServerEvent) -> usize {
        let mut groups = self.lock();
        let Some(subs) = groups.get_mut(&group) else {
            return 0;
        };
        let mut delivered = 0;
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(%group, session = sub.id, kind = event.kind(), "Session lagging; event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Sends to the candidate and, when the posting has one, its recruiter.
    pub fn publish_application(&self, candidate_id: Uuid, recruiter_id: Option<Uuid>, event: ServerEvent) {
        let kind = event.kind();
        let mut delivered = 0;
        if let Some(recruiter) = recruiter_id {
            delivered += self.publish(Group::Recruiter(recruiter), event.clone());
        }
        delivered += self.publish(Group::User(candidate_id), event);
        debug!(%candidate_id, kind, delivered, "Event published");
    }

    pub fn session_count(&self, group: Group) -> usize {
        self.lock().get(&group).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Group, Vec<Subscriber>>> {
        match self.registry.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
