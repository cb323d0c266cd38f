use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Exclusive hold on one application for the duration of a submission.
///
/// Dropping the lease releases it.
#[derive(Debug)]
pub struct ApplicationLease {
    pub application_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

/// Hands out at most one live lease per application within this process.
#[derive(Debug, Default, Clone)]
pub struct LeaseRegistry {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns `None` when another holder already owns the application.
    pub fn try_acquire(&self, id: Uuid) -> Option<ApplicationLease> {
        let guard = self.lock_for(id).try_lock_owned().ok()?;
        Some(ApplicationLease {
            application_id: id,
            _guard: guard,
        })
    }

    /// Waits until the application is free.
    pub async fn acquire(&self, id: Uuid) -> ApplicationLease {
        let guard = self.lock_for(id).lock_owned().await;
        ApplicationLease {
            application_id: id,
            _guard: guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lease_is_refused_while_first_is_held() {
        let registry = LeaseRegistry::new();
        let id = Uuid::new_v4();
        let first = registry.try_acquire(id).unwrap();
        assert!(registry.try_acquire(id).is_none());
        drop(first);
        assert!(registry.try_acquire(id).is_some());
    }

    #[test]
    fn test_leases_are_per_application() {
        let registry = LeaseRegistry::new();
        let _a = registry.try_acquire(Uuid::new_v4()).unwrap();
        assert!(registry.try_acquire(Uuid::new_v4()).is_some());
    }
}
