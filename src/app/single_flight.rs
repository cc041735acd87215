use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Single-slot guard: at most one holder at a time, contenders are turned
/// away instead of queued. The slot frees itself when the permit drops.
#[derive(Debug, Clone)]
pub struct SingleFlight {
    semaphore: Arc<Semaphore>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn try_enter(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub fn is_active(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_refused_until_release() {
        let guard = SingleFlight::new();
        assert!(!guard.is_active());

        let permit = guard.try_enter().unwrap();
        assert!(guard.is_active());
        assert!(guard.try_enter().is_none());

        drop(permit);
        assert!(!guard.is_active());
        assert!(guard.try_enter().is_some());
    }

    #[test]
    fn clones_share_the_slot() {
        let guard = SingleFlight::new();
        let other = guard.clone();
        let _permit = guard.try_enter().unwrap();
        assert!(other.is_active());
        assert!(other.try_enter().is_none());
    }
}
