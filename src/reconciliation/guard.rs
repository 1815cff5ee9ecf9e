use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Payment ids currently being worked on by this process.
///
/// First line of the concurrency guard: cheap and process-local. The
/// persisted `processing` lock covers everything this cannot see.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    ids: Mutex<HashSet<i64>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the payment is already marked
    pub fn try_mark(&self, payment_id: i64) -> bool {
        self.ids.lock().insert(payment_id)
    }

    pub fn release(&self, payment_id: i64) {
        self.ids.lock().remove(&payment_id);
    }

    pub fn contains(&self, payment_id: i64) -> bool {
        self.ids.lock().contains(&payment_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    pub fn clear(&self) {
        self.ids.lock().clear();
    }

    /// Mark that is released when dropped
    pub fn claim(self: &Arc<Self>, payment_id: i64) -> Option<InFlightClaim> {
        if self.try_mark(payment_id) {
            Some(InFlightClaim {
                registry: Arc::clone(self),
                payment_id,
            })
        } else {
            None
        }
    }
}

pub struct InFlightClaim {
    registry: Arc<InFlightRegistry>,
    payment_id: i64,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.registry.release(self.payment_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_is_exclusive() {
        let registry = InFlightRegistry::new();
        assert!(registry.try_mark(7));
        assert!(!registry.try_mark(7));
        assert!(registry.try_mark(8));

        registry.release(7);
        assert!(registry.try_mark(7));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_claim_releases_on_drop() {
        let registry = Arc::new(InFlightRegistry::new());
        {
            let _claim = registry.claim(3).unwrap();
            assert!(registry.contains(3));
            assert!(registry.claim(3).is_none());
        }
        assert!(!registry.contains(3));
    }
}
