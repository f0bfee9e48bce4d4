//! Request id generation and in-flight bookkeeping
//!
//! A request id correlates a stream with its stop signal on the server. Ids are
//! random integers in `[1, 9_999_999]`; the registry guarantees that no id is
//! used by two open requests at once.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use trtllm_common::{Result, TrtLlmError};

/// Largest generated request id
pub const MAX_REQUEST_ID: u64 = 9_999_999;

/// Source of request ids
pub trait RequestIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Uniformly random ids in `[1, MAX_REQUEST_ID]`
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomRequestIds;

impl RequestIdGenerator for RandomRequestIds {
    fn next_id(&self) -> String {
        rand::thread_rng().gen_range(1..=MAX_REQUEST_ID).to_string()
    }
}

/// Deterministic ids counting up from a starting value
#[derive(Debug)]
pub struct SequentialRequestIds {
    next: AtomicU64,
}

impl SequentialRequestIds {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl RequestIdGenerator for SequentialRequestIds {
    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Set of request ids currently in flight
#[derive(Debug, Default)]
pub struct RequestRegistry {
    in_flight: Mutex<HashSet<String>>,
}

impl RequestRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `request_id`; `None` if it is already in flight
    pub fn reserve(self: &Arc<Self>, request_id: &str) -> Option<RequestLease> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(request_id.to_string()) {
            return None;
        }

        Some(RequestLease {
            registry: Arc::clone(self),
            request_id: request_id.to_string(),
        })
    }

    /// Claim a fresh id from `ids`, drawing again on collision
    pub fn reserve_generated(
        self: &Arc<Self>,
        ids: &dyn RequestIdGenerator,
    ) -> Result<RequestLease> {
        const MAX_ATTEMPTS: usize = 16;

        for _ in 0..MAX_ATTEMPTS {
            if let Some(lease) = self.reserve(&ids.next_id()) {
                return Ok(lease);
            }
        }

        Err(TrtLlmError::internal(format!(
            "could not find a free request id after {} attempts",
            MAX_ATTEMPTS
        )))
    }

    /// Number of requests currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Exclusive claim on a request id, released on drop
#[derive(Debug)]
pub struct RequestLease {
    registry: Arc<RequestRegistry>,
    request_id: String,
}

impl RequestLease {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for RequestLease {
    fn drop(&mut self) {
        self.registry.in_flight.lock().remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_in_range() {
        let ids = RandomRequestIds;
        for _ in 0..1000 {
            let id: u64 = ids.next_id().parse().unwrap();
            assert!((1..=MAX_REQUEST_ID).contains(&id));
        }
    }

    #[test]
    fn test_reserve_rejects_in_flight_id() {
        let registry = RequestRegistry::new();

        let lease = registry.reserve("42").unwrap();
        assert!(registry.reserve("42").is_none());
        assert_eq!(registry.in_flight(), 1);

        drop(lease);
        assert_eq!(registry.in_flight(), 0);
        assert!(registry.reserve("42").is_some());
    }

    #[test]
    fn test_reserve_generated_skips_collisions() {
        let registry = RequestRegistry::new();
        let ids = SequentialRequestIds::starting_at(1);

        let _held = registry.reserve("2").unwrap();
        let first = registry.reserve_generated(&ids).unwrap();
        let second = registry.reserve_generated(&ids).unwrap();

        assert_eq!(first.request_id(), "1");
        assert_eq!(second.request_id(), "3");
    }

    struct ConstantIds;

    impl RequestIdGenerator for ConstantIds {
        fn next_id(&self) -> String {
            "7".to_string()
        }
    }

    #[test]
    fn test_reserve_generated_gives_up() {
        let registry = RequestRegistry::new();
        let _held = registry.reserve("7").unwrap();
        assert!(registry.reserve_generated(&ConstantIds).is_err());
    }
}
