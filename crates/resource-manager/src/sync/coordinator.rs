//! Sync group protocol

use crate::service::{AllocatedValue, AllocationResult, IdPoolSlot, Response};
use crate::Error;

/// Drives one synchronized request over its group
///
/// The origin pool is the one the request arrived at; it also serves as
/// the anchor that draws trial values when no member has a value yet.
pub struct SyncCoordinator<'a> {
    key: &'a str,
    origin: &'a mut IdPoolSlot,
    peers: Vec<&'a mut IdPoolSlot>,
}

impl<'a> SyncCoordinator<'a> {
    pub fn new(key: &'a str, origin: &'a mut IdPoolSlot, peers: Vec<&'a mut IdPoolSlot>) -> Self {
        Self { key, origin, peers }
    }

    /// Number of pools in the group
    pub fn group_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Run the protocol, returning one result per member that was answered
    pub fn run(self) -> Vec<AllocationResult> {
        tracing::debug!(
            key = %self.key,
            origin = %self.origin.name(),
            members = self.group_size(),
            "Resolving sync group"
        );

        if let Some(err) = self.conflicting_request() {
            return self.abort(err);
        }

        if let Some(value) = self.held_value() {
            return self.spread(value);
        }

        if let Some(value) = self.requested_value() {
            return self.spread(value);
        }

        self.trial()
    }

    fn members(&self) -> Vec<&IdPoolSlot> {
        std::iter::once(&*self.origin)
            .chain(self.peers.iter().map(|p| &**p))
            .collect()
    }

    fn members_mut(&mut self) -> Vec<&mut IdPoolSlot> {
        std::iter::once(&mut *self.origin)
            .chain(self.peers.iter_mut().map(|p| &mut **p))
            .collect()
    }

    /// Two members explicitly asking for different ids
    fn conflicting_request(&self) -> Option<Error> {
        let mut first: Option<u64> = None;
        for member in self.members() {
            let Some(requested) = member.entry(self.key).and_then(|e| e.requested) else {
                continue;
            };
            match first {
                None => first = Some(requested),
                Some(f) if f != requested => {
                    return Some(Error::ConflictingRequest {
                        key: self.key.to_string(),
                        first: f,
                        second: requested,
                    });
                }
                Some(_) => {}
            }
        }
        None
    }

    fn held_value(&self) -> Option<u64> {
        self.members()
            .into_iter()
            .find_map(|m| m.held_value(self.key))
    }

    fn requested_value(&self) -> Option<u64> {
        self.members()
            .into_iter()
            .find_map(|m| m.entry(self.key).and_then(|e| e.requested))
    }

    /// Fail the incoming request; peers keep what they hold
    fn abort(self, err: Error) -> Vec<AllocationResult> {
        tracing::warn!(
            key = %self.key,
            pool = %self.origin.name(),
            error = %err,
            "Conflicting sync requests"
        );
        vec![self.origin.respond(self.key, Response::error(&err))]
    }

    /// Try `value` in every member that does not hold one yet
    fn spread(mut self, value: u64) -> Vec<AllocationResult> {
        let key = self.key;
        self.members_mut()
            .into_iter()
            .map(|member| {
                let response = match member.held_value(key) {
                    Some(held) => Response::ok(AllocatedValue::Id(held)),
                    None => {
                        let result = member.try_value(key, value).map(AllocatedValue::Id);
                        if let Err(e) = &result {
                            tracing::debug!(
                                pool = %member.name(),
                                key = %key,
                                value,
                                error = %e,
                                "Sync value rejected"
                            );
                        }
                        Response::from(result)
                    }
                };
                member.respond(key, response)
            })
            .collect()
    }

    /// Draw candidates from the origin until every peer accepts one
    ///
    /// Rejected candidates stay allocated in the origin so they are not
    /// drawn again, and are released once the loop ends either way.
    fn trial(mut self) -> Vec<AllocationResult> {
        let key = self.key;
        let (strategy, consumer) = match self.origin.entry(key) {
            Some(entry) => (entry.strategy, entry.consumer.clone()),
            None => Default::default(),
        };
        let mut failed: Vec<u64> = Vec::new();

        let outcome = loop {
            let candidate = match self.origin.pool.allocate_with(strategy, &consumer, key) {
                Ok(v) => v,
                Err(e) => break Err(e),
            };

            let mut accepted: Vec<usize> = Vec::new();
            let mut rejected = false;
            for (i, peer) in self.peers.iter_mut().enumerate() {
                match peer.try_value(key, candidate) {
                    Ok(_) => accepted.push(i),
                    Err(_) => {
                        rejected = true;
                        break;
                    }
                }
            }

            if !rejected {
                break Ok(candidate);
            }

            for i in accepted {
                self.peers[i].give_back(candidate);
            }
            tracing::debug!(key = %key, candidate, "Sync candidate rejected, drawing another");
            failed.push(candidate);
        };

        for value in failed {
            self.origin.give_back(value);
        }

        match outcome {
            Ok(value) => {
                tracing::debug!(key = %key, value, "Sync group resolved");
                let response = Response::ok(AllocatedValue::Id(value));
                self.members_mut()
                    .into_iter()
                    .map(|m| m.respond(key, response.clone()))
                    .collect()
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Sync allocation failed");
                let response = Response::error(&e);
                self.members_mut()
                    .into_iter()
                    .map(|m| m.respond(key, response.clone()))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{IdPool, ResourcePool};
    use crate::events::NoopObserver;
    use crate::models::{Consumer, Range};
    use crate::service::{IdRequest, IdRequestEntry};
    use std::sync::Arc;

    fn slot(name: &str, start: u64, end: u64) -> IdPoolSlot {
        IdPoolSlot::new(IdPool::new(name, Range::new(start, end), Arc::new(NoopObserver)))
    }

    fn add_request(slot: &mut IdPoolSlot, key: &str, requested: Option<u64>) {
        let mut request = IdRequest::new(slot.name(), key)
            .consumer(Consumer::new("svc", "admin"))
            .synced();
        request.requested = requested;
        slot.requests
            .insert(key.to_string(), IdRequestEntry::from(&request));
    }

    #[test]
    fn test_trial_skips_rejected_candidates() {
        let mut a = slot("a", 1, 10);
        let mut b = slot("b", 1, 10);
        b.pool
            .allocate_specific(1, &Consumer::default(), "other")
            .unwrap();
        add_request(&mut a, "k", None);
        add_request(&mut b, "k", None);

        let results = SyncCoordinator::new("k", &mut a, vec![&mut b]).run();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.response.id() == Some(2)));
        // rejected candidate went back to the origin
        assert!(a.pool.is_available(1));
        assert_eq!(a.held_value("k"), Some(2));
        assert_eq!(b.held_value("k"), Some(2));
        a.pool.check_invariants().unwrap();
        b.pool.check_invariants().unwrap();
    }

    #[test]
    fn test_trial_exhaustion_reports_everyone() {
        let mut a = slot("a", 1, 2);
        let mut b = slot("b", 1, 2);
        for v in [1, 2] {
            b.pool
                .allocate_specific(v, &Consumer::default(), "other")
                .unwrap();
        }
        add_request(&mut a, "k", None);
        add_request(&mut b, "k", None);

        let results = SyncCoordinator::new("k", &mut a, vec![&mut b]).run();
        assert!(results.iter().all(|r| !r.response.is_ok()));
        assert_eq!(a.pool.available_count(), 2);
    }

    #[test]
    fn test_conflict_answers_only_the_incoming_request() {
        let mut a = slot("a", 1, 10);
        let mut b = slot("b", 1, 10);
        add_request(&mut a, "k", Some(3));
        a.pool.allocate_specific(3, &Consumer::default(), "k").unwrap();
        a.respond("k", Response::ok(AllocatedValue::Id(3)));
        add_request(&mut b, "k", Some(4));

        let results = SyncCoordinator::new("k", &mut b, vec![&mut a]).run();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].pool, "b");
        assert!(matches!(
            results[0].response,
            Response::Error {
                kind: crate::ErrorKind::ConflictingRequest,
                ..
            }
        ));

        // the peer keeps its value and its answer
        assert_eq!(a.held_value("k"), Some(3));
        assert_eq!(b.pool.allocation_count(), 0);
    }

    #[test]
    fn test_existing_value_is_spread() {
        let mut a = slot("a", 1, 10);
        let mut b = slot("b", 1, 10);
        add_request(&mut a, "k", None);
        add_request(&mut b, "k", None);
        a.pool.allocate_specific(7, &Consumer::default(), "k").unwrap();
        a.respond("k", Response::ok(AllocatedValue::Id(7)));

        let results = SyncCoordinator::new("k", &mut b, vec![&mut a]).run();
        assert!(results.iter().all(|r| r.response.id() == Some(7)));
        assert!(b.pool.is_allocated(7));
    }

    #[test]
    fn test_requested_value_rejected_per_member() {
        let mut a = slot("a", 1, 10);
        let mut b = slot("b", 1, 4);
        add_request(&mut a, "k", Some(8));
        add_request(&mut b, "k", None);

        let results = SyncCoordinator::new("k", &mut a, vec![&mut b]).run();
        let a_result = results.iter().find(|r| r.pool == "a").unwrap();
        let b_result = results.iter().find(|r| r.pool == "b").unwrap();
        assert_eq!(a_result.response.id(), Some(8));
        assert!(matches!(
            b_result.response,
            Response::Error {
                kind: crate::ErrorKind::NotAvailable,
                ..
            }
        ));
    }
}
