//! Resource Manager Service
//!
//! Core orchestration service for resource pools, providing:
//! - Pool lifecycle from configuration and persisted snapshots
//! - Id and subnet allocation with a per-pool request table
//! - Synchronized id allocation across pools
//! - Reconfiguration with invalidation of affected requests

use super::requests::{
    AllocatedValue, AllocationReport, AllocationResult, IdPoolSlot, IdRequest, IdRequestEntry,
    IpPoolSlot, PoolChange, ReconfigureReport, ReconfigureRequest, ReleaseRequest, Response,
    SubnetRequest, SubnetRequestEntry,
};
use crate::alarm::AlarmState;
use crate::allocator::{
    IdPool, IdPoolSnapshot, IdStrategy, IpAddressPool, IpPoolSnapshot, ResourcePool, SubnetSize,
};
use crate::config::{AlarmConfig, EngineConfig, IdPoolConfig, IpPoolConfig};
use crate::events::{NoopObserver, PoolKind, PoolMessage, PoolObserver};
use crate::models::{Allocation, Consumer, Subnet};
use crate::sync::SyncCoordinator;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Occupancy summary of one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub kind: PoolKind,
    pub total: u128,
    pub available: u128,
    pub allocations: usize,
    pub requests: usize,
    pub alarm: AlarmState,
}

/// Outcome of applying a whole configuration
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// `(pool, key)` pairs whose allocations were released
    pub invalidated: Vec<(String, String)>,
    /// Pools that could not be created or reconfigured
    pub failures: Vec<(String, Error)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Resource Manager - core orchestration service
pub struct ResourceManager {
    /// Receives every pool event
    observer: Arc<dyn PoolObserver>,
    /// Id pools indexed by name
    id_pools: DashMap<String, Arc<RwLock<IdPoolSlot>>>,
    /// Address pools indexed by name
    ip_pools: DashMap<String, Arc<RwLock<IpPoolSlot>>>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    /// Create a manager that discards pool events
    pub fn new() -> Self {
        Self::with_observer(Arc::new(NoopObserver))
    }

    /// Create a manager reporting pool events to `observer`
    pub fn with_observer(observer: Arc<dyn PoolObserver>) -> Self {
        Self {
            observer,
            id_pools: DashMap::new(),
            ip_pools: DashMap::new(),
        }
    }

    fn id_slot(&self, name: &str) -> Result<Arc<RwLock<IdPoolSlot>>> {
        self.id_pools
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    fn ip_slot(&self, name: &str) -> Result<Arc<RwLock<IpPoolSlot>>> {
        self.ip_pools
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    fn ensure_unused(&self, name: &str) -> Result<()> {
        if self.id_pools.contains_key(name) || self.ip_pools.contains_key(name) {
            return Err(Error::PoolAlreadyExists(name.to_string()));
        }
        Ok(())
    }

    // ==================== Pool Operations ====================

    /// Create an id pool from its configuration
    pub fn create_id_pool(&self, config: &IdPoolConfig) -> Result<()> {
        config.validate()?;
        self.ensure_unused(&config.name)?;

        let mut pool = IdPool::new(&config.name, config.range, self.observer.clone());
        for exclude in &config.excludes {
            pool.add_exclude(*exclude);
        }
        pool.configure_alarms(config.alarms.enabled, config.alarms.threshold()?)?;

        let mut slot = IdPoolSlot::new(pool);
        slot.sync_enabled = config.sync;
        self.id_pools
            .insert(config.name.clone(), Arc::new(RwLock::new(slot)));
        Ok(())
    }

    /// Create an address pool from its configuration
    pub fn create_ip_pool(&self, config: &IpPoolConfig) -> Result<()> {
        config.validate()?;
        self.ensure_unused(&config.name)?;

        let mut pool = IpAddressPool::new(&config.name, self.observer.clone());
        for subnet in config.parsed_subnets()? {
            pool.add_subnet(subnet)?;
        }
        for exclude in config.parsed_excludes()? {
            pool.add_exclude(exclude)?;
        }
        pool.configure_alarms(config.alarms.enabled, config.alarms.threshold()?)?;

        self.ip_pools.insert(
            config.name.clone(),
            Arc::new(RwLock::new(IpPoolSlot::new(pool))),
        );
        Ok(())
    }

    /// Recreate an id pool from persisted state
    ///
    /// `requests` is the persisted request table (see [`id_requests`](Self::id_requests)).
    /// Allocations without an entry get one rebuilt from the allocation
    /// record, so held values can still be released and replayed by key.
    pub fn restore_id_pool(
        &self,
        config: &IdPoolConfig,
        snapshot: IdPoolSnapshot,
        mut requests: BTreeMap<String, IdRequestEntry>,
    ) -> Result<()> {
        config.validate()?;
        self.ensure_unused(&config.name)?;

        let mut pool = IdPool::restore(&config.name, snapshot, self.observer.clone())?;
        pool.configure_alarms(config.alarms.enabled, config.alarms.threshold()?)?;

        for a in pool.allocations() {
            requests
                .entry(a.request_id.clone())
                .or_insert_with(|| IdRequestEntry {
                    consumer: a.consumer(),
                    requested: None,
                    strategy: IdStrategy::default(),
                    sync: false,
                    response: Some(Response::ok(AllocatedValue::Id(a.value))),
                    restored: true,
                });
        }
        tracing::info!(
            pool = %config.name,
            requests = requests.len(),
            "Restored id request table"
        );

        let mut slot = IdPoolSlot::new(pool);
        slot.requests = requests;
        slot.sync_enabled = config.sync;
        self.id_pools
            .insert(config.name.clone(), Arc::new(RwLock::new(slot)));
        Ok(())
    }

    /// Recreate an address pool from persisted state
    pub fn restore_ip_pool(
        &self,
        config: &IpPoolConfig,
        snapshot: IpPoolSnapshot,
        mut requests: BTreeMap<String, SubnetRequestEntry>,
    ) -> Result<()> {
        config.validate()?;
        self.ensure_unused(&config.name)?;

        let mut pool = IpAddressPool::restore(&config.name, snapshot, self.observer.clone())?;
        pool.configure_alarms(config.alarms.enabled, config.alarms.threshold()?)?;

        for a in pool.allocations() {
            requests
                .entry(a.request_id.clone())
                .or_insert_with(|| SubnetRequestEntry {
                    consumer: a.consumer(),
                    size: SubnetSize::Prefix(a.value.prefix_len()),
                    requested: None,
                    response: Some(Response::ok(AllocatedValue::Subnet {
                        subnet: a.value,
                        from: pool.origin_of(&a.value),
                    })),
                    restored: true,
                });
        }

        let mut slot = IpPoolSlot::new(pool);
        slot.requests = requests;
        self.ip_pools
            .insert(config.name.clone(), Arc::new(RwLock::new(slot)));
        Ok(())
    }

    /// Remove a pool, clearing its alarms and releasing everything it holds
    pub fn remove_pool(&self, name: &str) -> Result<()> {
        if let Some((_, slot)) = self.id_pools.remove(name) {
            let mut slot = slot.write();
            slot.pool.disable_alarms();
            let released = slot.pool.release_all();
            slot.requests.clear();
            tracing::info!(pool = %name, released = released.len(), "Removed id pool");
        } else if let Some((_, slot)) = self.ip_pools.remove(name) {
            let mut slot = slot.write();
            slot.pool.disable_alarms();
            let released = slot.pool.release_all();
            slot.requests.clear();
            tracing::info!(pool = %name, released = released.len(), "Removed ip pool");
        } else {
            return Err(Error::PoolNotFound(name.to_string()));
        }

        self.observer.notify(PoolMessage::pool_removed(name));
        Ok(())
    }

    /// Names of all id pools, sorted
    pub fn id_pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.id_pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Names of all address pools, sorted
    pub fn ip_pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ip_pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run `f` against an id pool
    pub fn with_id_pool<R>(&self, name: &str, f: impl FnOnce(&IdPool) -> R) -> Result<R> {
        let slot = self.id_slot(name)?;
        let guard = slot.read();
        Ok(f(&guard.pool))
    }

    /// Run `f` against an address pool
    pub fn with_ip_pool<R>(&self, name: &str, f: impl FnOnce(&IpAddressPool) -> R) -> Result<R> {
        let slot = self.ip_slot(name)?;
        let guard = slot.read();
        Ok(f(&guard.pool))
    }

    pub fn id_snapshot(&self, name: &str) -> Result<IdPoolSnapshot> {
        self.with_id_pool(name, |p| p.snapshot())
    }

    pub fn ip_snapshot(&self, name: &str) -> Result<IpPoolSnapshot> {
        self.with_ip_pool(name, |p| p.snapshot())
    }

    /// Request table of an id pool, persisted alongside its snapshot
    pub fn id_requests(&self, name: &str) -> Result<BTreeMap<String, IdRequestEntry>> {
        let slot = self.id_slot(name)?;
        let requests = slot.read().requests.clone();
        Ok(requests)
    }

    /// Request table of an address pool
    pub fn ip_requests(&self, name: &str) -> Result<BTreeMap<String, SubnetRequestEntry>> {
        let slot = self.ip_slot(name)?;
        let requests = slot.read().requests.clone();
        Ok(requests)
    }

    /// Stored response for a request key
    pub fn response(&self, pool: &str, key: &str) -> Result<Option<Response>> {
        if let Ok(slot) = self.id_slot(pool) {
            let slot = slot.read();
            return Ok(slot.requests.get(key).and_then(|e| e.response.clone()));
        }
        let slot = self.ip_slot(pool)?;
        let slot = slot.read();
        Ok(slot.requests.get(key).and_then(|e| e.response.clone()))
    }

    /// Occupancy summary of a pool
    pub fn pool_stats(&self, name: &str) -> Result<PoolStats> {
        if let Ok(slot) = self.id_slot(name) {
            let slot = slot.read();
            return Ok(stats(&slot.pool, PoolKind::Id, slot.requests.len()));
        }
        let slot = self.ip_slot(name)?;
        let slot = slot.read();
        Ok(stats(&slot.pool, PoolKind::Ip, slot.requests.len()))
    }

    // ==================== Allocation Operations ====================

    /// Allocate an id for a request
    ///
    /// Only an unknown pool is an error; allocation failures are reported
    /// in the returned results. Synchronized requests lock every id pool,
    /// in name order, while the group is resolved.
    pub fn allocate_id(&self, request: IdRequest) -> Result<AllocationReport> {
        let origin = self.id_slot(&request.pool)?;

        let sync_enabled = origin.read().sync_enabled;
        if request.sync && sync_enabled {
            drop(origin);
            return self.allocate_id_synced(request);
        }

        let mut slot = origin.write();
        if let Some(report) = replay_id(&mut slot, &request) {
            return Ok(report);
        }

        let result = allocate_one_id(&mut slot, &request.key);
        let notify = notify_list(slot.entry(&request.key).map(|e| e.consumer.clone()));
        Ok(AllocationReport {
            results: vec![result],
            notify,
        })
    }

    fn allocate_id_synced(&self, request: IdRequest) -> Result<AllocationReport> {
        let mut slots: Vec<(String, Arc<RwLock<IdPoolSlot>>)> = self
            .id_pools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        // Group-wide critical section, always locked in name order
        let mut guards: Vec<_> = slots.iter().map(|(_, slot)| slot.write()).collect();

        let origin_index = slots
            .iter()
            .position(|(name, _)| *name == request.pool)
            .ok_or_else(|| Error::PoolNotFound(request.pool.clone()))?;

        if let Some(report) = replay_id(&mut guards[origin_index], &request) {
            return Ok(report);
        }

        let key = request.key.as_str();
        let results = {
            let mut members: Vec<&mut IdPoolSlot> = guards.iter_mut().map(|g| &mut **g).collect();
            let origin = members.swap_remove(origin_index);
            let peers: Vec<&mut IdPoolSlot> = members
                .into_iter()
                .filter(|slot| slot.has_sync_request(key))
                .collect();

            if peers.is_empty() {
                vec![allocate_one_id(origin, key)]
            } else {
                SyncCoordinator::new(key, origin, peers).run()
            }
        };

        let consumers = results.iter().filter_map(|r| {
            guards
                .iter()
                .find(|g| g.name() == r.pool)
                .and_then(|g| g.entry(&r.key))
                .map(|e| e.consumer.clone())
        });
        let notify = notify_list(consumers);
        Ok(AllocationReport { results, notify })
    }

    /// Allocate a subnet for a request
    pub fn allocate_subnet(&self, request: SubnetRequest) -> Result<AllocationReport> {
        let slot = self.ip_slot(&request.pool)?;
        let mut slot = slot.write();

        // Identical request already answered
        let mut entry = SubnetRequestEntry::from(&request);
        let held = slot.held_subnet(&request.key);
        if let Some(existing) = slot.requests.get(&request.key) {
            let same = existing.answers(&entry, held);
            let live = match &existing.response {
                Some(Response::Ok { .. }) => held.is_some(),
                Some(Response::Error { .. }) => true,
                None => false,
            };
            if same && live {
                if let Some(response) = existing.response.clone() {
                    // a restored entry takes on the parameters of the request
                    if existing.restored {
                        entry.response = Some(response.clone());
                        slot.requests.insert(request.key.clone(), entry);
                    }
                    return Ok(AllocationReport {
                        results: vec![AllocationResult {
                            pool: request.pool.clone(),
                            key: request.key.clone(),
                            response,
                        }],
                        notify: Vec::new(),
                    });
                }
            }
        }

        // Request changed: give back what the key held before
        if let Some(held) = held {
            slot.give_back(&held);
        }
        slot.requests.insert(request.key.clone(), entry);

        let consumer = request.consumer.clone();
        let result = match request.requested {
            Some(subnet) => slot
                .pool
                .allocate_specific(subnet, &consumer, &request.key),
            None => slot.pool.allocate_size(request.size, &consumer, &request.key),
        };
        let response = Response::from(result.map(|subnet| AllocatedValue::Subnet {
            subnet,
            from: slot.pool.origin_of(&subnet),
        }));

        if let Some(e) = slot.requests.get_mut(&request.key) {
            e.response = Some(response.clone());
        }
        tracing::debug!(
            pool = %request.pool,
            key = %request.key,
            ok = response.is_ok(),
            "Processed subnet request"
        );

        Ok(AllocationReport {
            results: vec![AllocationResult {
                pool: request.pool,
                key: request.key,
                response,
            }],
            notify: notify_list(std::iter::once(consumer)),
        })
    }

    /// Release whatever a request key holds and forget the request
    ///
    /// Returns the released value, or `None` when the request had failed.
    pub fn release(&self, request: ReleaseRequest) -> Result<Option<AllocatedValue>> {
        if let Ok(slot) = self.id_slot(&request.pool) {
            let mut slot = slot.write();
            let held = slot.held_value(&request.key);
            slot.requests
                .remove(&request.key)
                .ok_or_else(|| Error::RequestNotFound {
                    pool: request.pool.clone(),
                    key: request.key.clone(),
                })?;
            return match held {
                Some(value) => {
                    slot.pool.release(value)?;
                    Ok(Some(AllocatedValue::Id(value)))
                }
                None => Ok(None),
            };
        }

        let slot = self.ip_slot(&request.pool)?;
        let mut slot = slot.write();
        let held = slot.held_subnet(&request.key);
        slot.requests
            .remove(&request.key)
            .ok_or_else(|| Error::RequestNotFound {
                pool: request.pool.clone(),
                key: request.key.clone(),
            })?;
        match held {
            Some(subnet) => {
                let from = slot.pool.origin_of(&subnet);
                slot.pool.release(&subnet)?;
                Ok(Some(AllocatedValue::Subnet { subnet, from }))
            }
            None => Ok(None),
        }
    }

    /// Re-run a stored request, typically after it was invalidated
    pub fn retry(&self, pool: &str, key: &str) -> Result<AllocationReport> {
        let not_found = || Error::RequestNotFound {
            pool: pool.to_string(),
            key: key.to_string(),
        };

        if let Ok(slot) = self.id_slot(pool) {
            let request = {
                let mut slot = slot.write();
                let held = slot.held_value(key);
                let entry = slot.requests.get_mut(key).ok_or_else(not_found)?;
                if held.is_none() {
                    entry.response = None;
                }
                IdRequest {
                    pool: pool.to_string(),
                    key: key.to_string(),
                    consumer: entry.consumer.clone(),
                    requested: entry.requested,
                    strategy: entry.strategy,
                    sync: entry.sync,
                }
            };
            return self.allocate_id(request);
        }

        let slot = self.ip_slot(pool)?;
        let request = {
            let mut slot = slot.write();
            let held = slot.held_subnet(key);
            let entry = slot.requests.get_mut(key).ok_or_else(not_found)?;
            if held.is_none() {
                entry.response = None;
            }
            SubnetRequest {
                pool: pool.to_string(),
                key: key.to_string(),
                consumer: entry.consumer.clone(),
                size: entry.size,
                requested: entry.requested,
            }
        };
        self.allocate_subnet(request)
    }

    // ==================== Reconfiguration ====================

    /// Apply one change to a running pool
    ///
    /// Allocations made invalid by the change are released and their
    /// request keys reported for re-request.
    pub fn reconfigure(&self, request: ReconfigureRequest) -> Result<ReconfigureReport> {
        let invalidated = match self.id_slot(&request.pool) {
            Ok(slot) => {
                let mut slot = slot.write();
                let dropped = reconfigure_id(&mut slot.pool, &request.change)?;
                invalidate(&mut slot.requests, &dropped, |e| &mut e.response)
            }
            Err(_) => {
                let slot = self.ip_slot(&request.pool)?;
                let mut slot = slot.write();
                let dropped = reconfigure_ip(&mut slot.pool, &request.change)?;
                invalidate(&mut slot.requests, &dropped, |e| &mut e.response)
            }
        };

        if !invalidated.is_empty() {
            tracing::info!(
                pool = %request.pool,
                invalidated = invalidated.len(),
                "Reconfiguration invalidated allocations"
            );
        }
        Ok(ReconfigureReport {
            pool: request.pool,
            invalidated,
        })
    }

    /// Reconcile the running pools with a configuration
    ///
    /// New pools are created, existing ones reconfigured, and pools no
    /// longer listed removed. A pool that fails is reported and skipped;
    /// the others are still applied.
    pub fn apply_config(&self, config: &EngineConfig) -> ApplyReport {
        let mut report = ApplyReport::default();
        let duplicates = config.duplicate_names();
        for name in &duplicates {
            tracing::warn!(pool = %name, "Duplicate pool name in configuration");
            report
                .failures
                .push((name.clone(), Error::Config(format!("duplicate pool name {}", name))));
        }

        for pool in config.id_pools.iter().filter(|p| !duplicates.contains(&p.name)) {
            if self.id_pools.contains_key(&pool.name) {
                let (keys, outcome) = self.update_id_pool(pool);
                collect(&mut report, &pool.name, keys, outcome, Placement::Updated);
            } else {
                let outcome = self.create_id_pool(pool);
                collect(&mut report, &pool.name, Vec::new(), outcome, Placement::Created);
            }
        }

        for pool in config.ip_pools.iter().filter(|p| !duplicates.contains(&p.name)) {
            if self.ip_pools.contains_key(&pool.name) {
                let (keys, outcome) = self.update_ip_pool(pool);
                collect(&mut report, &pool.name, keys, outcome, Placement::Updated);
            } else {
                let outcome = self.create_ip_pool(pool);
                collect(&mut report, &pool.name, Vec::new(), outcome, Placement::Created);
            }
        }

        let wanted: BTreeSet<&str> = config
            .id_pools
            .iter()
            .map(|p| p.name.as_str())
            .chain(config.ip_pools.iter().map(|p| p.name.as_str()))
            .collect();
        let stale: Vec<String> = self
            .id_pool_names()
            .into_iter()
            .chain(self.ip_pool_names())
            .filter(|name| !wanted.contains(name.as_str()))
            .collect();
        for name in stale {
            if self.remove_pool(&name).is_ok() {
                report.removed.push(name);
            }
        }

        tracing::info!(
            created = report.created.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            failed = report.failures.len(),
            "Applied configuration"
        );
        report
    }

    /// Keys whose allocations were dropped, and whether the update completed
    ///
    /// Keys are reported even when a later step fails, since the
    /// allocations are already gone from the pool.
    fn update_id_pool(&self, config: &IdPoolConfig) -> (Vec<String>, Result<()>) {
        let slot = match config.validate().and_then(|()| self.id_slot(&config.name)) {
            Ok(slot) => slot,
            Err(e) => return (Vec::new(), Err(e)),
        };
        let mut slot = slot.write();
        slot.sync_enabled = config.sync;

        let mut dropped = slot.pool.set_bounds(config.range);
        let wanted: BTreeSet<_> = config.excludes.iter().copied().collect();
        let current: BTreeSet<_> = slot.pool.excludes().copied().collect();
        for stale in current.difference(&wanted) {
            slot.pool.remove_exclude(*stale);
        }
        for fresh in wanted.difference(&current) {
            dropped.extend(slot.pool.add_exclude(*fresh));
        }
        let outcome = apply_alarms(&mut slot.pool, &config.alarms);

        let keys = invalidate(&mut slot.requests, &dropped, |e| &mut e.response);
        (keys, outcome)
    }

    fn update_ip_pool(&self, config: &IpPoolConfig) -> (Vec<String>, Result<()>) {
        let target = config.validate().and_then(|()| {
            let subnets: BTreeSet<Subnet> = config.parsed_subnets()?.into_iter().collect();
            let excludes: BTreeSet<Subnet> = config.parsed_excludes()?.into_iter().collect();
            Ok((subnets, excludes, self.ip_slot(&config.name)?))
        });
        let (subnets, excludes, slot) = match target {
            Ok(target) => target,
            Err(e) => return (Vec::new(), Err(e)),
        };
        let mut slot = slot.write();

        let mut dropped = Vec::new();
        let outcome = reshape_ip_pool(&mut slot.pool, &subnets, &excludes, &mut dropped)
            .and_then(|()| apply_alarms(&mut slot.pool, &config.alarms));

        let keys = invalidate(&mut slot.requests, &dropped, |e| &mut e.response);
        (keys, outcome)
    }
}

// ==================== Helpers ====================

fn stats<P: ResourcePool>(pool: &P, kind: PoolKind, requests: usize) -> PoolStats {
    PoolStats {
        name: pool.name().to_string(),
        kind,
        total: pool.total_size(),
        available: pool.available_count(),
        allocations: pool.allocation_count(),
        requests,
        alarm: pool.alarm_policy().state(),
    }
}

/// Stored answer for an identical, still valid request
///
/// A changed request releases what the key held and replaces the entry;
/// `None` means the request must be processed.
fn replay_id(slot: &mut IdPoolSlot, request: &IdRequest) -> Option<AllocationReport> {
    let mut entry = IdRequestEntry::from(request);
    let held = slot.held_value(&request.key);
    if let Some(existing) = slot.requests.get(&request.key) {
        let same = existing.answers(&entry, held);
        let live = match &existing.response {
            Some(Response::Ok { .. }) => held.is_some(),
            Some(Response::Error { .. }) => true,
            None => false,
        };
        if same && live {
            let response = existing.response.clone()?;
            // a restored entry takes on the parameters of the request
            if existing.restored {
                entry.response = Some(response.clone());
                slot.requests.insert(request.key.clone(), entry);
            }
            tracing::debug!(pool = %request.pool, key = %request.key, "Request already processed");
            return Some(AllocationReport {
                results: vec![AllocationResult {
                    pool: request.pool.clone(),
                    key: request.key.clone(),
                    response,
                }],
                notify: Vec::new(),
            });
        }
    }

    if let Some(held) = held {
        slot.give_back(held);
    }
    slot.requests.insert(request.key.clone(), entry);
    None
}

/// Plain allocation for the stored request `key`
fn allocate_one_id(slot: &mut IdPoolSlot, key: &str) -> AllocationResult {
    let (requested, strategy, consumer) = match slot.entry(key) {
        Some(e) => (e.requested, e.strategy, e.consumer.clone()),
        None => (None, IdStrategy::default(), Consumer::default()),
    };
    let result = match requested {
        Some(value) => slot.pool.allocate_specific(value, &consumer, key),
        None => slot.pool.allocate_with(strategy, &consumer, key),
    };
    tracing::debug!(
        pool = %slot.name(),
        key = %key,
        ok = result.is_ok(),
        "Processed id request"
    );
    slot.respond(key, Response::from(result.map(AllocatedValue::Id)))
}

fn reconfigure_id(pool: &mut IdPool, change: &PoolChange) -> Result<Vec<Allocation<u64>>> {
    match change {
        PoolChange::Bounds(range) => Ok(pool.set_bounds(*range)),
        PoolChange::Exclude(range) => Ok(pool.add_exclude(*range)),
        PoolChange::Unexclude(range) => {
            pool.remove_exclude(*range);
            Ok(Vec::new())
        }
        PoolChange::Alarms(alarms) => {
            apply_alarms(pool, alarms)?;
            Ok(Vec::new())
        }
        other => Err(Error::Config(format!(
            "{:?} does not apply to id pool {}",
            other,
            pool.name()
        ))),
    }
}

fn reconfigure_ip(pool: &mut IpAddressPool, change: &PoolChange) -> Result<Vec<Allocation<Subnet>>> {
    match change {
        PoolChange::AddSubnet(subnet) => {
            pool.add_subnet(*subnet)?;
            Ok(Vec::new())
        }
        PoolChange::RemoveSubnet(subnet) => pool.remove_subnet(subnet),
        PoolChange::ExcludeSubnet(subnet) => pool.add_exclude(*subnet),
        PoolChange::UnexcludeSubnet(subnet) => {
            pool.remove_exclude(subnet)?;
            Ok(Vec::new())
        }
        PoolChange::Alarms(alarms) => {
            apply_alarms(pool, alarms)?;
            Ok(Vec::new())
        }
        other => Err(Error::Config(format!(
            "{:?} does not apply to ip pool {}",
            other,
            pool.name()
        ))),
    }
}

/// Move an address pool to the given subnets and excludes
///
/// Allocations released on the way land in `dropped` even if a later
/// step fails.
fn reshape_ip_pool(
    pool: &mut IpAddressPool,
    subnets: &BTreeSet<Subnet>,
    excludes: &BTreeSet<Subnet>,
    dropped: &mut Vec<Allocation<Subnet>>,
) -> Result<()> {
    // Removals first so re-shaped subnets do not collide with old ones
    let current: BTreeSet<Subnet> = pool.subnets().copied().collect();
    for stale in current.difference(subnets) {
        dropped.extend(pool.remove_subnet(stale)?);
    }
    for fresh in subnets.difference(&current) {
        pool.add_subnet(*fresh)?;
    }

    let current: BTreeSet<Subnet> = pool.excludes().copied().collect();
    for stale in current.difference(excludes) {
        pool.remove_exclude(stale)?;
    }
    for fresh in excludes.difference(&current) {
        dropped.extend(pool.add_exclude(*fresh)?);
    }
    Ok(())
}

fn apply_alarms<P: ResourcePool>(pool: &mut P, alarms: &AlarmConfig) -> Result<()> {
    pool.configure_alarms(alarms.enabled, alarms.threshold()?)
}

/// Clear the responses of requests whose allocations were dropped
fn invalidate<V, E, F>(
    requests: &mut BTreeMap<String, E>,
    dropped: &[Allocation<V>],
    response: F,
) -> Vec<String>
where
    F: Fn(&mut E) -> &mut Option<Response>,
{
    let mut keys = Vec::with_capacity(dropped.len());
    for allocation in dropped {
        if let Some(entry) = requests.get_mut(&allocation.request_id) {
            *response(entry) = None;
        }
        keys.push(allocation.request_id.clone());
    }
    keys
}

#[derive(Clone, Copy)]
enum Placement {
    Created,
    Updated,
}

fn collect(
    report: &mut ApplyReport,
    pool: &str,
    keys: Vec<String>,
    outcome: Result<()>,
    placement: Placement,
) {
    report
        .invalidated
        .extend(keys.into_iter().map(|k| (pool.to_string(), k)));
    match (outcome, placement) {
        (Ok(()), Placement::Created) => report.created.push(pool.to_string()),
        (Ok(()), Placement::Updated) => report.updated.push(pool.to_string()),
        (Err(e), _) => {
            tracing::warn!(pool = %pool, error = %e, "Failed to apply pool configuration");
            report.failures.push((pool.to_string(), e));
        }
    }
}

/// Consumers to re-invoke, deduplicated, skipping those without an owner
fn notify_list(consumers: impl IntoIterator<Item = Consumer>) -> Vec<Consumer> {
    consumers
        .into_iter()
        .filter(Consumer::is_notifiable)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Range;

    fn manager() -> ResourceManager {
        let m = ResourceManager::new();
        m.create_id_pool(&IdPoolConfig::new("vlan", Range::new(1, 10)))
            .unwrap();
        m.create_ip_pool(&IpPoolConfig::new("lan").subnet("10.0.0.0/24"))
            .unwrap();
        m
    }

    fn svc() -> Consumer {
        Consumer::new("/services/vpn{a}", "admin")
    }

    #[test]
    fn test_duplicate_pool_names_rejected() {
        let m = manager();
        assert!(matches!(
            m.create_ip_pool(&IpPoolConfig::new("vlan")),
            Err(Error::PoolAlreadyExists(_))
        ));
    }

    #[test]
    fn test_allocate_id_and_replay() {
        let m = manager();
        let request = IdRequest::new("vlan", "a").consumer(svc());

        let report = m.allocate_id(request.clone()).unwrap();
        assert_eq!(report.response("vlan", "a").and_then(|r| r.id()), Some(1));
        assert_eq!(report.notify, vec![svc()]);

        // identical request is answered from the table
        let replay = m.allocate_id(request).unwrap();
        assert_eq!(replay.response("vlan", "a").and_then(|r| r.id()), Some(1));
        assert!(replay.notify.is_empty());
        assert_eq!(m.pool_stats("vlan").unwrap().allocations, 1);
    }

    #[test]
    fn test_changed_request_releases_old_value() {
        let m = manager();
        m.allocate_id(IdRequest::new("vlan", "a")).unwrap();
        let report = m.allocate_id(IdRequest::new("vlan", "a").requested(7)).unwrap();
        assert_eq!(report.response("vlan", "a").and_then(|r| r.id()), Some(7));
        assert!(m.with_id_pool("vlan", |p| p.is_available(1)).unwrap());
    }

    #[test]
    fn test_allocate_subnet_reports_origin() {
        let m = manager();
        let report = m
            .allocate_subnet(SubnetRequest::new("lan", "a", SubnetSize::Prefix(25)))
            .unwrap();
        let response = report.response("lan", "a").unwrap();
        assert_eq!(
            response,
            &Response::ok(AllocatedValue::Subnet {
                subnet: "10.0.0.0/25".parse().unwrap(),
                from: Some("10.0.0.0/24".parse().unwrap()),
            })
        );
        // owner-less consumers are never notified
        assert!(report.notify.is_empty());
    }

    #[test]
    fn test_release_by_key() {
        let m = manager();
        m.allocate_id(IdRequest::new("vlan", "a")).unwrap();
        assert_eq!(
            m.release(ReleaseRequest::new("vlan", "a")).unwrap(),
            Some(AllocatedValue::Id(1))
        );
        assert!(matches!(
            m.release(ReleaseRequest::new("vlan", "a")),
            Err(Error::RequestNotFound { .. })
        ));
        assert!(matches!(
            m.release(ReleaseRequest::new("nope", "a")),
            Err(Error::PoolNotFound(_))
        ));
    }

    #[test]
    fn test_wrong_change_for_pool_kind() {
        let m = manager();
        let change = PoolChange::AddSubnet("10.1.0.0/24".parse().unwrap());
        assert!(matches!(
            m.reconfigure(ReconfigureRequest::new("vlan", change)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_remove_pool_clears_alarms() {
        let observer = Arc::new(crate::events::InMemoryObserver::new());
        let m = ResourceManager::with_observer(observer.clone());
        let mut config = IdPoolConfig::new("tiny", Range::new(1, 1));
        config.alarms.enabled = true;
        m.create_id_pool(&config).unwrap();
        m.allocate_id(IdRequest::new("tiny", "a")).unwrap();
        assert_eq!(m.pool_stats("tiny").unwrap().alarm, AlarmState::Exhausted);

        m.remove_pool("tiny").unwrap();
        let messages = observer.take();
        let cleared = messages
            .iter()
            .filter(|msg| matches!(msg, PoolMessage::AlarmCleared(_)))
            .count();
        assert_eq!(cleared, 2);
        assert!(matches!(messages.last(), Some(PoolMessage::PoolRemoved(_))));
        assert!(m.pool_stats("tiny").is_err());
    }
    #[test]
    fn test_changed_subnet_request_releases_old_subnet() {
        let m = manager();
        m.allocate_subnet(SubnetRequest::new("lan", "a", SubnetSize::Prefix(25)))
            .unwrap();
        let report = m
            .allocate_subnet(SubnetRequest::new("lan", "a", SubnetSize::Prefix(26)))
            .unwrap();
        let subnet = report.response("lan", "a").and_then(|r| r.subnet());
        assert_eq!(subnet, Some("10.0.0.0/26".parse().unwrap()));
        assert_eq!(m.pool_stats("lan").unwrap().allocations, 1);
        m.with_ip_pool("lan", |p| p.check_invariants()).unwrap().unwrap();
    }

    #[test]
    fn test_reshape_failure_keeps_dropped_allocations() {
        let m = ResourceManager::new();
        m.create_ip_pool(
            &IpPoolConfig::new("lan")
                .subnet("10.0.0.0/24")
                .subnet("10.1.0.0/24"),
        )
        .unwrap();
        m.allocate_subnet(
            SubnetRequest::new("lan", "a", SubnetSize::Prefix(25))
                .requested("10.1.0.0/25".parse().unwrap()),
        )
        .unwrap();

        let slot = m.ip_slot("lan").unwrap();
        let mut slot = slot.write();
        // 10.0.0.0/25 collides with the subnet that stays
        let subnets: BTreeSet<Subnet> = ["10.0.0.0/24", "10.0.0.0/25"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let mut dropped = Vec::new();
        let outcome = reshape_ip_pool(&mut slot.pool, &subnets, &BTreeSet::new(), &mut dropped);
        assert!(matches!(outcome, Err(Error::InvalidRange(_))));
        assert_eq!(dropped.len(), 1);

        let keys = invalidate(&mut slot.requests, &dropped, |e| &mut e.response);
        assert_eq!(keys, vec!["a".to_string()]);
        assert!(slot.requests["a"].response.is_none());
    }

    #[test]
    fn test_failed_update_still_reports_invalidated_keys() {
        let mut report = ApplyReport::default();
        collect(
            &mut report,
            "lan",
            vec!["a".to_string()],
            Err(Error::Config("bad".to_string())),
            Placement::Updated,
        );
        assert_eq!(report.invalidated, vec![("lan".to_string(), "a".to_string())]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.updated.is_empty());
    }

    #[test]
    fn test_restored_request_table_replays() {
        let m = manager();
        m.allocate_id(IdRequest::new("vlan", "a").consumer(svc()))
            .unwrap();
        let snapshot = m.id_snapshot("vlan").unwrap();
        let requests = m.id_requests("vlan").unwrap();

        let restored = ResourceManager::new();
        restored
            .restore_id_pool(&IdPoolConfig::new("vlan", Range::new(1, 10)), snapshot, requests)
            .unwrap();
        let report = restored
            .allocate_id(IdRequest::new("vlan", "a").consumer(svc()))
            .unwrap();
        assert_eq!(report.response("vlan", "a").and_then(|r| r.id()), Some(1));
        assert!(report.notify.is_empty());
        assert!(!restored.id_requests("vlan").unwrap()["a"].restored);
    }
}
