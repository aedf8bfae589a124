//! Integer id pool
//!
//! Hands out unique integers from a bounded range with excluded
//! sub-ranges. Free space lives in an [`IntervalSet`]; allocations are
//! keyed by value.

use super::interval_set::{IntervalSet, RangeDelta};
use super::pool::ResourcePool;
use crate::alarm::AlarmPolicy;
use crate::events::{PoolEntry, PoolKind, PoolMessage, PoolObserver};
use crate::models::{Allocation, Consumer, Range};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// How a free id is picked when none is requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdStrategy {
    /// Lowest free value
    #[default]
    FirstFree,
    /// Next free value after the last one granted, wrapping at the top
    RoundRobin,
}

/// Persisted state of an id pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPoolSnapshot {
    pub bounds: Range<u64>,
    #[serde(default)]
    pub excludes: Vec<Range<u64>>,
    #[serde(default)]
    pub available: Vec<Range<u64>>,
    #[serde(default)]
    pub allocations: Vec<Allocation<u64>>,
}

/// Pool of integer ids
#[derive(Debug)]
pub struct IdPool {
    name: String,
    bounds: Range<u64>,
    /// Exclude entries as configured; may overlap each other
    excludes: BTreeSet<Range<u64>>,
    available: IntervalSet<u64>,
    allocations: BTreeMap<u64, Allocation<u64>>,
    /// Round-robin cursor
    last_allocated: Option<u64>,
    alarms: AlarmPolicy,
    observer: Arc<dyn PoolObserver>,
}

impl IdPool {
    /// Create a pool whose whole range is free
    pub fn new(name: impl Into<String>, bounds: Range<u64>, observer: Arc<dyn PoolObserver>) -> Self {
        let name = name.into();
        let available = IntervalSet::from_range(bounds);

        tracing::info!(pool = %name, bounds = %bounds, "Created id pool");
        observer.notify(PoolMessage::pool_created(&name, PoolKind::Id));
        observer.notify(PoolMessage::available_changed(
            &name,
            vec![PoolEntry::from(bounds)],
            Vec::new(),
        ));

        Self {
            name,
            bounds,
            excludes: BTreeSet::new(),
            available,
            allocations: BTreeMap::new(),
            last_allocated: None,
            alarms: AlarmPolicy::default(),
            observer,
        }
    }

    /// Rebuild a pool from persisted state without re-deriving it
    pub fn restore(
        name: impl Into<String>,
        snapshot: IdPoolSnapshot,
        observer: Arc<dyn PoolObserver>,
    ) -> Result<Self> {
        let name = name.into();
        let bounds = snapshot.bounds;
        let available = IntervalSet::try_from_disjoint(snapshot.available)?;
        let excluded = IntervalSet::from_ranges(snapshot.excludes.iter().copied());

        if let (Some(first), Some(last)) = (available.first(), available.last()) {
            if !bounds.contains_range(&Range::new(first, last)) {
                return Err(Error::InvalidRange(format!(
                    "available space of {} exceeds bounds {}",
                    name, bounds
                )));
            }
        }
        for range in excluded.iter() {
            if available.intersects(&range) {
                return Err(Error::InvalidRange(format!(
                    "exclude {} of {} overlaps available space",
                    range, name
                )));
            }
        }

        let mut allocations = BTreeMap::new();
        for allocation in snapshot.allocations {
            let v = allocation.value;
            if !bounds.contains(v) || available.contains(v) || excluded.contains(v) {
                return Err(Error::InvalidRange(format!(
                    "allocation {} of {} is out of bounds, free or excluded",
                    v, name
                )));
            }
            if allocations.insert(v, allocation).is_some() {
                return Err(Error::InvalidRange(format!(
                    "allocation {} of {} recorded twice",
                    v, name
                )));
            }
        }

        tracing::info!(
            pool = %name,
            allocations = allocations.len(),
            "Restored id pool"
        );
        observer.notify(PoolMessage::pool_created(&name, PoolKind::Id));

        Ok(Self {
            name,
            bounds,
            excludes: snapshot.excludes.into_iter().collect(),
            available,
            last_allocated: allocations.keys().next_back().copied(),
            allocations,
            alarms: AlarmPolicy::default(),
            observer,
        })
    }

    /// Persistable copy of the pool state
    pub fn snapshot(&self) -> IdPoolSnapshot {
        IdPoolSnapshot {
            bounds: self.bounds,
            excludes: self.excludes.iter().copied().collect(),
            available: self.available.to_vec(),
            allocations: self.allocations.values().cloned().collect(),
        }
    }

    pub fn bounds(&self) -> Range<u64> {
        self.bounds
    }

    pub fn excludes(&self) -> impl Iterator<Item = &Range<u64>> {
        self.excludes.iter()
    }

    pub fn available(&self) -> &IntervalSet<u64> {
        &self.available
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation<u64>> {
        self.allocations.values()
    }

    pub fn allocation(&self, value: u64) -> Option<&Allocation<u64>> {
        self.allocations.get(&value)
    }

    pub fn is_allocated(&self, value: u64) -> bool {
        self.allocations.contains_key(&value)
    }

    pub fn is_available(&self, value: u64) -> bool {
        self.available.contains(value)
    }

    pub fn last_allocated(&self) -> Option<u64> {
        self.last_allocated
    }

    // ==================== Allocation ====================

    /// Allocate the lowest free id
    pub fn allocate(&mut self, consumer: &Consumer, request_id: &str) -> Result<u64> {
        self.allocate_with(IdStrategy::FirstFree, consumer, request_id)
    }

    /// Allocate a free id using the given strategy
    pub fn allocate_with(
        &mut self,
        strategy: IdStrategy,
        consumer: &Consumer,
        request_id: &str,
    ) -> Result<u64> {
        let value = match strategy {
            IdStrategy::FirstFree => self.available.first(),
            IdStrategy::RoundRobin => self.next_round_robin(),
        }
        .ok_or_else(|| Error::Exhausted {
            pool: self.name.clone(),
        })?;

        self.take_value(value, consumer, request_id);
        Ok(value)
    }

    /// Allocate exactly `value`
    pub fn allocate_specific(
        &mut self,
        value: u64,
        consumer: &Consumer,
        request_id: &str,
    ) -> Result<u64> {
        if !self.available.contains(value) {
            return Err(Error::NotAvailable {
                pool: self.name.clone(),
                value: value.to_string(),
            });
        }
        self.take_value(value, consumer, request_id);
        Ok(value)
    }

    /// Release an allocated id
    pub fn release(&mut self, value: u64) -> Result<Allocation<u64>> {
        let allocation = self
            .allocations
            .remove(&value)
            .ok_or_else(|| Error::NotAllocated {
                pool: self.name.clone(),
                value: value.to_string(),
            })?;

        let before = self.available.clone();
        self.available.give(value);
        self.publish_delta(self.available.diff(&before));

        tracing::debug!(pool = %self.name, value, "Released id");
        self.observer
            .notify(PoolMessage::allocation_released(&self.name, &allocation));
        self.review_alarms();
        Ok(allocation)
    }

    /// Release every allocation
    pub fn release_all(&mut self) -> Vec<Allocation<u64>> {
        let values: Vec<u64> = self.allocations.keys().copied().collect();
        values
            .into_iter()
            .filter_map(|v| self.release(v).ok())
            .collect()
    }

    /// First free id at or after `last_allocated + 1`, wrapping to the lowest
    fn next_round_robin(&self) -> Option<u64> {
        let start = match self.last_allocated {
            Some(last) if last < self.bounds.end() => last + 1,
            _ => self.bounds.start(),
        };
        self.available
            .first_at_or_after(start)
            .or_else(|| self.available.first())
    }

    fn take_value(&mut self, value: u64, consumer: &Consumer, request_id: &str) {
        let before = self.available.range_containing(value);
        self.available.take(value);
        if let Some(range) = before {
            let added = range
                .difference(&Range::single(value))
                .into_iter()
                .map(PoolEntry::from)
                .collect();
            self.observer.notify(PoolMessage::available_changed(
                &self.name,
                added,
                vec![PoolEntry::from(range)],
            ));
        }

        let allocation = Allocation::new(value, consumer, request_id);
        self.observer
            .notify(PoolMessage::allocation_created(&self.name, &allocation));
        self.allocations.insert(value, allocation);
        self.last_allocated = Some(value);

        tracing::debug!(pool = %self.name, value, request = %request_id, "Allocated id");
        self.review_alarms();
    }

    // ==================== Reconfiguration ====================

    /// Add an exclude, releasing any allocations inside it
    ///
    /// Returns the invalidated allocations so their requests can be
    /// re-run.
    pub fn add_exclude(&mut self, range: Range<u64>) -> Vec<Allocation<u64>> {
        if !self.excludes.insert(range) {
            return Vec::new();
        }
        self.observer
            .notify(PoolMessage::exclude_added(&self.name, PoolEntry::from(range)));

        let invalidated = self.drop_allocations(|v| range.contains(v));
        tracing::info!(
            pool = %self.name,
            exclude = %range,
            invalidated = invalidated.len(),
            "Added exclude"
        );
        self.recompute();
        invalidated
    }

    /// Remove an exclude entry; unknown entries are ignored
    pub fn remove_exclude(&mut self, range: Range<u64>) -> bool {
        if !self.excludes.remove(&range) {
            return false;
        }
        self.observer
            .notify(PoolMessage::exclude_removed(&self.name, PoolEntry::from(range)));
        tracing::info!(pool = %self.name, exclude = %range, "Removed exclude");
        self.recompute();
        true
    }

    /// Change the pool range, releasing allocations that fall outside it
    pub fn set_bounds(&mut self, bounds: Range<u64>) -> Vec<Allocation<u64>> {
        if bounds == self.bounds {
            return Vec::new();
        }
        self.bounds = bounds;
        let invalidated = self.drop_allocations(|v| !bounds.contains(v));
        tracing::info!(
            pool = %self.name,
            bounds = %bounds,
            invalidated = invalidated.len(),
            "Changed pool bounds"
        );
        self.recompute();
        invalidated
    }

    fn drop_allocations<F: Fn(u64) -> bool>(&mut self, invalid: F) -> Vec<Allocation<u64>> {
        let values: Vec<u64> = self
            .allocations
            .keys()
            .copied()
            .filter(|v| invalid(*v))
            .collect();

        let mut dropped = Vec::with_capacity(values.len());
        for v in values {
            if let Some(allocation) = self.allocations.remove(&v) {
                self.observer
                    .notify(PoolMessage::allocation_released(&self.name, &allocation));
                dropped.push(allocation);
            }
        }
        dropped
    }

    /// Rebuild `available` as bounds minus excludes minus allocations
    ///
    /// Only entries that actually changed are published.
    fn recompute(&mut self) {
        let mut fresh = IntervalSet::from_range(self.bounds);
        for exclude in &self.excludes {
            fresh.remove_range(exclude);
        }
        for value in self.allocations.keys() {
            fresh.take(*value);
        }

        let delta = fresh.diff(&self.available);
        self.available = fresh;
        self.publish_delta(delta);

        self.last_allocated = self.allocations.keys().next_back().copied();
        self.review_alarms();
    }

    fn publish_delta(&self, delta: RangeDelta<u64>) {
        if delta.is_empty() {
            return;
        }
        self.observer.notify(PoolMessage::available_changed(
            &self.name,
            delta.added.into_iter().map(PoolEntry::from).collect(),
            delta.removed.into_iter().map(PoolEntry::from).collect(),
        ));
    }

    /// Check that available, excluded and allocated values are disjoint
    /// and that free and allocated values stay within bounds
    pub fn check_invariants(&self) -> Result<()> {
        let excluded = IntervalSet::from_ranges(self.excludes.iter().copied());
        for range in self.available.iter() {
            if !self.bounds.contains_range(&range) || excluded.intersects(&range) {
                return Err(Error::InvalidRange(format!(
                    "free range {} of {} is out of bounds or excluded",
                    range, self.name
                )));
            }
        }
        for v in self.allocations.keys() {
            if self.available.contains(*v) || excluded.contains(*v) || !self.bounds.contains(*v) {
                return Err(Error::InvalidRange(format!(
                    "allocation {} of {} overlaps free or excluded space",
                    v, self.name
                )));
            }
        }
        Ok(())
    }
}

impl ResourcePool for IdPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn available_count(&self) -> u128 {
        self.available.count()
    }

    fn total_size(&self) -> u128 {
        self.bounds.len()
    }

    fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    fn alarm_policy(&self) -> &AlarmPolicy {
        &self.alarms
    }

    fn alarm_policy_mut(&mut self) -> &mut AlarmPolicy {
        &mut self.alarms
    }

    fn observer(&self) -> &Arc<dyn PoolObserver> {
        &self.observer
    }
}
