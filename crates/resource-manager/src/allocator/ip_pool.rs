//! IP address pool
//!
//! Allocates subnets out of a set of configured subnets. Free space is a
//! set of CIDR blocks ordered narrowest first, so a scan finds the
//! smallest block that fits before any wider one. Wider blocks are split
//! in halves until the requested size is reached; freed blocks are merged
//! back by re-expressing all free space as address intervals.

use super::decompose::{decompose_set, subnet_range};
use super::interval_set::IntervalSet;
use super::pool::ResourcePool;
use crate::alarm::AlarmPolicy;
use crate::events::{PoolEntry, PoolKind, PoolMessage, PoolObserver};
use crate::models::{Allocation, Consumer, Family, Subnet};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

/// Requested subnet size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetSize {
    /// Prefix length, used for both families
    Prefix(u8),
    /// Number of host bits; the prefix is `32 - n` or `128 - n`, floored at 0
    Inverted(u8),
}

impl SubnetSize {
    /// Prefix lengths to request for IPv4 and IPv6
    pub fn prefixes(&self) -> (u8, u8) {
        match *self {
            SubnetSize::Prefix(p) => (p, p),
            SubnetSize::Inverted(n) => (32u8.saturating_sub(n), 128u8.saturating_sub(n)),
        }
    }
}

/// Persisted state of an address pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPoolSnapshot {
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub excludes: Vec<Subnet>,
    #[serde(default)]
    pub available: Vec<Subnet>,
    #[serde(default)]
    pub allocations: Vec<Allocation<Subnet>>,
}

/// Pool of IPv4 and IPv6 subnets
#[derive(Debug)]
pub struct IpAddressPool {
    name: String,
    /// Configured subnets; consulted for network/broadcast checks
    subnets: BTreeSet<Subnet>,
    excludes: BTreeSet<Subnet>,
    available: BTreeSet<Subnet>,
    allocations: BTreeMap<Subnet, Allocation<Subnet>>,
    alarms: AlarmPolicy,
    observer: Arc<dyn PoolObserver>,
}

/// Per-family address intervals covered by a group of subnets
fn intervals<'a, I>(subnets: I) -> BTreeMap<Family, IntervalSet<u128>>
where
    I: IntoIterator<Item = &'a Subnet>,
{
    let mut sets: BTreeMap<Family, IntervalSet<u128>> = BTreeMap::new();
    for subnet in subnets {
        sets.entry(subnet.family())
            .or_default()
            .insert_range(subnet_range(subnet));
    }
    sets
}

/// Minimal CIDR cover of per-family intervals
fn blocks(sets: &BTreeMap<Family, IntervalSet<u128>>) -> Result<BTreeSet<Subnet>> {
    let mut out = BTreeSet::new();
    for (family, set) in sets {
        out.extend(decompose_set(*family, set)?);
    }
    Ok(out)
}

fn check_prefix(family: Family, prefix: u8) -> Result<()> {
    if prefix > family.width() {
        return Err(Error::InvalidNetmask(format!(
            "{:?} prefix must be within [0-{}], got {}",
            family,
            family.width(),
            prefix
        )));
    }
    Ok(())
}

impl IpAddressPool {
    /// Create an empty pool; space is added with [`add_subnet`](Self::add_subnet)
    pub fn new(name: impl Into<String>, observer: Arc<dyn PoolObserver>) -> Self {
        let name = name.into();
        tracing::info!(pool = %name, "Created ip pool");
        observer.notify(PoolMessage::pool_created(&name, PoolKind::Ip));

        Self {
            name,
            subnets: BTreeSet::new(),
            excludes: BTreeSet::new(),
            available: BTreeSet::new(),
            allocations: BTreeMap::new(),
            alarms: AlarmPolicy::default(),
            observer,
        }
    }

    /// Rebuild a pool from persisted state without re-deriving it
    pub fn restore(
        name: impl Into<String>,
        snapshot: IpPoolSnapshot,
        observer: Arc<dyn PoolObserver>,
    ) -> Result<Self> {
        let name = name.into();
        let corrupt = |what: String| Error::InvalidRange(format!("{} in pool {}", what, name));

        let subnets: BTreeSet<Subnet> = snapshot.subnets.into_iter().collect();
        let excluded = intervals(&snapshot.excludes);

        let mut free: BTreeMap<Family, IntervalSet<u128>> = BTreeMap::new();
        for block in &snapshot.available {
            if !subnets.iter().any(|s| s.contains(block)) {
                return Err(corrupt(format!("free block {} outside configured subnets", block)));
            }
            let range = subnet_range(block);
            let set = free.entry(block.family()).or_default();
            if set.intersects(&range) {
                return Err(corrupt(format!("free block {} overlaps another", block)));
            }
            if excluded
                .get(&block.family())
                .is_some_and(|ex| ex.intersects(&range))
            {
                return Err(corrupt(format!("free block {} is excluded", block)));
            }
            set.insert_range(range);
        }

        let mut used: BTreeMap<Family, IntervalSet<u128>> = BTreeMap::new();
        let mut allocations = BTreeMap::new();
        for allocation in snapshot.allocations {
            let subnet = allocation.value;
            let range = subnet_range(&subnet);
            let family = subnet.family();
            let clashes = free.get(&family).is_some_and(|s| s.intersects(&range))
                || used.get(&family).is_some_and(|s| s.intersects(&range))
                || excluded.get(&family).is_some_and(|s| s.intersects(&range));
            if clashes {
                return Err(corrupt(format!(
                    "allocation {} overlaps free, excluded or allocated space",
                    subnet
                )));
            }
            used.entry(family).or_default().insert_range(range);
            allocations.insert(subnet, allocation);
        }

        tracing::info!(
            pool = %name,
            subnets = subnets.len(),
            allocations = allocations.len(),
            "Restored ip pool"
        );
        observer.notify(PoolMessage::pool_created(&name, PoolKind::Ip));

        Ok(Self {
            name,
            subnets,
            excludes: snapshot.excludes.into_iter().collect(),
            available: snapshot.available.into_iter().collect(),
            allocations,
            alarms: AlarmPolicy::default(),
            observer,
        })
    }

    /// Persistable copy of the pool state
    pub fn snapshot(&self) -> IpPoolSnapshot {
        IpPoolSnapshot {
            subnets: self.subnets.iter().copied().collect(),
            excludes: self.excludes.iter().copied().collect(),
            available: self.available.iter().copied().collect(),
            allocations: self.allocations.values().cloned().collect(),
        }
    }

    pub fn subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter()
    }

    pub fn excludes(&self) -> impl Iterator<Item = &Subnet> {
        self.excludes.iter()
    }

    /// Free blocks, narrowest first
    pub fn available(&self) -> impl Iterator<Item = &Subnet> {
        self.available.iter()
    }

    pub fn is_available(&self, subnet: &Subnet) -> bool {
        self.available.contains(subnet)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation<Subnet>> {
        self.allocations.values()
    }

    pub fn allocation(&self, subnet: &Subnet) -> Option<&Allocation<Subnet>> {
        self.allocations.get(subnet)
    }

    /// Configured subnet an allocation was carved from
    pub fn origin_of(&self, subnet: &Subnet) -> Option<Subnet> {
        self.subnets.iter().find(|s| s.contains(subnet)).copied()
    }

    // ==================== Allocation ====================

    /// Allocate a subnet of the requested size
    ///
    /// `prefix4` applies to IPv4 blocks and `prefix6` to IPv6 blocks; the
    /// first block that fits wins, whatever its family.
    pub fn allocate(
        &mut self,
        prefix4: u8,
        prefix6: u8,
        consumer: &Consumer,
        request_id: &str,
    ) -> Result<Subnet> {
        // A prefix only has to fit its own family; blocks of a family whose
        // prefix is out of range are skipped
        let fits4 = check_prefix(Family::V4, prefix4);
        let fits6 = check_prefix(Family::V6, prefix6);
        if let (Err(e), Err(_)) = (&fits4, &fits6) {
            return Err(e.clone());
        }

        let target_for = |s: &Subnet| match s.family() {
            Family::V4 => fits4.is_ok().then_some(prefix4),
            Family::V6 => fits6.is_ok().then_some(prefix6),
        };

        let mut source = None;
        for block in &self.available {
            let Some(target) = target_for(block) else {
                continue;
            };
            if block.prefix_len() == target && self.not_network_broadcast(block) {
                source = Some((*block, target));
                break;
            }
            if block.prefix_len() < target {
                source = Some((*block, target));
                break;
            }
        }

        let Some((block, target)) = source else {
            self.review_alarms();
            return Err(self.no_room_error());
        };

        let before = self.available.clone();
        let granted = self.allocate_from(block, target)?;
        self.publish_available_delta(&before);
        self.record(granted, consumer, request_id);
        Ok(granted)
    }

    /// Allocate using a [`SubnetSize`]
    pub fn allocate_size(
        &mut self,
        size: SubnetSize,
        consumer: &Consumer,
        request_id: &str,
    ) -> Result<Subnet> {
        let (prefix4, prefix6) = size.prefixes();
        self.allocate(prefix4, prefix6, consumer, request_id)
    }

    /// Reserve exactly `subnet`
    pub fn allocate_specific(
        &mut self,
        subnet: Subnet,
        consumer: &Consumer,
        request_id: &str,
    ) -> Result<Subnet> {
        self.remove_from_available(subnet)?;
        self.record(subnet, consumer, request_id);
        Ok(subnet)
    }

    /// Release an allocated subnet
    pub fn release(&mut self, subnet: &Subnet) -> Result<Allocation<Subnet>> {
        let allocation = self
            .allocations
            .remove(subnet)
            .ok_or_else(|| Error::NotAllocated {
                pool: self.name.clone(),
                value: subnet.to_string(),
            })?;

        self.add_to_available(allocation.value)?;
        tracing::debug!(pool = %self.name, subnet = %allocation.value, "Released subnet");
        self.observer
            .notify(PoolMessage::allocation_released(&self.name, &allocation));
        self.review_alarms();
        Ok(allocation)
    }

    /// Release the allocation whose network address is `address`
    pub fn release_address(&mut self, address: IpAddr) -> Result<Allocation<Subnet>> {
        let subnet = self
            .allocations
            .keys()
            .find(|s| s.network() == address)
            .copied()
            .ok_or_else(|| Error::NotAllocated {
                pool: self.name.clone(),
                value: address.to_string(),
            })?;
        self.release(&subnet)
    }

    /// Release every allocation
    pub fn release_all(&mut self) -> Vec<Allocation<Subnet>> {
        let subnets: Vec<Subnet> = self.allocations.keys().copied().collect();
        subnets
            .iter()
            .filter_map(|s| self.release(s).ok())
            .collect()
    }

    fn record(&mut self, subnet: Subnet, consumer: &Consumer, request_id: &str) {
        let allocation = Allocation::new(subnet, consumer, request_id);
        self.observer
            .notify(PoolMessage::allocation_created(&self.name, &allocation));
        self.allocations.insert(subnet, allocation);

        tracing::debug!(pool = %self.name, subnet = %subnet, request = %request_id, "Allocated subnet");
        self.review_alarms();
    }

    /// Carve a `target`-sized block out of `source`
    ///
    /// Both halves of every split go back to `available` before descending
    /// into one of them. For single addresses the half that is not a
    /// network or broadcast address is preferred.
    fn allocate_from(&mut self, source: Subnet, target: u8) -> Result<Subnet> {
        self.available.remove(&source);
        if source.prefix_len() == target {
            return Ok(source);
        }

        let [low, high] = source.split()?;
        self.available.insert(low);
        self.available.insert(high);

        let next = if low.is_single_host() && !self.not_network_broadcast(&low) {
            high
        } else {
            low
        };
        self.allocate_from(next, target)
    }

    /// False when `candidate` is the network or broadcast address of a
    /// configured subnet
    ///
    /// Only single addresses are checked, and configured subnets with two
    /// or fewer addresses have no reserved addresses.
    pub fn not_network_broadcast(&self, candidate: &Subnet) -> bool {
        if !candidate.is_single_host() {
            return true;
        }
        let addr = candidate.first();
        !self.subnets.iter().any(|s| {
            s.family() == candidate.family()
                && s.host_bits() >= 2
                && (s.first() == addr || s.last() == addr)
        })
    }

    fn no_room_error(&self) -> Error {
        let mut prefixes: Vec<u8> = self
            .available
            .iter()
            // blocks of four addresses or less (v4 /30-/32, v6 /126-/128) are not offered
            .filter(|s| s.host_bits() > 2)
            .map(|s| s.prefix_len())
            .collect();
        prefixes.sort_unstable();
        prefixes.dedup();

        if prefixes.is_empty() {
            tracing::debug!(pool = %self.name, "No usable free blocks left");
            Error::PoolEmpty {
                pool: self.name.clone(),
            }
        } else {
            Error::MaskTooNarrow {
                pool: self.name.clone(),
                available: prefixes,
            }
        }
    }

    // ==================== Free space ====================

    /// Return `subnet` to the free set and renormalize it
    ///
    /// All free space plus the new block is merged as address intervals
    /// and re-expressed as the minimal set of CIDR blocks.
    pub fn add_to_available(&mut self, subnet: Subnet) -> Result<()> {
        let before = self.available.clone();
        let mut sets = intervals(self.available.iter().chain(std::iter::once(&subnet)));
        // excluded and allocated space never becomes free, even if handed back
        for (family, set) in sets.iter_mut() {
            for taken in self
                .excludes
                .iter()
                .chain(self.allocations.keys())
                .filter(|s| s.family() == *family)
            {
                set.remove_range(&subnet_range(taken));
            }
        }
        self.available = blocks(&sets)?;
        self.publish_available_delta(&before);
        Ok(())
    }

    /// Take `subnet` out of the free set
    ///
    /// An exact match is removed directly. Otherwise the covering block is
    /// split and the search repeats in the half holding `subnet`.
    pub fn remove_from_available(&mut self, subnet: Subnet) -> Result<()> {
        let before = self.available.clone();
        let result = self.carve(subnet);
        if result.is_err() {
            self.available = before;
            return result;
        }
        self.publish_available_delta(&before);
        result
    }

    fn carve(&mut self, subnet: Subnet) -> Result<()> {
        if self.available.remove(&subnet) {
            return Ok(());
        }

        if let Some(source) = self.available.iter().find(|s| s.contains(&subnet)).copied() {
            self.available.remove(&source);

            // four-address block holding an inclusive pair
            if subnet.host_bits() == 1 && source.host_bits() == 2 {
                let [first, second] = source.split4into2()?;
                self.available
                    .insert(if first == subnet { second } else { first });
                return Ok(());
            }

            let [low, high] = source.split()?;
            self.available.insert(low);
            self.available.insert(high);
            return self.carve(subnet);
        }

        // free space may be stored as several smaller blocks
        let inside: Vec<Subnet> = self
            .available
            .iter()
            .filter(|s| subnet.contains(s))
            .copied()
            .collect();
        let covered = inside
            .iter()
            .fold(0u128, |acc, s| acc.saturating_add(s.address_count()));
        if !inside.is_empty() && covered == subnet.address_count() {
            for block in inside {
                self.available.remove(&block);
            }
            return Ok(());
        }

        Err(Error::NotAvailable {
            pool: self.name.clone(),
            value: subnet.to_string(),
        })
    }

    /// Recompute free space as configured subnets minus excludes minus
    /// allocations, publishing only the blocks that changed
    fn rebuild_available(&mut self) -> Result<()> {
        let before = self.available.clone();
        let mut sets = intervals(&self.subnets);
        for (family, set) in sets.iter_mut() {
            for taken in self
                .excludes
                .iter()
                .chain(self.allocations.keys())
                .filter(|s| s.family() == *family)
            {
                set.remove_range(&subnet_range(taken));
            }
        }
        self.available = blocks(&sets)?;
        self.publish_available_delta(&before);
        self.review_alarms();
        Ok(())
    }

    fn publish_available_delta(&self, before: &BTreeSet<Subnet>) {
        let added: Vec<PoolEntry> = self
            .available
            .difference(before)
            .copied()
            .map(PoolEntry::from)
            .collect();
        let removed: Vec<PoolEntry> = before
            .difference(&self.available)
            .copied()
            .map(PoolEntry::from)
            .collect();
        if added.is_empty() && removed.is_empty() {
            return;
        }
        self.observer
            .notify(PoolMessage::available_changed(&self.name, added, removed));
    }

    // ==================== Reconfiguration ====================

    /// Add a configured subnet
    pub fn add_subnet(&mut self, subnet: Subnet) -> Result<()> {
        if self.subnets.contains(&subnet) {
            return Ok(());
        }
        if let Some(existing) = self.subnets.iter().find(|s| s.overlaps(&subnet)) {
            return Err(Error::InvalidRange(format!(
                "subnet {} overlaps {} in pool {}",
                subnet, existing, self.name
            )));
        }
        self.subnets.insert(subnet);
        tracing::info!(pool = %self.name, subnet = %subnet, "Added subnet");
        self.rebuild_available()
    }

    /// Remove a configured subnet, releasing allocations inside it
    pub fn remove_subnet(&mut self, subnet: &Subnet) -> Result<Vec<Allocation<Subnet>>> {
        if !self.subnets.remove(subnet) {
            return Err(Error::InvalidRange(format!(
                "subnet {} is not configured in pool {}",
                subnet, self.name
            )));
        }
        let invalidated = self.drop_allocations(|s| s.overlaps(subnet));
        tracing::info!(
            pool = %self.name,
            subnet = %subnet,
            invalidated = invalidated.len(),
            "Removed subnet"
        );
        self.rebuild_available()?;
        Ok(invalidated)
    }

    /// Exclude a subnet, releasing allocations overlapping it
    pub fn add_exclude(&mut self, subnet: Subnet) -> Result<Vec<Allocation<Subnet>>> {
        if !self.excludes.insert(subnet) {
            return Ok(Vec::new());
        }
        self.observer
            .notify(PoolMessage::exclude_added(&self.name, PoolEntry::from(subnet)));
        let invalidated = self.drop_allocations(|s| s.overlaps(&subnet));
        tracing::info!(
            pool = %self.name,
            exclude = %subnet,
            invalidated = invalidated.len(),
            "Added exclude"
        );
        self.rebuild_available()?;
        Ok(invalidated)
    }

    /// Remove an exclude; unknown entries are ignored
    pub fn remove_exclude(&mut self, subnet: &Subnet) -> Result<bool> {
        if !self.excludes.remove(subnet) {
            return Ok(false);
        }
        self.observer
            .notify(PoolMessage::exclude_removed(&self.name, PoolEntry::from(*subnet)));
        tracing::info!(pool = %self.name, exclude = %subnet, "Removed exclude");
        self.rebuild_available()?;
        Ok(true)
    }

    fn drop_allocations<F: Fn(&Subnet) -> bool>(&mut self, invalid: F) -> Vec<Allocation<Subnet>> {
        let subnets: Vec<Subnet> = self
            .allocations
            .keys()
            .filter(|s| invalid(s))
            .copied()
            .collect();

        let mut dropped = Vec::with_capacity(subnets.len());
        for subnet in subnets {
            if let Some(allocation) = self.allocations.remove(&subnet) {
                self.observer
                    .notify(PoolMessage::allocation_released(&self.name, &allocation));
                dropped.push(allocation);
            }
        }
        dropped
    }

    /// Check that free blocks are pairwise disjoint and disjoint from
    /// excluded and allocated space
    pub fn check_invariants(&self) -> Result<()> {
        let excluded = intervals(&self.excludes);
        let mut seen: BTreeMap<Family, IntervalSet<u128>> = BTreeMap::new();

        for subnet in self.available.iter().chain(self.allocations.keys()) {
            let range = subnet_range(subnet);
            let set = seen.entry(subnet.family()).or_default();
            let clash = set.intersects(&range)
                || excluded
                    .get(&subnet.family())
                    .is_some_and(|ex| ex.intersects(&range));
            if clash {
                return Err(Error::InvalidRange(format!(
                    "block {} of {} overlaps other free, excluded or allocated space",
                    subnet, self.name
                )));
            }
            set.insert_range(range);
        }
        Ok(())
    }
}

impl ResourcePool for IpAddressPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn available_count(&self) -> u128 {
        self.available
            .iter()
            .fold(0u128, |acc, s| acc.saturating_add(s.address_count()))
    }

    fn total_size(&self) -> u128 {
        intervals(&self.subnets)
            .values()
            .fold(0u128, |acc, set| acc.saturating_add(set.count()))
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
