//! Request and response types, and the per-pool request tables

use crate::allocator::{IdPool, IdStrategy, IpAddressPool, ResourcePool, SubnetSize};
use crate::config::AlarmConfig;
use crate::error::ErrorKind;
use crate::models::{Consumer, Family, Range, Subnet};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request for an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRequest {
    pub pool: String,
    /// Allocation key, unique within the pool
    pub key: String,
    #[serde(default)]
    pub consumer: Consumer,
    /// Specific id wanted, if any
    #[serde(default)]
    pub requested: Option<u64>,
    #[serde(default)]
    pub strategy: IdStrategy,
    /// Resolve to the same id as requests with this key in other pools
    #[serde(default)]
    pub sync: bool,
}

impl IdRequest {
    pub fn new(pool: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            key: key.into(),
            consumer: Consumer::default(),
            requested: None,
            strategy: IdStrategy::default(),
            sync: false,
        }
    }

    pub fn consumer(mut self, consumer: Consumer) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn requested(mut self, value: u64) -> Self {
        self.requested = Some(value);
        self
    }

    pub fn strategy(mut self, strategy: IdStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn synced(mut self) -> Self {
        self.sync = true;
        self
    }
}

/// Request for a subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRequest {
    pub pool: String,
    pub key: String,
    #[serde(default)]
    pub consumer: Consumer,
    pub size: SubnetSize,
    /// Exact subnet to reserve instead of picking one
    #[serde(default)]
    pub requested: Option<Subnet>,
}

impl SubnetRequest {
    pub fn new(pool: impl Into<String>, key: impl Into<String>, size: SubnetSize) -> Self {
        Self {
            pool: pool.into(),
            key: key.into(),
            consumer: Consumer::default(),
            size,
            requested: None,
        }
    }

    pub fn consumer(mut self, consumer: Consumer) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn requested(mut self, subnet: Subnet) -> Self {
        self.requested = Some(subnet);
        self
    }
}

/// Request to release whatever a key holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub pool: String,
    pub key: String,
}

impl ReleaseRequest {
    pub fn new(pool: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            key: key.into(),
        }
    }
}

/// A change to a running pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolChange {
    /// New id range
    Bounds(Range<u64>),
    /// Exclude an id range
    Exclude(Range<u64>),
    /// Drop an id exclude
    Unexclude(Range<u64>),
    AddSubnet(Subnet),
    RemoveSubnet(Subnet),
    ExcludeSubnet(Subnet),
    UnexcludeSubnet(Subnet),
    /// New alarm settings, for either pool kind
    Alarms(AlarmConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    pub pool: String,
    pub change: PoolChange,
}

impl ReconfigureRequest {
    pub fn new(pool: impl Into<String>, change: PoolChange) -> Self {
        Self {
            pool: pool.into(),
            change,
        }
    }
}

/// Value handed out for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatedValue {
    Id(u64),
    Subnet {
        subnet: Subnet,
        /// Configured pool subnet it was carved from
        from: Option<Subnet>,
    },
}

/// Stored answer to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { value: AllocatedValue },
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn ok(value: AllocatedValue) -> Self {
        Response::Ok { value }
    }

    pub fn error(err: &Error) -> Self {
        Response::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    /// Allocated id, if this is a successful id response
    pub fn id(&self) -> Option<u64> {
        match self {
            Response::Ok {
                value: AllocatedValue::Id(v),
            } => Some(*v),
            _ => None,
        }
    }

    /// Allocated subnet, if this is a successful subnet response
    pub fn subnet(&self) -> Option<Subnet> {
        match self {
            Response::Ok {
                value: AllocatedValue::Subnet { subnet, .. },
            } => Some(*subnet),
            _ => None,
        }
    }
}

impl From<Result<AllocatedValue>> for Response {
    fn from(result: Result<AllocatedValue>) -> Self {
        match result {
            Ok(value) => Response::ok(value),
            Err(e) => Response::error(&e),
        }
    }
}

/// Answer written back for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub pool: String,
    pub key: String,
    pub response: Response,
}

/// Outcome of one allocate call
///
/// A synchronized request answers every member of its group, so there may
/// be several results. `notify` lists the consumers to re-invoke.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub results: Vec<AllocationResult>,
    pub notify: Vec<Consumer>,
}

impl AllocationReport {
    /// Response for a given pool and key
    pub fn response(&self, pool: &str, key: &str) -> Option<&Response> {
        self.results
            .iter()
            .find(|r| r.pool == pool && r.key == key)
            .map(|r| &r.response)
    }
}

/// Outcome of a reconfiguration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigureReport {
    pub pool: String,
    /// Keys whose allocations were released and need to be re-requested
    pub invalidated: Vec<String>,
}

// ============================================================================
// Request tables
// ============================================================================

/// Stored id request
///
/// Request tables are persisted next to pool snapshots so a restored
/// pool answers repeated requests exactly as before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRequestEntry {
    #[serde(default)]
    pub consumer: Consumer,
    #[serde(default)]
    pub requested: Option<u64>,
    #[serde(default)]
    pub strategy: IdStrategy,
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub response: Option<Response>,
    /// Rebuilt from an allocation record alone; the original request
    /// parameters are unknown
    #[serde(default)]
    pub restored: bool,
}

impl From<&IdRequest> for IdRequestEntry {
    fn from(request: &IdRequest) -> Self {
        Self {
            consumer: request.consumer.clone(),
            requested: request.requested,
            strategy: request.strategy,
            sync: request.sync,
            response: None,
            restored: false,
        }
    }
}

impl IdRequestEntry {
    /// Whether this entry already answers `request`, given the id it holds
    ///
    /// A restored entry only knows its value, so any request that does not
    /// ask for a different id is taken as the same request.
    pub fn answers(&self, request: &IdRequestEntry, held: Option<u64>) -> bool {
        if self.restored {
            return held.is_some() && request.requested.map_or(true, |v| Some(v) == held);
        }
        self.requested == request.requested
            && self.strategy == request.strategy
            && self.sync == request.sync
            && self.consumer == request.consumer
    }
}

/// Stored subnet request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRequestEntry {
    #[serde(default)]
    pub consumer: Consumer,
    pub size: SubnetSize,
    #[serde(default)]
    pub requested: Option<Subnet>,
    #[serde(default)]
    pub response: Option<Response>,
    /// Rebuilt from an allocation record alone
    #[serde(default)]
    pub restored: bool,
}

impl From<&SubnetRequest> for SubnetRequestEntry {
    fn from(request: &SubnetRequest) -> Self {
        Self {
            consumer: request.consumer.clone(),
            size: request.size,
            requested: request.requested,
            response: None,
            restored: false,
        }
    }
}

impl SubnetRequestEntry {
    /// Whether this entry already answers `request`, given the subnet it holds
    pub fn answers(&self, request: &SubnetRequestEntry, held: Option<Subnet>) -> bool {
        if self.restored {
            let Some(held) = held else {
                return false;
            };
            let (prefix4, prefix6) = request.size.prefixes();
            let prefix = match held.family() {
                Family::V4 => prefix4,
                Family::V6 => prefix6,
            };
            return prefix == held.prefix_len() && request.requested.map_or(true, |s| s == held);
        }
        self.size == request.size
            && self.requested == request.requested
            && self.consumer == request.consumer
    }
}

/// An id pool together with its request table
#[derive(Debug)]
pub struct IdPoolSlot {
    pub pool: IdPool,
    pub requests: BTreeMap<String, IdRequestEntry>,
    /// Whether requests in this pool may join sync groups
    pub sync_enabled: bool,
}

impl IdPoolSlot {
    pub fn new(pool: IdPool) -> Self {
        Self {
            pool,
            requests: BTreeMap::new(),
            sync_enabled: true,
        }
    }

    pub fn name(&self) -> &str {
        self.pool.name()
    }

    pub fn entry(&self, key: &str) -> Option<&IdRequestEntry> {
        self.requests.get(key)
    }

    /// True when `key` has a synchronized request in this pool
    pub fn has_sync_request(&self, key: &str) -> bool {
        self.sync_enabled && self.requests.get(key).is_some_and(|e| e.sync)
    }

    /// Id currently held by `key`
    pub fn held_value(&self, key: &str) -> Option<u64> {
        let value = self.requests.get(key)?.response.as_ref()?.id()?;
        self.pool
            .allocation(value)
            .filter(|a| a.request_id == key)
            .map(|_| value)
    }

    /// Allocate exactly `value` for `key`
    pub fn try_value(&mut self, key: &str, value: u64) -> Result<u64> {
        let consumer = self
            .requests
            .get(key)
            .map(|e| e.consumer.clone())
            .unwrap_or_default();
        self.pool.allocate_specific(value, &consumer, key)
    }

    /// Store the response for `key` and build the result to report
    pub fn respond(&mut self, key: &str, response: Response) -> AllocationResult {
        if let Some(entry) = self.requests.get_mut(key) {
            entry.response = Some(response.clone());
        }
        AllocationResult {
            pool: self.name().to_string(),
            key: key.to_string(),
            response,
        }
    }

    /// Release `value`, logging instead of failing when it is not held
    pub fn give_back(&mut self, value: u64) {
        if let Err(e) = self.pool.release(value) {
            tracing::warn!(pool = %self.name(), value, error = %e, "Failed to release id");
        }
    }

    /// Key of the request holding `value`
    pub fn key_of(&self, value: u64) -> Option<&str> {
        self.pool.allocation(value).map(|a| a.request_id.as_str())
    }
}

/// An address pool together with its request table
#[derive(Debug)]
pub struct IpPoolSlot {
    pub pool: IpAddressPool,
    pub requests: BTreeMap<String, SubnetRequestEntry>,
}

impl IpPoolSlot {
    pub fn new(pool: IpAddressPool) -> Self {
        Self {
            pool,
            requests: BTreeMap::new(),
        }
    }

    /// Release `subnet`, logging instead of failing when it is not held
    pub fn give_back(&mut self, subnet: &Subnet) {
        if let Err(e) = self.pool.release(subnet) {
            tracing::warn!(
                pool = %self.pool.name(),
                subnet = %subnet,
                error = %e,
                "Failed to release subnet"
            );
        }
    }

    /// Subnet currently held by `key`
    pub fn held_subnet(&self, key: &str) -> Option<Subnet> {
        let subnet = self.requests.get(key)?.response.as_ref()?.subnet()?;
        self.pool
            .allocation(&subnet)
            .filter(|a| a.request_id == key)
            .map(|_| subnet)
    }
}
