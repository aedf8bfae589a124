//! Resource Pool Manager
//!
//! Allocation engine for two kinds of resource pools:
//! - Integer id pools (VLAN ids, tunnel keys, ...) with first-free and
//!   round-robin strategies
//! - IP address pools handing out IPv4/IPv6 subnets carved from
//!   configured networks
//!
//! Features:
//! - Interval-set bookkeeping of free space with exclusions
//! - Synchronized id allocation across pools sharing a request key
//! - Occupancy alarms with a configurable low threshold
//! - Live reconfiguration that invalidates only affected allocations
//! - YAML configuration and snapshot/restore of pool state

pub mod alarm;
pub mod allocator;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod service;
pub mod sync;

// Re-export core types
pub use alarm::{AlarmKind, AlarmPolicy, AlarmState, AlarmTransition};
pub use allocator::{
    IdPool, IdPoolSnapshot, IdStrategy, IntervalSet, IpAddressPool, IpPoolSnapshot, ResourcePool,
    SubnetSize,
};
pub use config::{AlarmConfig, EngineConfig, IdPoolConfig, IpPoolConfig};
pub use error::{Error, ErrorKind, Result};
pub use events::{InMemoryObserver, NoopObserver, PoolMessage, PoolObserver};
pub use models::{Allocation, Consumer, Family, Range, Subnet};
pub use service::{
    AllocatedValue, AllocationReport, ApplyReport, IdRequest, PoolChange, PoolStats,
    ReconfigureReport, ReconfigureRequest, ReleaseRequest, ResourceManager, Response,
    SubnetRequest,
};
pub use sync::SyncCoordinator;
