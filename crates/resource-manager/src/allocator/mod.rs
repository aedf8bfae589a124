//! Pool allocators
//!
//! Provides allocation of:
//! - integer ids from bounded ranges (first-free or round-robin)
//! - IPv4/IPv6 subnets from configured address space (narrowest fit)

mod decompose;
mod id_pool;
mod interval_set;
mod ip_pool;
mod pool;

pub use decompose::{decompose, decompose_set, subnet_range};
pub use id_pool::{IdPool, IdPoolSnapshot, IdStrategy};
pub use interval_set::{IntervalSet, RangeDelta};
pub use ip_pool::{IpAddressPool, IpPoolSnapshot, SubnetSize};
pub use pool::ResourcePool;
