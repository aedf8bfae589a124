//! Resource manager service
//!
//! Owns every pool together with its request table and answers
//! allocation, release and reconfiguration requests.

mod manager;
mod requests;

pub use manager::{ApplyReport, PoolStats, ResourceManager};
pub use requests::{
    AllocatedValue, AllocationReport, AllocationResult, IdPoolSlot, IdRequest, IdRequestEntry,
    IpPoolSlot, PoolChange, ReconfigureReport, ReconfigureRequest, ReleaseRequest, Response,
    SubnetRequest, SubnetRequestEntry,
};
