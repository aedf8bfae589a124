//! Pool occupancy alarms
//!
//! Each pool owns an [`AlarmPolicy`] and feeds it the available and total
//! counts after every mutation. The policy answers with the alarms that
//! changed state, which the pool forwards to its observer.

mod policy;

pub use policy::{AlarmKind, AlarmPolicy, AlarmState, AlarmTransition, DEFAULT_LOW_THRESHOLD};
