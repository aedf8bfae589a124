//! Pool events and the observer port
//!
//! Pools never persist themselves. After each mutation they emit
//! [`PoolMessage`] values to an injected [`PoolObserver`]; a persistence
//! adapter applies them to its store and an alarm sink forwards the alarm
//! messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    IdPool / IpAddressPool                 │
//! │  ┌──────────────┐    ┌──────────────┐    ┌─────────────┐ │
//! │  │ allocate     │───►│ PoolMessage  │───►│PoolObserver │ │
//! │  │ release      │    │ (deltas,     │    │ (injected)  │ │
//! │  │ reconfigure  │    │  alarms)     │    └─────────────┘ │
//! │  └──────────────┘    └──────────────┘                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Message Groups
//!
//! | Group | Messages |
//! |-------|----------|
//! | Lifecycle | `PoolCreated`, `PoolRemoved` |
//! | Space | `AvailableChanged`, `ExcludeAdded`, `ExcludeRemoved` |
//! | Allocation | `AllocationCreated`, `AllocationReleased` |
//! | Alarm | `AlarmRaised`, `AlarmCleared` |
//!
//! # Usage
//!
//! ```rust,ignore
//! use resource_manager::events::InMemoryObserver;
//! use std::sync::Arc;
//!
//! let observer = Arc::new(InMemoryObserver::new());
//! let mut pool = IdPool::new("vlan", Range::new(100, 199), observer.clone());
//! pool.allocate(&consumer, "k1")?;
//!
//! for msg in observer.take() {
//!     println!("{}: {}", msg.pool(), msg.description());
//! }
//! ```

pub mod messages;
pub mod observer;

pub use messages::{
    AlarmEvent, AllocationEvent, AvailableChangedEvent, ExcludeEvent, PoolCreatedEvent, PoolEntry,
    PoolKind, PoolMessage, PoolRemovedEvent,
};
pub use observer::{InMemoryObserver, NoopObserver, PoolObserver};
