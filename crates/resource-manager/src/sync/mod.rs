//! Synchronized allocation across id pools
//!
//! A request flagged `sync` must resolve to the same id in every pool that
//! holds a synchronized request with the same key. The group is assembled
//! by the caller while it holds every id pool lock; the coordinator then
//! drives the protocol over the locked slots.

mod coordinator;

pub use coordinator::SyncCoordinator;
