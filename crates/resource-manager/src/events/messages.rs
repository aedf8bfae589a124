//! Pool event messages
//!
//! Emitted after every pool mutation. Available-set changes arrive as
//! entry-level deltas so a persistence adapter can create and delete
//! individual entries keyed by their value.

use crate::alarm::{AlarmKind, AlarmTransition};
use crate::models::{Allocation, Range, Subnet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of pool an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Id,
    Ip,
}

/// A stored pool entry: an id range or a subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoolEntry {
    Range(Range<u64>),
    Subnet(Subnet),
}

impl From<Range<u64>> for PoolEntry {
    fn from(range: Range<u64>) -> Self {
        PoolEntry::Range(range)
    }
}

impl From<u64> for PoolEntry {
    fn from(value: u64) -> Self {
        PoolEntry::Range(Range::single(value))
    }
}

impl From<Subnet> for PoolEntry {
    fn from(subnet: Subnet) -> Self {
        PoolEntry::Subnet(subnet)
    }
}

impl fmt::Display for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEntry::Range(r) if r.is_single() => write!(f, "{}", r.start()),
            PoolEntry::Range(r) => write!(f, "{}", r),
            PoolEntry::Subnet(s) => write!(f, "{}", s),
        }
    }
}

/// Main pool event message type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PoolMessage {
    // ========================================================================
    // Lifecycle Events
    // ========================================================================
    /// A pool was created or restored
    PoolCreated(PoolCreatedEvent),

    /// A pool was removed from the configuration
    PoolRemoved(PoolRemovedEvent),

    // ========================================================================
    // Space Events
    // ========================================================================
    /// Entries were added to or removed from the available set
    AvailableChanged(AvailableChangedEvent),

    /// An exclude was added
    ExcludeAdded(ExcludeEvent),

    /// An exclude was removed
    ExcludeRemoved(ExcludeEvent),

    // ========================================================================
    // Allocation Events
    // ========================================================================
    /// A value was handed out
    AllocationCreated(AllocationEvent),

    /// A value was given back
    AllocationReleased(AllocationEvent),

    // ========================================================================
    // Alarm Events
    // ========================================================================
    /// An alarm was raised
    AlarmRaised(AlarmEvent),

    /// An alarm was cleared
    AlarmCleared(AlarmEvent),
}

// ============================================================================
// Event payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolCreatedEvent {
    pub pool: String,
    pub kind: PoolKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRemovedEvent {
    pub pool: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableChangedEvent {
    pub pool: String,
    pub added: Vec<PoolEntry>,
    pub removed: Vec<PoolEntry>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludeEvent {
    pub pool: String,
    pub entry: PoolEntry,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationEvent {
    pub pool: String,
    pub value: PoolEntry,
    pub owner: String,
    pub username: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub pool: String,
    pub kind: AlarmKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Constructors
// ============================================================================

impl PoolMessage {
    pub fn pool_created(pool: &str, kind: PoolKind) -> Self {
        PoolMessage::PoolCreated(PoolCreatedEvent {
            pool: pool.to_string(),
            kind,
            timestamp: Utc::now(),
        })
    }

    pub fn pool_removed(pool: &str) -> Self {
        PoolMessage::PoolRemoved(PoolRemovedEvent {
            pool: pool.to_string(),
            timestamp: Utc::now(),
        })
    }

    pub fn available_changed(pool: &str, added: Vec<PoolEntry>, removed: Vec<PoolEntry>) -> Self {
        PoolMessage::AvailableChanged(AvailableChangedEvent {
            pool: pool.to_string(),
            added,
            removed,
            timestamp: Utc::now(),
        })
    }

    pub fn exclude_added(pool: &str, entry: PoolEntry) -> Self {
        PoolMessage::ExcludeAdded(ExcludeEvent {
            pool: pool.to_string(),
            entry,
            timestamp: Utc::now(),
        })
    }

    pub fn exclude_removed(pool: &str, entry: PoolEntry) -> Self {
        PoolMessage::ExcludeRemoved(ExcludeEvent {
            pool: pool.to_string(),
            entry,
            timestamp: Utc::now(),
        })
    }

    pub fn allocation_created<V: Into<PoolEntry> + Clone>(pool: &str, a: &Allocation<V>) -> Self {
        PoolMessage::AllocationCreated(allocation_event(pool, a))
    }

    pub fn allocation_released<V: Into<PoolEntry> + Clone>(pool: &str, a: &Allocation<V>) -> Self {
        PoolMessage::AllocationReleased(allocation_event(pool, a))
    }

    pub fn alarm(pool: &str, transition: AlarmTransition) -> Self {
        let text = match transition.kind {
            AlarmKind::Exhausted => format!("Resource pool {} exhausted", pool),
            AlarmKind::LowThreshold => format!("Resource pool {} low threshold reached", pool),
        };
        let event = AlarmEvent {
            pool: pool.to_string(),
            kind: transition.kind,
            text,
            timestamp: Utc::now(),
        };
        if transition.raised {
            PoolMessage::AlarmRaised(event)
        } else {
            PoolMessage::AlarmCleared(event)
        }
    }

    /// Name of the pool the message refers to
    pub fn pool(&self) -> &str {
        match self {
            PoolMessage::PoolCreated(e) => &e.pool,
            PoolMessage::PoolRemoved(e) => &e.pool,
            PoolMessage::AvailableChanged(e) => &e.pool,
            PoolMessage::ExcludeAdded(e) | PoolMessage::ExcludeRemoved(e) => &e.pool,
            PoolMessage::AllocationCreated(e) | PoolMessage::AllocationReleased(e) => &e.pool,
            PoolMessage::AlarmRaised(e) | PoolMessage::AlarmCleared(e) => &e.pool,
        }
    }

    /// Get a human-readable description of the message
    pub fn description(&self) -> &'static str {
        match self {
            PoolMessage::PoolCreated(_) => "pool created",
            PoolMessage::PoolRemoved(_) => "pool removed",
            PoolMessage::AvailableChanged(_) => "available changed",
            PoolMessage::ExcludeAdded(_) => "exclude added",
            PoolMessage::ExcludeRemoved(_) => "exclude removed",
            PoolMessage::AllocationCreated(_) => "allocation created",
            PoolMessage::AllocationReleased(_) => "allocation released",
            PoolMessage::AlarmRaised(_) => "alarm raised",
            PoolMessage::AlarmCleared(_) => "alarm cleared",
        }
    }
}

fn allocation_event<V: Into<PoolEntry> + Clone>(pool: &str, a: &Allocation<V>) -> AllocationEvent {
    AllocationEvent {
        pool: pool.to_string(),
        value: a.value.clone().into(),
        owner: a.owner.clone(),
        username: a.username.clone(),
        request_id: a.request_id.clone(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Consumer;

    #[test]
    fn test_message_serialization() {
        let subnet: Subnet = "10.0.0.0/25".parse().unwrap();
        let msg = PoolMessage::allocation_created(
            "lan",
            &Allocation::new(subnet, &Consumer::new("svc", "admin"), "k1"),
        );

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"AllocationCreated\""));
        assert!(json.contains("10.0.0.0/25"));

        let back: PoolMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pool(), "lan");
        assert_eq!(back.description(), "allocation created");
    }

    #[test]
    fn test_alarm_message_direction() {
        let raised = PoolMessage::alarm(
            "ids",
            AlarmTransition {
                kind: AlarmKind::Exhausted,
                raised: true,
            },
        );
        assert!(matches!(raised, PoolMessage::AlarmRaised(ref e) if e.text.contains("exhausted")));

        let cleared = PoolMessage::alarm(
            "ids",
            AlarmTransition {
                kind: AlarmKind::LowThreshold,
                raised: false,
            },
        );
        assert!(matches!(cleared, PoolMessage::AlarmCleared(_)));
    }

    #[test]
    fn test_entry_display() {
        assert_eq!(PoolEntry::from(5u64).to_string(), "5");
        assert_eq!(PoolEntry::from(Range::new(1u64, 4)).to_string(), "[1,4]");
    }
}
