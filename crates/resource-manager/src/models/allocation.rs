//! Allocation records

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Who asked for an allocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Consumer {
    /// Reference to the consuming service instance, empty when unknown
    pub owner: String,
    /// User on whose behalf the consumer runs
    pub username: String,
}

impl Consumer {
    pub fn new(owner: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            username: username.into(),
        }
    }

    /// Consumers without an owner reference are never notified
    pub fn is_notifiable(&self) -> bool {
        !self.owner.is_empty()
    }
}

/// A value handed out by a pool
///
/// Identity is the value alone; the metadata describes who holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation<V> {
    pub value: V,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub username: String,
    /// Allocation key of the request that produced it
    #[serde(default)]
    pub request_id: String,
}

impl<V> Allocation<V> {
    pub fn new(value: V, consumer: &Consumer, request_id: impl Into<String>) -> Self {
        Self {
            value,
            owner: consumer.owner.clone(),
            username: consumer.username.clone(),
            request_id: request_id.into(),
        }
    }

    /// Allocation without any metadata
    pub fn bare(value: V) -> Self {
        Self {
            value,
            owner: String::new(),
            username: String::new(),
            request_id: String::new(),
        }
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(self.owner.clone(), self.username.clone())
    }
}

impl<V: PartialEq> PartialEq for Allocation<V> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<V: Eq> Eq for Allocation<V> {}

impl<V: Hash> Hash for Allocation<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<V: Ord> PartialOrd for Allocation<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V: Ord> Ord for Allocation<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}
