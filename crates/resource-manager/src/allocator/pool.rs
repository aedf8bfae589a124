//! Behaviour shared by both pool kinds

use crate::alarm::{AlarmPolicy, AlarmTransition};
use crate::events::{PoolMessage, PoolObserver};
use crate::Result;
use std::sync::Arc;

/// Trait implemented by the id and address pools
///
/// The alarm operations are provided on top of the occupancy counters so
/// both pool kinds raise and clear alarms the same way.
pub trait ResourcePool: Send + Sync {
    /// Pool name
    fn name(&self) -> &str;

    /// Number of free values (ids or addresses)
    fn available_count(&self) -> u128;

    /// Size of the configured space
    fn total_size(&self) -> u128;

    /// Number of live allocations
    fn allocation_count(&self) -> usize;

    fn alarm_policy(&self) -> &AlarmPolicy;

    fn alarm_policy_mut(&mut self) -> &mut AlarmPolicy;

    fn observer(&self) -> &Arc<dyn PoolObserver>;

    /// Re-evaluate alarms against current occupancy
    fn review_alarms(&mut self) {
        let (available, total) = (self.available_count(), self.total_size());
        let changes = self.alarm_policy_mut().evaluate(available, total);
        self.publish_alarms(changes);
    }

    /// Enable alarms and evaluate immediately
    fn enable_alarms(&mut self) {
        let (available, total) = (self.available_count(), self.total_size());
        let changes = self.alarm_policy_mut().enable(available, total);
        self.publish_alarms(changes);
    }

    /// Disable alarms, clearing any that are raised
    fn disable_alarms(&mut self) {
        let changes = self.alarm_policy_mut().disable();
        self.publish_alarms(changes);
    }

    fn set_low_threshold(&mut self, threshold: u8) -> Result<()> {
        let (available, total) = (self.available_count(), self.total_size());
        let changes = self
            .alarm_policy_mut()
            .set_threshold(threshold, available, total)?;
        self.publish_alarms(changes);
        Ok(())
    }

    /// Apply an enabled flag and threshold in one step
    fn configure_alarms(&mut self, enabled: bool, threshold: u8) -> Result<()> {
        if !enabled {
            self.disable_alarms();
            return self.set_low_threshold(threshold);
        }
        self.set_low_threshold(threshold)?;
        if !self.alarm_policy().is_enabled() {
            self.enable_alarms();
        }
        Ok(())
    }

    /// Clear raised alarms before the pool goes away
    fn clear_alarms(&mut self) {
        let changes = self.alarm_policy_mut().clear_all();
        self.publish_alarms(changes);
    }

    fn publish_alarms(&self, changes: Vec<AlarmTransition>) {
        for change in changes {
            if change.raised {
                tracing::warn!(pool = %self.name(), alarm = ?change.kind, "Alarm raised");
            } else {
                tracing::info!(pool = %self.name(), alarm = ?change.kind, "Alarm cleared");
            }
            self.observer().notify(PoolMessage::alarm(self.name(), change));
        }
    }
}
