//! Exhaustion and low-threshold hysteresis

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default low-threshold percentage
pub const DEFAULT_LOW_THRESHOLD: u8 = 10;

/// Alarm raised by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    /// No free value left
    Exhausted,
    /// Free capacity at or below the configured percentage
    LowThreshold,
}

/// Summary state of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Disabled,
    Normal,
    Low,
    Exhausted,
}

/// A single alarm changing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmTransition {
    pub kind: AlarmKind,
    pub raised: bool,
}

impl AlarmTransition {
    fn raise(kind: AlarmKind) -> Self {
        Self { kind, raised: true }
    }

    fn clear(kind: AlarmKind) -> Self {
        Self {
            kind,
            raised: false,
        }
    }
}

/// Hysteresis state machine for one pool
///
/// Exhausted is raised at zero available values. Low is raised once the
/// available count drops to `total * threshold / 100` (rounded down) and
/// stays raised until the count is strictly above that boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmPolicy {
    enabled: bool,
    threshold: u8,
    exhausted_raised: bool,
    low_raised: bool,
}

impl Default for AlarmPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: DEFAULT_LOW_THRESHOLD,
            exhausted_raised: false,
            low_raised: false,
        }
    }
}

impl AlarmPolicy {
    /// Create a policy; nothing is raised until the first evaluation
    pub fn new(enabled: bool, threshold: u8) -> Result<Self> {
        check_threshold(threshold)?;
        Ok(Self {
            enabled,
            threshold,
            ..Self::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn is_exhausted_raised(&self) -> bool {
        self.exhausted_raised
    }

    pub fn is_low_raised(&self) -> bool {
        self.low_raised
    }

    pub fn state(&self) -> AlarmState {
        if !self.enabled {
            AlarmState::Disabled
        } else if self.exhausted_raised {
            AlarmState::Exhausted
        } else if self.low_raised {
            AlarmState::Low
        } else {
            AlarmState::Normal
        }
    }

    /// Largest available count that still counts as low
    pub fn low_boundary(&self, total: u128) -> u128 {
        let t = self.threshold as u128;
        (total / 100) * t + (total % 100) * t / 100
    }

    /// Re-evaluate against current occupancy
    ///
    /// Does nothing while disabled.
    pub fn evaluate(&mut self, available: u128, total: u128) -> Vec<AlarmTransition> {
        if !self.enabled {
            return Vec::new();
        }
        let mut changes = Vec::new();

        let exhausted = available == 0;
        if exhausted != self.exhausted_raised {
            self.exhausted_raised = exhausted;
            changes.push(if exhausted {
                AlarmTransition::raise(AlarmKind::Exhausted)
            } else {
                AlarmTransition::clear(AlarmKind::Exhausted)
            });
        }

        let low = available <= self.low_boundary(total);
        if low != self.low_raised {
            self.low_raised = low;
            changes.push(if low {
                AlarmTransition::raise(AlarmKind::LowThreshold)
            } else {
                AlarmTransition::clear(AlarmKind::LowThreshold)
            });
        }

        changes
    }

    /// Enable and evaluate immediately
    pub fn enable(&mut self, available: u128, total: u128) -> Vec<AlarmTransition> {
        self.enabled = true;
        self.evaluate(available, total)
    }

    /// Disable, clearing whatever is raised without re-evaluating
    pub fn disable(&mut self) -> Vec<AlarmTransition> {
        self.enabled = false;
        self.clear_all()
    }

    /// Change the threshold and re-evaluate
    pub fn set_threshold(
        &mut self,
        threshold: u8,
        available: u128,
        total: u128,
    ) -> Result<Vec<AlarmTransition>> {
        check_threshold(threshold)?;
        self.threshold = threshold;
        Ok(self.evaluate(available, total))
    }

    /// Clear every raised alarm, leaving `enabled` unchanged
    pub fn clear_all(&mut self) -> Vec<AlarmTransition> {
        let mut changes = Vec::new();
        if self.exhausted_raised {
            self.exhausted_raised = false;
            changes.push(AlarmTransition::clear(AlarmKind::Exhausted));
        }
        if self.low_raised {
            self.low_raised = false;
            changes.push(AlarmTransition::clear(AlarmKind::LowThreshold));
        }
        changes
    }
}

fn check_threshold(threshold: u8) -> Result<()> {
    if threshold > 100 {
        return Err(Error::InvalidRange(format!(
            "low threshold must be within [0-100], got {}",
            threshold
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_threshold_boundary() {
        let mut policy = AlarmPolicy::new(true, 10).unwrap();

        assert!(policy.evaluate(11, 100).is_empty());
        assert_eq!(policy.state(), AlarmState::Normal);

        let changes = policy.evaluate(10, 100);
        assert_eq!(changes, vec![AlarmTransition::raise(AlarmKind::LowThreshold)]);
        assert_eq!(policy.state(), AlarmState::Low);

        // boundary value itself stays low
        assert!(policy.evaluate(10, 100).is_empty());
        assert!(policy.is_low_raised());

        let changes = policy.evaluate(11, 100);
        assert_eq!(changes, vec![AlarmTransition::clear(AlarmKind::LowThreshold)]);
    }

    #[test]
    fn test_exhausted_implies_low() {
        let mut policy = AlarmPolicy::new(true, 10).unwrap();
        let changes = policy.evaluate(0, 100);
        assert_eq!(changes.len(), 2);
        assert_eq!(policy.state(), AlarmState::Exhausted);
        assert!(policy.is_low_raised());

        let changes = policy.evaluate(1, 100);
        assert_eq!(changes, vec![AlarmTransition::clear(AlarmKind::Exhausted)]);
        assert_eq!(policy.state(), AlarmState::Low);
    }

    #[test]
    fn test_disable_clears_without_evaluating() {
        let mut policy = AlarmPolicy::new(true, 10).unwrap();
        policy.evaluate(0, 100);
        let changes = policy.disable();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| !c.raised));
        assert_eq!(policy.state(), AlarmState::Disabled);

        assert!(policy.evaluate(0, 100).is_empty());
        assert!(!policy.is_exhausted_raised());

        let changes = policy.enable(0, 100);
        assert_eq!(changes.len(), 2);
        assert!(policy.is_exhausted_raised());
    }

    #[test]
    fn test_set_threshold_reevaluates() {
        let mut policy = AlarmPolicy::new(true, 10).unwrap();
        policy.evaluate(20, 100);
        assert_eq!(policy.state(), AlarmState::Normal);

        let changes = policy.set_threshold(20, 20, 100).unwrap();
        assert_eq!(changes, vec![AlarmTransition::raise(AlarmKind::LowThreshold)]);
        assert!(policy.set_threshold(101, 20, 100).is_err());
        assert_eq!(policy.threshold(), 20);
    }

    #[test]
    fn test_low_boundary_large_totals() {
        let policy = AlarmPolicy::new(true, 50).unwrap();
        assert_eq!(policy.low_boundary(u128::MAX), u128::MAX / 2);
        assert_eq!(policy.low_boundary(7), 3);
        assert_eq!(AlarmPolicy::new(true, 0).unwrap().low_boundary(1000), 0);
    }
}
