// ABOUTME: Time-bounded claim giving one worker the right to advance a task
// ABOUTME: Enforces single-holder ownership and expiry before a step runs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{Result, SchedulingError};
use crate::operation::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker: String,
    pub claimed_at: Timestamp,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Lease {
    pub fn new(worker: impl Into<String>, claimed_at: Timestamp, duration: Duration) -> Self {
        Self {
            worker: worker.into(),
            claimed_at,
            duration,
        }
    }

    pub fn expires_at(&self) -> Timestamp {
        let secs = i64::try_from(self.duration.as_secs()).unwrap_or(i64::MAX);
        self.claimed_at.saturating_add(secs)
    }

    /// No grace period: the lease is gone at its expiry instant.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at()
    }

    pub fn verify_owner(&self, worker: &str) -> Result<()> {
        if self.worker != worker {
            return Err(SchedulingError::LeaseHeld {
                holder: self.worker.clone(),
                worker: worker.to_string(),
            });
        }
        Ok(())
    }

    /// `Ok` only for the holder while the lease is still live.
    pub fn check_holder(&self, worker: &str, now: Timestamp) -> Result<()> {
        self.verify_owner(worker)?;
        if self.is_expired(now) {
            return Err(SchedulingError::LeaseExpired {
                worker: self.worker.clone(),
                expired_at: self.expires_at(),
            });
        }
        Ok(())
    }

    /// Extends the lease from `now` for another full duration.
    pub fn renew(&mut self, now: Timestamp) {
        self.claimed_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_is_inclusive() {
        let lease = Lease::new("worker-a", 1000, Duration::from_secs(30));
        assert_eq!(lease.expires_at(), 1030);
        assert!(!lease.is_expired(1029));
        assert!(lease.is_expired(1030));
    }

    #[test]
    fn test_check_holder() {
        let lease = Lease::new("worker-a", 1000, Duration::from_secs(30));
        assert!(lease.check_holder("worker-a", 1010).is_ok());
        assert!(matches!(
            lease.check_holder("worker-b", 1010),
            Err(SchedulingError::LeaseHeld { .. })
        ));
        assert!(matches!(
            lease.check_holder("worker-a", 1031),
            Err(SchedulingError::LeaseExpired { expired_at: 1030, .. })
        ));
    }

    #[test]
    fn test_renew_moves_expiry() {
        let mut lease = Lease::new("worker-a", 1000, Duration::from_secs(30));
        lease.renew(1020);
        assert_eq!(lease.expires_at(), 1050);
    }

    #[test]
    fn test_duration_serializes_human_readable() {
        let lease = Lease::new("worker-a", 5, Duration::from_secs(90));
        let yaml = serde_yaml::to_string(&lease).unwrap();
        assert!(yaml.contains("1m 30s"));
        let back: Lease = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, lease);
    }
}
