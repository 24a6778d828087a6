//! Retry policy for the in-process retry envelope.
//!
//! The policy is an explicit list of waits, not a formula, so timings stay
//! exact. `schedule.len() == max_attempts - 1` always holds.

use std::time::Duration;

use crate::error::WorkerError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            schedule: vec![Duration::from_secs(1), Duration::from_secs(3)],
        }
    }
}

impl RetryPolicy {
    /// Build a policy from a backoff schedule. Attempts = schedule length + 1.
    pub fn from_schedule(schedule: Vec<Duration>) -> Self {
        Self {
            max_attempts: schedule.len() as u32 + 1,
            schedule,
        }
    }

    /// Build a policy with an explicit attempt count, checking the coupling.
    pub fn new(max_attempts: u32, schedule: Vec<Duration>) -> Result<Self, WorkerError> {
        if max_attempts == 0 {
            return Err(WorkerError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if schedule.len() as u32 != max_attempts - 1 {
            return Err(WorkerError::InvalidPolicy(format!(
                "schedule has {} entries, expected {} for {} attempts",
                schedule.len(),
                max_attempts - 1,
                max_attempts
            )));
        }
        Ok(Self {
            max_attempts,
            schedule,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn schedule(&self) -> &[Duration] {
        &self.schedule
    }

    /// Wait before the attempt following failed `attempt` (1-based).
    ///
    /// `None` once `attempt` is the last one.
    pub fn backoff_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        self.schedule.get(attempt as usize - 1).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.backoff_after(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff_after(2), Some(Duration::from_secs(3)));
        assert_eq!(policy.backoff_after(3), None);
        assert_eq!(policy.backoff_after(0), None);
    }

    #[test]
    fn test_schedule_must_match_attempts() {
        assert!(RetryPolicy::new(3, vec![Duration::from_secs(1)]).is_err());
        assert!(RetryPolicy::new(0, Vec::new()).is_err());
        assert!(RetryPolicy::new(
            3,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(10)
            ]
        )
        .is_err());

        let single = RetryPolicy::new(1, Vec::new()).unwrap();
        assert_eq!(single.backoff_after(1), None);
    }

    #[test]
    fn test_from_schedule_derives_attempts() {
        let policy = RetryPolicy::from_schedule(vec![Duration::from_millis(5); 4]);
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.backoff_after(4), Some(Duration::from_millis(5)));
    }
}
