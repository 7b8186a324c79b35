//! Polling policy for the dependency wait.
//!
//! A fixed number of attempts separated by a fixed delay. Exhausting the
//! attempts is a failure, never a partial success.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of dependency polls before a run is aborted.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// Default delay between two dependency polls.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// Bounded fixed-delay polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,

    /// Fixed delay between attempts.
    #[serde(with = "serde_duration", rename = "delay_secs")]
    pub delay: Duration,
}

impl PollPolicy {
    /// Create a policy with the given bound and delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Whether another attempt may follow `attempt` (1-based).
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Upper bound on the time spent waiting, ignoring poll latency.
    pub fn total_wait(&self) -> Duration {
        self.delay * self.max_attempts
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_DELAY)
    }
}

/// Serializes Duration as whole seconds (matching the YAML settings).
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_waits_ten_minutes() {
        let policy = PollPolicy::default();
        assert_eq!(policy.max_attempts, 60);
        assert_eq!(policy.delay, Duration::from_secs(10));
        assert_eq!(policy.total_wait(), Duration::from_secs(600));
    }

    #[test]
    fn test_has_next() {
        let policy = PollPolicy::fixed(3, Duration::ZERO);
        assert!(policy.has_next(1));
        assert!(policy.has_next(2));
        assert!(!policy.has_next(3));
    }

    #[test]
    fn test_serde_uses_seconds() {
        let policy = PollPolicy::fixed(5, Duration::from_secs(2));
        let yaml = serde_yaml::to_string(&policy).unwrap();
        assert!(yaml.contains("delay_secs: 2"));

        let parsed: PollPolicy = serde_yaml::from_str("max_attempts: 4\ndelay_secs: 1\n").unwrap();
        assert_eq!(parsed, PollPolicy::fixed(4, Duration::from_secs(1)));
    }
}
