//! Backoff policy: decides how long a loop sleeps after a poll.

use std::time::Duration;

/// Delay after `n` consecutive occurrences of the same poll outcome.
///
/// `multiplier == 1.0` gives a fixed interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first occurrence.
    pub base: Duration,

    pub multiplier: f64,

    /// Upper bound; `None` means unbounded.
    pub max: Option<Duration>,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            multiplier: 1.0,
            max: None,
        }
    }

    pub fn exponential(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max: Some(max),
        }
    }

    /// delay = base * multiplier^(occurrences - 1), capped at `max`.
    ///
    /// `occurrences` is 1-indexed; 0 is treated like 1.
    pub fn next_delay(&self, occurrences: u32) -> Duration {
        let exponent = occurrences.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = if delay_secs.is_finite() && delay_secs >= 0.0 {
            Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// A growing delay must be capped, and a shrinking one is never useful.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err("multiplier must be a finite number of at least 1.0");
        }
        if self.multiplier > 1.0 && self.max.is_none() {
            return Err("max is required when multiplier is above 1.0");
        }
        if let Some(max) = self.max
            && max < self.base
        {
            return Err("max must not be below base");
        }
        Ok(())
    }
}

/// Sleep policies of one worker loop, one per poll outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub not_leader: BackoffPolicy,
    pub idle: BackoffPolicy,
    pub fetch_error: BackoffPolicy,
}

impl PollPolicy {
    pub fn validate(&self) -> Result<(), String> {
        for (field, policy) in [
            ("not_leader", &self.not_leader),
            ("idle", &self.idle),
            ("fetch_error", &self.fetch_error),
        ] {
            policy
                .validate()
                .map_err(|reason| format!("poll.{field}: {reason}"))?;
        }
        Ok(())
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            not_leader: BackoffPolicy::fixed(Duration::from_secs(60)),
            idle: BackoffPolicy::fixed(Duration::from_secs(5)),
            fetch_error: BackoffPolicy::fixed(Duration::from_secs(10)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn fixed_policy_never_grows() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(5));
        assert_eq!(policy.next_delay(1), Duration::from_secs(5));
        assert_eq!(policy.next_delay(50), Duration::from_secs(5));
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 4)]
    #[case(5, 10)]
    #[case(40, 10)]
    fn exponential_policy_is_capped(#[case] occurrences: u32, #[case] expected_secs: u64) {
        let policy =
            BackoffPolicy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(10));
        assert_eq!(policy.next_delay(occurrences), Duration::from_secs(expected_secs));
    }

    #[rstest]
    #[case::fixed(BackoffPolicy::fixed(Duration::from_secs(5)), Ok(()))]
    #[case::capped(
        BackoffPolicy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(10)),
        Ok(())
    )]
    #[case::uncapped(
        BackoffPolicy { base: Duration::from_secs(1), multiplier: 2.0, max: None },
        Err("max is required when multiplier is above 1.0")
    )]
    #[case::shrinking(
        BackoffPolicy { base: Duration::from_secs(1), multiplier: 0.5, max: None },
        Err("multiplier must be a finite number of at least 1.0")
    )]
    #[case::nan(
        BackoffPolicy { base: Duration::from_secs(1), multiplier: f64::NAN, max: Some(Duration::from_secs(5)) },
        Err("multiplier must be a finite number of at least 1.0")
    )]
    #[case::max_below_base(
        BackoffPolicy::exponential(Duration::from_secs(10), 2.0, Duration::from_secs(1)),
        Err("max must not be below base")
    )]
    fn validate_rejects_runaway_policies(
        #[case] policy: BackoffPolicy,
        #[case] expected: Result<(), &'static str>,
    ) {
        assert_eq!(policy.validate(), expected);
    }

    #[test]
    fn poll_policy_names_the_bad_field() {
        let mut poll = PollPolicy::default();
        assert!(poll.validate().is_ok());

        poll.idle.multiplier = 3.0;
        assert_eq!(
            poll.validate(),
            Err("poll.idle: max is required when multiplier is above 1.0".to_string())
        );
    }

    #[test]
    fn default_poll_policy_matches_documented_intervals() {
        let poll = PollPolicy::default();
        assert_eq!(poll.not_leader.next_delay(1), Duration::from_secs(60));
        assert_eq!(poll.idle.next_delay(1), Duration::from_secs(5));
        assert_eq!(poll.fetch_error.next_delay(1), Duration::from_secs(10));
    }
}
