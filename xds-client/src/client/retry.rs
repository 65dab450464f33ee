//! Reconnect pacing for the ADS stream.

use std::time::Duration;

use crate::error::{Error, Result};

/// How long to wait between attempts to re-establish the ADS stream.
///
/// Delays grow geometrically from `initial_backoff` by `backoff_multiplier`
/// and stop growing at `max_backoff`. The defaults are 1s, 30s and 2.0 with
/// no attempt limit, the values gRPC uses for connection backoff.
///
/// ```
/// use xds_client::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_initial_backoff(Duration::from_millis(250)).unwrap()
///     .with_max_backoff(Duration::from_secs(10)).unwrap();
/// assert_eq!(policy.backoff_duration(2), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first paced retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor applied per attempt. At least 1.0.
    pub backoff_multiplier: f64,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<usize>,
}

fn check_initial(initial: Duration, max: Duration) -> Result<()> {
    if initial.is_zero() {
        return Err(Error::Validation("initial_backoff must be non-zero".into()));
    }
    if initial > max {
        return Err(Error::Validation(format!(
            "initial_backoff {initial:?} exceeds max_backoff {max:?}"
        )));
    }
    Ok(())
}

fn check_multiplier(multiplier: f64) -> Result<()> {
    if multiplier < 1.0 {
        return Err(Error::Validation(format!(
            "backoff_multiplier {multiplier} is below 1.0"
        )));
    }
    Ok(())
}

impl RetryPolicy {
    /// Build a policy with no attempt limit.
    ///
    /// Fails when `initial_backoff` is zero or above `max_backoff`, or when
    /// `backoff_multiplier` is below 1.0.
    ///
    /// ```
    /// use xds_client::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(60), 1.5)?;
    /// # Ok::<(), xds_client::Error>(())
    /// ```
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self> {
        check_initial(initial_backoff, max_backoff)?;
        check_multiplier(backoff_multiplier)?;
        Ok(Self {
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            max_attempts: None,
        })
    }

    /// Replace the first delay. It must be non-zero and within `max_backoff`.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Result<Self> {
        check_initial(duration, self.max_backoff)?;
        self.initial_backoff = duration;
        Ok(self)
    }

    /// Replace the delay cap. It may not drop below `initial_backoff`.
    pub fn with_max_backoff(mut self, duration: Duration) -> Result<Self> {
        check_initial(self.initial_backoff, duration)?;
        self.max_backoff = duration;
        Ok(self)
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Result<Self> {
        check_multiplier(multiplier)?;
        self.backoff_multiplier = multiplier;
        Ok(self)
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay for the zero-based `attempt`, or `None` once the attempt limit
    /// is reached.
    ///
    /// ```
    /// use xds_client::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// let delays: Vec<_> = (0..3).filter_map(|n| policy.backoff_duration(n)).collect();
    /// assert_eq!(delays, [1, 2, 4].map(Duration::from_secs));
    /// ```
    pub fn backoff_duration(&self, attempt: usize) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let scaled = self
            .initial_backoff
            .mul_f64(self.backoff_multiplier.powi(attempt as i32));
        Some(scaled.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Walks a [`RetryPolicy`] one reconnect at a time.
///
/// Right after construction or [`reset`](Backoff::reset) the next delay is
/// zero. Each later call takes the next step of the policy. The worker only
/// resets after a response arrives on the new stream, so a server that
/// accepts streams and then stays silent is still paced.
///
/// ```
/// use xds_client::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(RetryPolicy::default());
/// assert_eq!(backoff.next_backoff(), Some(Duration::ZERO));
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
/// backoff.reset();
/// assert_eq!(backoff.next_backoff(), Some(Duration::ZERO));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// The delay before the next attempt, or `None` when the policy's
    /// attempt limit is used up.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let delay = match self.attempt {
            0 if self.policy.max_attempts == Some(0) => return None,
            0 => Duration::ZERO,
            n => self.policy.backoff_duration(n - 1)?,
        };
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
