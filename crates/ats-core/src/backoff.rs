use std::time::Duration;

/// What to do after an attempt failed with a transient port error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryAction {
    /// Rebind the serial driver, then retry immediately.
    Repair,
    /// Sleep, then retry.
    Wait(Duration),
}

/// Pure retry policy for transient serial-port failures.
///
/// Attempt 1 failing: repair the port once.
/// Attempt 2+ failing: fixed backoff.
/// Attempt `max_attempts` failing: give up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: Duration::from_secs(2) }
    }
}

impl RetryPolicy {
    /// `failed_attempt` is 1-based. `None` means the budget is spent.
    pub fn after_port_error(&self, failed_attempt: u32) -> Option<RetryAction> {
        if failed_attempt >= self.max_attempts {
            None
        } else if failed_attempt <= 1 {
            Some(RetryAction::Repair)
        } else {
            Some(RetryAction::Wait(self.backoff))
        }
    }
}
