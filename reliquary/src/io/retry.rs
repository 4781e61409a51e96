//! Bounded retry for transient store failures.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::io::config::StoreConfig;
use crate::io::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra tries after the first.
    pub retries: u32,
    /// Delay before the first retry; doubled after each.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &StoreConfig) -> Self {
        Self {
            retries: cfg.write_retries,
            backoff: cfg.backoff(),
        }
    }

    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Run `f`, retrying only [`StoreError::Unavailable`].
    pub fn run<T>(
        &self,
        op: &str,
        mut f: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut delay = self.backoff;
        let mut attempt = 0u32;
        loop {
            match f() {
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(op, attempt, retries = self.retries, err = %err, "retrying store operation");
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    delay = delay.saturating_mul(2);
                }
                result => return result,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let mut calls = 0;
        let result = policy(3).run("commit", || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::Unavailable("disk busy".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn gives_up_after_retries() {
        let mut calls = 0;
        let result: Result<(), _> = policy(2).run("commit", || {
            calls += 1;
            Err(StoreError::Unavailable("disk busy".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn never_retries_conflicts() {
        let mut calls = 0;
        let result: Result<(), _> = policy(5).run("commit", || {
            calls += 1;
            Err(StoreError::Conflict {
                work_item_id: "W1".to_string(),
                expected: 0,
                actual: 1,
            })
        });
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
        assert_eq!(calls, 1);
    }
}
