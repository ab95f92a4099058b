use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::AdapterError;

/// Transport-level retry for transient HTTP failures. The workflow engine
/// carries its own degradation budget on top of this.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub sleep: Duration,
}

impl RetryConfig {
    pub const fn new(max_retries: usize, sleep: Duration) -> Self {
        Self { max_retries, sleep }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            sleep: Duration::from_secs(2),
        }
    }
}

pub fn call_with_retry<F, T>(mut f: F, config: &RetryConfig) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=config.max_retries.max(1) {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    "[call_with_retry] attempt {}/{} failed: {}",
                    attempt, config.max_retries, err
                );
                if attempt < config.max_retries {
                    thread::sleep(config.sleep);
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(config.max_retries, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn returns_first_success() {
        let calls = Cell::new(0usize);
        let config = RetryConfig::new(3, Duration::ZERO);
        let result = call_with_retry(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 2 {
                    Err(AdapterError::EmptyResponse)
                } else {
                    Ok("ok")
                }
            },
            &config,
        );
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn exhaustion_reports_attempt_count() {
        let config = RetryConfig::new(3, Duration::ZERO);
        let result: Result<(), _> = call_with_retry(|| Err(AdapterError::EmptyResponse), &config);
        match result.unwrap_err() {
            AdapterError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }
}
