//! Support utilities for [`keen_retry`]'s retry API.

use keen_retry::RetryResult;
use reqwest::StatusCode;

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Export the macros within the crate as if they were normal symbols.
pub(crate) use {try_fatal, try_potentially_transient};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Is this error a known transient error?
///
/// Errors are treated as permanent unless we know otherwise. Retrying a
/// malformed request with exponential backoff only wastes time.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, timeouts and truncated bodies are all worth
            // another try. A response we can't decode is not.
            self.is_timeout() || self.is_connect() || self.is_request() || self.is_body()
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [408, 409, 425, 429, 500, 502, 503, 504];
        transient_failures.contains(&self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        for code in [408, 409, 425, 429, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).expect("valid status");
            assert!(status.is_known_transient(), "{code} should be transient");
        }
        for code in [400, 401, 403, 404, 422] {
            let status = StatusCode::from_u16(code).expect("valid status");
            assert!(!status.is_known_transient(), "{code} should be fatal");
        }
    }
}
