//! Generic retry-with-backoff helper for filesystem operations that can
//! transiently fail (e.g. copying a file while another process holds it
//! open briefly).

use std::thread;
use std::time::Duration;

/// Number of attempts made by [`with_backoff`] before giving up.
const DEFAULT_ATTEMPTS: u32 = 3;

/// Delay between attempts, in milliseconds.
const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Run `operation` up to [`DEFAULT_ATTEMPTS`] times, sleeping
/// [`DEFAULT_BACKOFF`] between attempts, returning the first success or the
/// last error.
///
/// # Errors
///
/// Returns whatever error `operation` returns on its final attempt.
pub fn with_backoff<T, E>(mut operation: impl FnMut() -> Result<T, E>) -> Result<T, E> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation() {
            Ok(value) => return Ok(value),
            Err(_) if attempt < DEFAULT_ATTEMPTS => {
                thread::sleep(DEFAULT_BACKOFF);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn returns_ok_immediately_on_first_success() {
        let calls = Cell::new(0);
        let result: Result<u32, &str> = with_backoff(|| {
            calls.set(calls.get() + 1);
            Ok(42)
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retries_until_success_within_attempt_budget() {
        let calls = Cell::new(0);
        let result: Result<u32, &str> = with_backoff(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err("transient") } else { Ok(7) }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn returns_last_error_after_exhausting_attempts() {
        let calls = Cell::new(0);
        let result: Result<u32, &str> = with_backoff(|| {
            calls.set(calls.get() + 1);
            Err("permanent")
        });
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.get(), DEFAULT_ATTEMPTS);
    }
}
