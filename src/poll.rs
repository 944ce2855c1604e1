//! Blocking convergence polling with an explicit interval and bound.
//!
//! The original readiness and new-block waits were unbounded loops; here the
//! interval and (optional) maximum duration are part of the call contract.

use std::time::{Duration, Instant};

use crate::error::{HarnessError, Result};

/// How often chain height is re-read while waiting for a new block.
pub const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Runs `op` immediately and then once per `interval` tick until it yields
/// `Ok(Some(_))`. `Ok(None)` means "not yet"; errors propagate immediately,
/// so a transient RPC failure mid-poll is never masked. With `max_wait` set,
/// gives up with [`HarnessError::Timeout`] once another sleep would cross the
/// bound; `None` polls forever, which is the original harness's behavior.
pub fn poll<T, F>(
    interval: Duration,
    max_wait: Option<Duration>,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let started = Instant::now();
    loop {
        if let Some(value) = op()? {
            return Ok(value);
        }
        if let Some(limit) = max_wait {
            if started.elapsed() + interval > limit {
                return Err(HarnessError::Timeout {
                    waited: started.elapsed(),
                    what: what.to_string(),
                });
            }
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_first_success() {
        let mut calls = 0;
        let result = poll(Duration::from_millis(1), None, "three tries", || {
            calls += 1;
            Ok((calls == 3).then_some(calls))
        })
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn bounded_wait_times_out() {
        let err = poll(
            Duration::from_millis(5),
            Some(Duration::from_millis(20)),
            "never",
            || Ok(None::<()>),
        )
        .unwrap_err();
        match err {
            HarnessError::Timeout { what, .. } => assert_eq!(what, "never"),
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[test]
    fn errors_propagate_without_retry() {
        let mut calls = 0;
        let err = poll(Duration::from_millis(1), None, "fails", || {
            calls += 1;
            Err::<Option<()>, _>(HarnessError::Bootstrap("broken".to_string()))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, HarnessError::Bootstrap(_)));
    }
}
