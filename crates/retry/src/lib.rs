//! Drift retry governor: wraps remote calls with classification, jittered
//! exponential backoff, an attempt cap, and an independent wall-clock
//! deadline.
//!
//! Conflicts are deliberately NOT retried here: a stale patch must never be
//! re-sent blindly. The orchestrator owns the fresh-read/re-diff-then-retry
//! rule because only it can re-diff. NotFound-on-delete is likewise absorbed
//! by the delete wrapper before this governor sees it.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Instant;

use drift_core::{OperationToken, RetryPolicy, SyncError};
use metrics::counter;
use tracing::{debug, warn};

/// Operation class, used for logging and policy selection by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Read,
    Write,
    Wait,
}

impl OpClass {
    pub fn label(self) -> &'static str {
        match self {
            OpClass::Read => "read",
            OpClass::Write => "write",
            OpClass::Wait => "wait",
        }
    }
}

/// Successful call plus the number of underlying attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Classification table: only transient faults (timeouts, 5xx, connection
/// resets) are safe to replay verbatim.
pub fn retryable(err: &SyncError) -> bool {
    matches!(err, SyncError::Transient(_))
}

/// Run `call` until it succeeds, fails fatally, or the policy's attempt cap
/// or the wall-clock `deadline` is exceeded. Exhaustion surfaces
/// `RetryExhausted` carrying the last underlying cause.
pub async fn with_retry<T, F, Fut>(
    op: OpClass,
    policy: &RetryPolicy,
    token: OperationToken,
    deadline: Instant,
    mut call: F,
) -> Result<Retried<T>, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let seed = token.seed();
    let mut last: Option<SyncError> = None;
    let mut attempts = 0u32;

    while attempts < policy.max_attempts {
        if Instant::now() >= deadline {
            break;
        }
        attempts += 1;
        counter!("retry_attempts_total", 1u64);
        match call().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(op = op.label(), token = %token, attempts, "call recovered");
                }
                return Ok(Retried { value, attempts });
            }
            Err(e) if retryable(&e) => {
                let delay = policy.delay_for(attempts - 1, seed);
                warn!(op = op.label(), token = %token, attempt = attempts, error = %e, delay_ms = delay.as_millis() as u64, "transient failure; backing off");
                last = Some(e);
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(delay.min(remaining)).await;
            }
            Err(e) => return Err(e),
        }
    }

    counter!("retry_exhausted_total", 1u64);
    let cause = last.unwrap_or_else(|| {
        SyncError::Transient(format!("{} deadline elapsed before first attempt", op.label()))
    });
    Err(SyncError::RetryExhausted { attempts, cause: Box::new(cause) })
}

/// Deadline implied by a policy when the caller has no tighter one.
pub fn policy_deadline(policy: &RetryPolicy) -> Instant {
    Instant::now() + policy.deadline
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::Identity;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn transient_failures_then_success_records_attempts() {
        let p = fast_policy(5);
        let calls = AtomicU32::new(0);
        let out = with_retry(OpClass::Write, &p, OperationToken::fresh(), policy_deadline(&p), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::Transient("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out.value, 42);
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let p = fast_policy(5);
        let id = Identity::new("v1/ConfigMap", Some("ns"), "x");
        let calls = AtomicU32::new(0);
        let err = with_retry(OpClass::Write, &p, OperationToken::fresh(), policy_deadline(&p), || {
            calls.fetch_add(1, Ordering::SeqCst);
            let id = id.clone();
            async move {
                Err::<(), _>(SyncError::Permission { identity: id, detail: "rbac".into() })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Permission { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conflicts_are_not_blindly_retried() {
        let p = fast_policy(5);
        let id = Identity::new("v1/ConfigMap", Some("ns"), "x");
        let calls = AtomicU32::new(0);
        let err = with_retry(OpClass::Write, &p, OperationToken::fresh(), policy_deadline(&p), || {
            calls.fetch_add(1, Ordering::SeqCst);
            let id = id.clone();
            async move {
                Err::<(), _>(SyncError::Conflict { identity: id, expected: "1".into(), live: "2".into() })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_cap_surfaces_exhaustion_with_cause() {
        let p = fast_policy(3);
        let err = with_retry(OpClass::Read, &p, OperationToken::fresh(), policy_deadline(&p), || async {
            Err::<(), _>(SyncError::Transient("503".into()))
        })
        .await
        .unwrap_err();
        match err {
            SyncError::RetryExhausted { attempts, cause } => {
                assert_eq!(attempts, 3);
                assert_eq!(*cause, SyncError::Transient("503".into()));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wall_clock_deadline_terminates_before_attempt_cap() {
        let p = RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
            deadline: Duration::from_secs(60),
        };
        let deadline = Instant::now() + Duration::from_millis(60);
        let started = Instant::now();
        let err = with_retry(OpClass::Read, &p, OperationToken::fresh(), deadline, || async {
            Err::<(), _>(SyncError::Transient("timeout".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::RetryExhausted { .. }));
        assert!(started.elapsed() < Duration::from_secs(2), "must not hang");
    }
}
