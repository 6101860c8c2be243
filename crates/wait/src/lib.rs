//! Drift readiness poller: re-reads an object at increasing intervals until
//! its target condition holds, a terminal failure shows up in status, the
//! deadline elapses, or the caller cancels.

#![forbid(unsafe_code)]

use std::time::Instant;

use drift_cluster::ClusterOps;
use drift_core::{Identity, ObservedState, OperationToken, RetryPolicy, SyncError};
use metrics::{counter, histogram};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Per-kind readiness descriptor: when is the object usable, and what status
/// means it never will be. Plain fn pointers keep descriptors copyable
/// records rather than trait hierarchies.
#[derive(Clone, Copy)]
pub struct ReadinessCheck {
    pub ready: fn(&ObservedState) -> bool,
    /// Terminal failure detector; `Some((reason, message))` aborts the wait
    /// immediately with `ResourceFailed` instead of running out the clock.
    pub failed: fn(&ObservedState) -> Option<(String, String)>,
}

impl ReadinessCheck {
    pub fn new(ready: fn(&ObservedState) -> bool) -> Self {
        Self { ready, failed: |_| None }
    }

    pub fn with_failure(ready: fn(&ObservedState) -> bool, failed: fn(&ObservedState) -> Option<(String, String)>) -> Self {
        Self { ready, failed }
    }
}

/// Poll `client.get(id)` until `check.ready` holds.
///
/// Cancellation stops the loop before the next read and surfaces
/// `Cancelled`, distinct from the deadline's `RetryExhausted`. Transient
/// read errors are tolerated and ride the same backoff; other read errors
/// surface as-is.
pub async fn wait_until(
    client: &dyn ClusterOps,
    id: &Identity,
    check: &ReadinessCheck,
    policy: &RetryPolicy,
    token: OperationToken,
    deadline: Instant,
    cancel: &Notify,
) -> Result<ObservedState, SyncError> {
    let t0 = Instant::now();
    let seed = token.seed();
    let mut polls = 0u32;
    let mut last_transient: Option<SyncError> = None;

    loop {
        if Instant::now() >= deadline {
            break;
        }
        polls += 1;
        counter!("wait_polls_total", 1u64);

        let read = tokio::select! {
            _ = cancel.notified() => {
                info!(identity = %id, token = %token, polls, "wait cancelled");
                return Err(SyncError::Cancelled);
            }
            r = client.get(id) => r,
        };

        match read {
            Ok(Some(obs)) => {
                if let Some((reason, message)) = (check.failed)(&obs) {
                    counter!("wait_failed_total", 1u64);
                    return Err(SyncError::ResourceFailed { reason, message });
                }
                if (check.ready)(&obs) {
                    histogram!("wait_ready_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    info!(identity = %id, token = %token, polls, took_ms = %t0.elapsed().as_millis(), "condition satisfied");
                    return Ok(obs);
                }
                debug!(identity = %id, polls, "not ready yet");
            }
            Ok(None) => return Err(SyncError::NotFound(id.clone())),
            Err(e) if matches!(e, SyncError::Transient(_)) => {
                debug!(identity = %id, error = %e, "transient read during wait");
                last_transient = Some(e);
            }
            Err(e) => return Err(e),
        }

        let delay = policy.delay_for(polls.saturating_sub(1), seed);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            _ = cancel.notified() => {
                info!(identity = %id, token = %token, polls, "wait cancelled during backoff");
                return Err(SyncError::Cancelled);
            }
            _ = tokio::time::sleep(delay.min(remaining)) => {}
        }
    }

    counter!("wait_deadline_total", 1u64);
    let cause = last_transient
        .unwrap_or_else(|| SyncError::Transient(format!("{id} not ready after {polls} polls")));
    Err(SyncError::RetryExhausted { attempts: polls, cause: Box::new(cause) })
}
