//! Drift reconciliation orchestrator.
//!
//! One entry point per intent: [`Engine::reconcile`] converges a desired
//! spec, [`Engine::remove`] converges on absence. Concurrent requests for
//! the same identity are coalesced when they ask for the same state and
//! superseded when they do not; at most one driver task mutates a given
//! identity at any time.

#![forbid(unsafe_code)]

pub mod kinds;

pub use kinds::{KindDescriptor, KindRegistry};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use drift_cluster::ClusterOps;
use drift_core::{
    Identity, ObservedState, OperationToken, Patch, ReconcileFailure, ResourceSpec, RetryPolicies,
    SyncError,
};
use drift_diff::{diff, IgnoreRules};
use drift_retry::{with_retry, OpClass};
use drift_wait::wait_until;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Engine tuning. `from_env` layers `DRIFT_*` knobs over the defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ignore: IgnoreRules,
    pub policies: RetryPolicies,
    /// On `AlreadyExists` during create: adopt the live object and update it
    /// instead of failing. Defaults to on.
    pub adopt_existing: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self { ignore: IgnoreRules::default(), policies: RetryPolicies::default(), adopt_existing: true }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::new();
        if let Some(n) = env_parse::<u32>("DRIFT_MAX_ATTEMPTS") {
            cfg.policies.read.max_attempts = n;
            cfg.policies.write.max_attempts = n;
        }
        if let Some(ms) = env_parse::<u64>("DRIFT_BASE_DELAY_MS") {
            cfg.policies.read.base_delay = Duration::from_millis(ms);
            cfg.policies.write.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("DRIFT_MAX_DELAY_MS") {
            cfg.policies.read.max_delay = Duration::from_millis(ms);
            cfg.policies.write.max_delay = Duration::from_millis(ms);
        }
        if let Some(s) = env_parse::<u64>("DRIFT_DEADLINE_SECS") {
            cfg.policies.read.deadline = Duration::from_secs(s);
            cfg.policies.write.deadline = Duration::from_secs(s);
        }
        if let Some(s) = env_parse::<u64>("DRIFT_WAIT_DEADLINE_SECS") {
            cfg.policies.wait.deadline = Duration::from_secs(s);
        }
        if let Some(b) = env_parse::<bool>("DRIFT_ADOPT_EXISTING") {
            cfg.adopt_existing = b;
        }
        cfg
    }
}

/// Terminal result of one driver task. `Ok(None)` only for remove intents.
type Outcome = Result<Option<ObservedState>, ReconcileFailure>;

enum Intent {
    Apply(ResourceSpec),
    Remove,
}

impl Intent {
    fn fingerprint(&self) -> u64 {
        match self {
            Intent::Apply(spec) => spec.fingerprint(),
            Intent::Remove => drift_core::fnv1a(b"absent"),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Intent::Apply(_) => "apply",
            Intent::Remove => "remove",
        }
    }
}

/// One in-flight operation on an identity.
#[derive(Clone)]
struct Slot {
    token: OperationToken,
    fingerprint: u64,
    outcome: watch::Receiver<Option<Outcome>>,
    cancel: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    superseded: Arc<AtomicBool>,
}

struct Inner {
    client: Arc<dyn ClusterOps>,
    kinds: KindRegistry,
    config: EngineConfig,
    slots: Mutex<FxHashMap<Identity, Slot>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(client: Arc<dyn ClusterOps>, kinds: KindRegistry, config: EngineConfig) -> Self {
        Self { inner: Arc::new(Inner { client, kinds, config, slots: Mutex::new(FxHashMap::default()) }) }
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.inner.kinds
    }

    /// Converge the cluster toward `spec` and return the settled observed
    /// state. Joins an identical in-flight operation instead of starting a
    /// second one; replaces a divergent in-flight operation.
    pub async fn reconcile(
        &self,
        spec: ResourceSpec,
        timeout: Duration,
    ) -> Result<ObservedState, ReconcileFailure> {
        let id = spec.identity.clone();
        match self.submit(id, Intent::Apply(spec), timeout).await {
            Ok(Some(obs)) => Ok(obs),
            Ok(None) => Err(ReconcileFailure::bare(SyncError::Internal(
                "apply settled without observed state".into(),
            ))),
            Err(f) => Err(f),
        }
    }

    /// Converge the identity toward absence. Already-absent is success.
    pub async fn remove(&self, id: Identity, timeout: Duration) -> Result<(), ReconcileFailure> {
        self.submit(id, Intent::Remove, timeout).await.map(|_| ())
    }

    /// Dry run: what would `reconcile` change right now. Never mutates and
    /// never touches the slot table.
    pub async fn plan(
        &self,
        spec: &ResourceSpec,
    ) -> Result<(Patch, Option<ObservedState>), ReconcileFailure> {
        let desc = match self.inner.kinds.descriptor(&spec.identity.gvk_key) {
            Some(d) => d,
            None => return Err(ReconcileFailure::bare(unknown_kind(&spec.identity))),
        };
        let token = OperationToken::fresh();
        let deadline = Instant::now() + self.inner.config.policies.read.deadline;
        let observed = read_current(&self.inner, &spec.identity, token, deadline)
            .await
            .map_err(ReconcileFailure::bare)?;
        let patch = diff(spec, observed.as_ref(), &desc.fields, &self.inner.config.ignore)
            .map_err(|e| ReconcileFailure::new(e, observed.clone()))?;
        Ok((patch, observed))
    }

    /// Request cancellation of the in-flight operation on `id`, if any.
    /// Returns whether there was one. Cancellation is cooperative; the
    /// caller observes it as a `Cancelled` outcome.
    pub async fn cancel(&self, id: &Identity) -> bool {
        let slots = self.inner.slots.lock().await;
        match slots.get(id) {
            Some(slot) => {
                slot.cancelled.store(true, Ordering::SeqCst);
                slot.cancel.notify_one();
                info!(identity = %id, token = %slot.token, "cancellation requested");
                true
            }
            None => false,
        }
    }

    async fn submit(&self, id: Identity, intent: Intent, timeout: Duration) -> Outcome {
        counter!("reconcile_requests_total", 1u64);
        let fingerprint = intent.fingerprint();
        let mut rx = {
            let mut slots = self.inner.slots.lock().await;
            match slots.get(&id) {
                Some(slot)
                    if slot.fingerprint == fingerprint
                        && !slot.cancelled.load(Ordering::SeqCst) =>
                {
                    counter!("reconcile_coalesced_total", 1u64);
                    debug!(identity = %id, token = %slot.token, "joining in-flight operation");
                    slot.outcome.clone()
                }
                Some(slot) => {
                    counter!("reconcile_superseded_total", 1u64);
                    info!(identity = %id, token = %slot.token, "superseding in-flight operation");
                    slot.superseded.store(true, Ordering::SeqCst);
                    slot.cancel.notify_one();
                    self.start(&mut slots, id.clone(), fingerprint, intent, timeout)
                }
                None => self.start(&mut slots, id.clone(), fingerprint, intent, timeout),
            }
        };

        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(ReconcileFailure::bare(SyncError::Internal(
                    "driver task dropped before settling".into(),
                )));
            }
        }
    }

    fn start(
        &self,
        slots: &mut FxHashMap<Identity, Slot>,
        id: Identity,
        fingerprint: u64,
        intent: Intent,
        timeout: Duration,
    ) -> watch::Receiver<Option<Outcome>> {
        let (tx, rx) = watch::channel(None);
        let token = OperationToken::fresh();
        let flags = Flags {
            cancel: Arc::new(Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            superseded: Arc::new(AtomicBool::new(false)),
        };
        slots.insert(
            id.clone(),
            Slot {
                token,
                fingerprint,
                outcome: rx.clone(),
                cancel: flags.cancel.clone(),
                cancelled: flags.cancelled.clone(),
                superseded: flags.superseded.clone(),
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let t0 = Instant::now();
            let intent_label = intent.label();
            info!(identity = %id, token = %token, intent = intent_label, "operation started");
            let outcome = drive(&inner, &id, token, intent, timeout, &flags).await;
            match &outcome {
                Ok(_) => {
                    info!(identity = %id, token = %token, intent = intent_label,
                        took_ms = %t0.elapsed().as_millis(), "operation settled");
                }
                Err(f) => {
                    counter!("reconcile_failed_total", 1u64);
                    warn!(identity = %id, token = %token, intent = intent_label,
                        error = %f.error, took_ms = %t0.elapsed().as_millis(), "operation failed");
                }
            }
            histogram!("reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
            let _ = tx.send(Some(outcome));
            // Release the identity only if this operation still owns it;
            // a superseding driver may have replaced the slot already.
            let mut slots = inner.slots.lock().await;
            if slots.get(&id).map(|s| s.token == token).unwrap_or(false) {
                slots.remove(&id);
            }
        });
        rx
    }
}

struct Flags {
    cancel: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    superseded: Arc<AtomicBool>,
}

impl Flags {
    fn interrupted(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.superseded.load(Ordering::SeqCst)
    }
}

fn unknown_kind(id: &Identity) -> SyncError {
    SyncError::SchemaMismatch {
        path: id.gvk_key.clone(),
        detail: "no descriptor registered for this kind".into(),
    }
}

async fn read_current(
    inner: &Inner,
    id: &Identity,
    token: OperationToken,
    deadline: Instant,
) -> Result<Option<ObservedState>, SyncError> {
    with_retry(OpClass::Read, &inner.config.policies.read, token, deadline, || {
        inner.client.get(id)
    })
    .await
    .map(|r| r.value)
}

async fn drive(
    inner: &Inner,
    id: &Identity,
    token: OperationToken,
    intent: Intent,
    timeout: Duration,
    flags: &Flags,
) -> Outcome {
    let deadline = Instant::now() + timeout;
    match intent {
        Intent::Apply(spec) => drive_apply(inner, id, token, spec, deadline, flags)
            .await
            .map(Some),
        Intent::Remove => drive_remove(inner, id, token, deadline, flags).await.map(|_| None),
    }
}

async fn drive_apply(
    inner: &Inner,
    id: &Identity,
    token: OperationToken,
    spec: ResourceSpec,
    deadline: Instant,
    flags: &Flags,
) -> Result<ObservedState, ReconcileFailure> {
    let desc = inner
        .kinds
        .descriptor(&id.gvk_key)
        .ok_or_else(|| ReconcileFailure::bare(unknown_kind(id)))?;

    debug!(identity = %id, token = %token, phase = "diffing", "reading live state");
    let mut observed = read_current(inner, id, token, deadline)
        .await
        .map_err(ReconcileFailure::bare)?;
    if flags.interrupted() {
        return Err(ReconcileFailure::new(SyncError::Cancelled, observed));
    }
    let mut patch = diff(&spec, observed.as_ref(), &desc.fields, &inner.config.ignore)
        .map_err(|e| ReconcileFailure::new(e, observed.clone()))?;
    let summary = patch.summary();
    debug!(identity = %id, token = %token, adds = summary.adds, replaces = summary.replaces,
        removes = summary.removes, "patch computed");

    let mut adopted = false;
    let mut conflict_retried = false;
    let applied: ObservedState = loop {
        if flags.interrupted() {
            return Err(ReconcileFailure::new(SyncError::Cancelled, observed));
        }
        if patch.is_noop() {
            match observed.clone() {
                Some(obs) => {
                    debug!(identity = %id, token = %token, "already converged");
                    break obs;
                }
                None => {
                    return Err(ReconcileFailure::bare(SyncError::Internal(
                        "empty patch against an absent object".into(),
                    )))
                }
            }
        }

        let result = match &observed {
            None => {
                debug!(identity = %id, token = %token, phase = "applying", "creating");
                with_retry(OpClass::Write, &inner.config.policies.write, token, deadline, || {
                    inner.client.create(&spec)
                })
                .await
                .map(|r| r.value)
            }
            Some(obs) => {
                let Some(rv) = obs.resource_version.clone() else {
                    return Err(ReconcileFailure::new(
                        SyncError::Internal(format!("live {id} carries no resourceVersion")),
                        Some(obs.clone()),
                    ));
                };
                debug!(identity = %id, token = %token, phase = "applying", rv = %rv, "updating");
                with_retry(OpClass::Write, &inner.config.policies.write, token, deadline, || {
                    inner.client.update(&spec, &patch, &rv)
                })
                .await
                .map(|r| r.value)
            }
        };

        match result {
            Ok(obs) => break obs,
            Err(SyncError::AlreadyExists(_)) if inner.config.adopt_existing && !adopted => {
                adopted = true;
                counter!("reconcile_adopted_total", 1u64);
                info!(identity = %id, token = %token, "live object found during create; adopting");
                (observed, patch) =
                    refresh(inner, id, token, &spec, desc, deadline, observed).await?;
            }
            Err(SyncError::Conflict { .. }) if !conflict_retried => {
                conflict_retried = true;
                counter!("reconcile_conflicts_total", 1u64);
                info!(identity = %id, token = %token, "version conflict; re-reading and re-diffing");
                (observed, patch) =
                    refresh(inner, id, token, &spec, desc, deadline, observed).await?;
            }
            Err(e) => return Err(ReconcileFailure::new(e, observed)),
        }
    };

    let settled = match &desc.readiness {
        None => applied,
        Some(check) if (check.ready)(&applied) => applied,
        Some(check) => {
            debug!(identity = %id, token = %token, phase = "waiting", "polling for readiness");
            wait_until(
                inner.client.as_ref(),
                id,
                check,
                &inner.config.policies.wait,
                token,
                deadline,
                flags.cancel.as_ref(),
            )
            .await
            .map_err(|e| ReconcileFailure::new(e, Some(applied.clone())))?
        }
    };
    if flags.interrupted() {
        return Err(ReconcileFailure::new(SyncError::Cancelled, Some(settled)));
    }
    Ok(settled)
}

/// Fresh read plus re-diff, shared by the adopt and conflict recovery arms.
async fn refresh(
    inner: &Inner,
    id: &Identity,
    token: OperationToken,
    spec: &ResourceSpec,
    desc: &KindDescriptor,
    deadline: Instant,
    previous: Option<ObservedState>,
) -> Result<(Option<ObservedState>, Patch), ReconcileFailure> {
    let observed = match read_current(inner, id, token, deadline).await {
        Ok(o) => o,
        Err(e) => return Err(ReconcileFailure::new(e, previous)),
    };
    let patch = diff(spec, observed.as_ref(), &desc.fields, &inner.config.ignore)
        .map_err(|e| ReconcileFailure::new(e, observed.clone()))?;
    Ok((observed, patch))
}

async fn drive_remove(
    inner: &Inner,
    id: &Identity,
    token: OperationToken,
    deadline: Instant,
    flags: &Flags,
) -> Result<(), ReconcileFailure> {
    debug!(identity = %id, token = %token, phase = "diffing", "reading live state");
    let observed = read_current(inner, id, token, deadline)
        .await
        .map_err(ReconcileFailure::bare)?;
    let Some(obs) = observed else {
        debug!(identity = %id, token = %token, "already absent");
        return Ok(());
    };

    let mut expected = obs.resource_version.clone();
    let mut last = obs;
    let mut conflict_retried = false;
    loop {
        if flags.interrupted() {
            return Err(ReconcileFailure::new(SyncError::Cancelled, Some(last)));
        }
        debug!(identity = %id, token = %token, phase = "applying", "deleting");
        let client = Arc::clone(&inner.client);
        let target = id.clone();
        let want = expected.clone();
        let result = with_retry(OpClass::Write, &inner.config.policies.write, token, deadline, || {
            let client = Arc::clone(&client);
            let target = target.clone();
            let want = want.clone();
            async move {
                // Absence is the goal; a concurrent delete is success.
                match client.delete(&target, want.as_deref()).await {
                    Err(SyncError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
        })
        .await;

        match result {
            Ok(_) => return Ok(()),
            Err(SyncError::Conflict { .. }) if !conflict_retried => {
                conflict_retried = true;
                counter!("reconcile_conflicts_total", 1u64);
                info!(identity = %id, token = %token, "version conflict on delete; re-reading");
                match read_current(inner, id, token, deadline).await {
                    Ok(None) => return Ok(()),
                    Ok(Some(fresh)) => {
                        expected = fresh.resource_version.clone();
                        last = fresh;
                    }
                    Err(e) => return Err(ReconcileFailure::new(e, Some(last))),
                }
            }
            Err(e) => return Err(ReconcileFailure::new(e, Some(last))),
        }
    }
}
