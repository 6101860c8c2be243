//! Drift core types: identities, desired/observed state, patches, retry
//! policies and the error taxonomy shared by every crate in the workspace.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

/// Logical identity of one cluster object: GVK key + namespace + name.
///
/// The GVK key follows the `v1/Kind` / `group/v1/Kind` convention used
/// throughout the CLI and the kind registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Identity {
    pub gvk_key: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl Identity {
    pub fn new(gvk_key: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            gvk_key: gvk_key.into(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk_key, ns, self.name),
            None => write!(f, "{} {}", self.gvk_key, self.name),
        }
    }
}

/// Desired state for one object. Immutable once handed to the engine for a
/// reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub identity: Identity,
    /// Desired field tree (JSON object).
    pub fields: Json,
    /// Optimistic-concurrency token from a previous read, if any.
    pub resource_version: Option<String>,
}

impl ResourceSpec {
    /// Stable fingerprint over the desired field tree, used to decide
    /// whether a second reconcile request can coalesce onto an in-flight one.
    pub fn fingerprint(&self) -> u64 {
        // serde_json keeps object keys sorted, so the rendering is canonical.
        let rendered = self.fields.to_string();
        fnv1a(rendered.as_bytes())
    }
}

/// One status condition as read from the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "lastTransitionTime")]
    pub last_transition_time: Option<String>,
}

/// Actual state as last read from the cluster. Produced fresh on each read
/// and replaced wholesale, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedState {
    pub identity: Identity,
    pub fields: Json,
    pub resource_version: Option<String>,
    pub conditions: Vec<Condition>,
}

impl ObservedState {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Look up a dotted status/spec path in the raw field tree.
    pub fn field(&self, path: &str) -> Option<&Json> {
        let segs: Vec<String> = path.split('.').map(|s| s.to_string()).collect();
        get_path(&self.fields, &segs)
    }
}

/// Field-level patch operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

/// One field-level edit. `path` is a list of object keys from the root; an
/// empty path addresses the whole object (used for creates).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchEntry {
    pub path: Vec<String>,
    pub op: PatchOp,
    pub value: Option<Json>,
}

impl PatchEntry {
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }
}

/// Derived set of field edits. Must be empty when desired == observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Patch {
    pub entries: Vec<PatchEntry>,
}

/// Counters for humanized patch output.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchSummary {
    pub adds: usize,
    pub replaces: usize,
    pub removes: usize,
}

impl Patch {
    pub fn is_noop(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the patch is a single whole-object add (absent observed).
    pub fn is_create(&self) -> bool {
        matches!(self.entries.as_slice(), [e] if e.path.is_empty() && e.op == PatchOp::Add)
    }

    pub fn summary(&self) -> PatchSummary {
        let mut s = PatchSummary::default();
        for e in &self.entries {
            match e.op {
                PatchOp::Add => s.adds += 1,
                PatchOp::Replace => s.replaces += 1,
                PatchOp::Remove => s.removes += 1,
            }
        }
        s
    }

    /// Apply the edits to a field tree. Used by the in-memory cluster mock
    /// and by convergence tests; the real executor sends the merged object.
    pub fn apply_to(&self, root: &mut Json) {
        for e in &self.entries {
            match e.op {
                PatchOp::Add | PatchOp::Replace => {
                    if let Some(v) = &e.value {
                        set_path(root, &e.path, v.clone());
                    }
                }
                PatchOp::Remove => remove_path(root, &e.path),
            }
        }
    }
}

/// Opaque identifier correlating one reconciliation attempt with its
/// in-flight remote calls. Retired at terminal state or when superseded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OperationToken(Uuid);

impl OperationToken {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// Stable seed for deterministic backoff jitter.
    pub fn seed(&self) -> u64 {
        fnv1a(self.0.as_bytes())
    }
}

impl fmt::Display for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backoff shape for one operation class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction in [0, 1): each delay is scaled by `1 ± jitter`.
    pub jitter: f64,
    /// Wall-clock cap, enforced independently of the attempt cap.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
            deadline: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// `min(max_delay, base * 2^attempt)` scaled by a deterministic jitter
    /// factor derived from `(seed, attempt)`.
    pub fn delay_for(&self, attempt: u32, seed: u64) -> Duration {
        let exp = attempt.min(31);
        let raw = self
            .base_delay
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return raw;
        }
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&seed.to_le_bytes());
        buf[8..].copy_from_slice(&attempt.to_le_bytes());
        let h = fnv1a(&buf);
        // Map the hash onto [-1, 1] and scale into the jitter band.
        let unit = (h % 2001) as f64 / 1000.0 - 1.0;
        let factor = 1.0 + self.jitter * unit;
        Duration::from_secs_f64((raw.as_secs_f64() * factor).max(0.0))
    }
}

/// Per-operation-class policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicies {
    pub read: RetryPolicy,
    pub write: RetryPolicy,
    pub wait: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            read: RetryPolicy::default(),
            write: RetryPolicy::default(),
            wait: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(15),
                jitter: 0.2,
                deadline: Duration::from_secs(300),
            },
        }
    }
}

/// Error taxonomy for the whole engine. Clone + Serialize so terminal
/// outcomes can be fanned out to coalesced waiters and transported later.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq)]
pub enum SyncError {
    #[error("schema mismatch at {path}: {detail}")]
    SchemaMismatch { path: String, detail: String },
    #[error("already exists: {0}")]
    AlreadyExists(Identity),
    #[error("not found: {0}")]
    NotFound(Identity),
    #[error("conflict on {identity}: expected rv {expected}, live rv {live}")]
    Conflict {
        identity: Identity,
        expected: String,
        live: String,
    },
    #[error("permission denied on {identity}: {detail}")]
    Permission { identity: Identity, detail: String },
    #[error("transient: {0}")]
    Transient(String),
    #[error("retries exhausted after {attempts} attempts: {cause}")]
    RetryExhausted { attempts: u32, cause: Box<SyncError> },
    #[error("resource failed: {reason}: {message}")]
    ResourceFailed { reason: String, message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

impl SyncError {
    /// Last underlying cause, unwrapping retry-exhaustion layers.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::RetryExhausted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// User-visible failure: the error plus the last known observed state, so
/// callers can distinguish "never touched" from "partially applied".
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{error}")]
pub struct ReconcileFailure {
    pub error: SyncError,
    pub last_observed: Option<ObservedState>,
}

impl ReconcileFailure {
    pub fn new(error: SyncError, last_observed: Option<ObservedState>) -> Self {
        Self { error, last_observed }
    }

    pub fn bare(error: SyncError) -> Self {
        Self { error, last_observed: None }
    }
}

/// 64-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

// ---- JSON path helpers (object keys only; keys may contain dots) ----

pub fn get_path<'a>(root: &'a Json, path: &[String]) -> Option<&'a Json> {
    let mut cur = root;
    for seg in path {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

pub fn set_path(root: &mut Json, path: &[String], value: Json) {
    if path.is_empty() {
        *root = value;
        return;
    }
    let mut cur = root;
    for seg in &path[..path.len() - 1] {
        if !cur.is_object() {
            *cur = Json::Object(serde_json::Map::new());
        }
        cur = cur
            .as_object_mut()
            .expect("just coerced to object")
            .entry(seg.clone())
            .or_insert(Json::Object(serde_json::Map::new()));
    }
    if !cur.is_object() {
        *cur = Json::Object(serde_json::Map::new());
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.insert(path[path.len() - 1].clone(), value);
    }
}

pub fn remove_path(root: &mut Json, path: &[String]) {
    if path.is_empty() {
        *root = Json::Null;
        return;
    }
    let mut cur = root;
    for seg in &path[..path.len() - 1] {
        match cur.get_mut(seg) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.remove(&path[path.len() - 1]);
    }
}

pub mod prelude {
    pub use super::{
        Condition, Identity, ObservedState, OperationToken, Patch, PatchEntry, PatchOp,
        PatchSummary, ReconcileFailure, ResourceSpec, RetryPolicies, RetryPolicy, SyncError,
    };
}
