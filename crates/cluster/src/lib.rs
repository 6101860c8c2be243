//! Drift cluster layer: the client call contract the engine reconciles
//! through, a kube-backed executor with idempotency guards, the process-local
//! version cache, and an in-memory mock for tests.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use drift_core::{Condition, Identity, ObservedState, Patch, ResourceSpec, SyncError};
use kube::api::{Api, DeleteParams, PatchParams, PostParams, Preconditions};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info};

/// Field manager name used for server-side apply.
const FIELD_MANAGER: &str = "drift";

/// Refresh auth material this long before its recorded expiry.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Call contract the engine drives the cluster through. The wire transport
/// behind it (kube client, mock, RPC later) is not this crate's concern.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    /// Fresh read; `Ok(None)` when the identity does not exist.
    async fn get(&self, id: &Identity) -> Result<Option<ObservedState>, SyncError>;

    /// Create the object. `AlreadyExists` when the identity is live;
    /// the caller decides adopt-or-fail.
    async fn create(&self, spec: &ResourceSpec) -> Result<ObservedState, SyncError>;

    /// Apply `patch` on top of `spec`, guarded by `expected_version`.
    /// `Conflict` when the live version moved; never blindly retryable.
    async fn update(
        &self,
        spec: &ResourceSpec,
        patch: &Patch,
        expected_version: &str,
    ) -> Result<ObservedState, SyncError>;

    /// Delete the object, optionally guarded by `expected_version`.
    async fn delete(&self, id: &Identity, expected_version: Option<&str>) -> Result<(), SyncError>;
}

// ---- version cache ----

/// Process-local last-known resourceVersion per identity, written only after
/// a successful remote call. Records are replaced wholesale under the lock,
/// so concurrent readers never observe torn entries.
#[derive(Debug, Default)]
pub struct VersionCache {
    inner: RwLock<FxHashMap<Identity, String>>,
}

impl VersionCache {
    pub fn record(&self, id: &Identity, rv: &str) {
        if rv.is_empty() {
            return;
        }
        let mut map = self.inner.write().expect("version cache poisoned");
        map.insert(id.clone(), rv.to_string());
    }

    pub fn lookup(&self, id: &Identity) -> Option<String> {
        self.inner.read().expect("version cache poisoned").get(id).cloned()
    }

    pub fn forget(&self, id: &Identity) {
        self.inner.write().expect("version cache poisoned").remove(id);
    }
}

/// Whether an update still needs its preflight read. The cache holds the rv
/// recorded after our own last successful call, so when it matches the
/// expected version a read could only confirm what we already know; the
/// server still rejects a racing writer on the rv embedded in the apply.
fn preflight_needed(cache: &VersionCache, id: &Identity, expected: &str) -> bool {
    cache.lookup(id).as_deref() != Some(expected)
}

// ---- auth refresh contract ----

/// Result of one exec-plugin style credential refresh.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub token: String,
    /// None means the token does not expire.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Caller-supplied credential refresher (exec plugin, token file, ...).
#[async_trait::async_trait]
pub trait TokenRefresh: Send + Sync {
    async fn refresh(&self) -> Result<RefreshedToken, SyncError>;
}

/// Invokes the refresher before a cluster call whenever the cached token has
/// expired (with a small skew so calls never race the expiry).
pub struct AuthGuard {
    refresher: Arc<dyn TokenRefresh>,
    cached: tokio::sync::Mutex<Option<RefreshedToken>>,
}

impl AuthGuard {
    pub fn new(refresher: Arc<dyn TokenRefresh>) -> Self {
        Self { refresher, cached: tokio::sync::Mutex::new(None) }
    }

    pub async fn bearer(&self) -> Result<String, SyncError> {
        let mut cached = self.cached.lock().await;
        if let Some(tok) = cached.as_ref() {
            let fresh = match tok.expires_at {
                None => true,
                Some(at) => {
                    Utc::now() + chrono::Duration::from_std(TOKEN_EXPIRY_SKEW).unwrap_or_default() < at
                }
            };
            if fresh {
                return Ok(tok.token.clone());
            }
        }
        debug!("auth token missing or expiring; invoking refresher");
        let tok = self.refresher.refresh().await?;
        let out = tok.token.clone();
        *cached = Some(tok);
        Ok(out)
    }
}

/// Exec-plugin style refresher: runs a command and takes its trimmed stdout
/// as the bearer token. With no TTL the minted token never expires.
pub struct ExecTokenRefresh {
    program: String,
    args: Vec<String>,
    ttl: Option<Duration>,
}

impl ExecTokenRefresh {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), ttl: None }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[async_trait::async_trait]
impl TokenRefresh for ExecTokenRefresh {
    async fn refresh(&self) -> Result<RefreshedToken, SyncError> {
        let out = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| SyncError::Internal(format!("running auth command {}: {e}", self.program)))?;
        if !out.status.success() {
            return Err(SyncError::Internal(format!(
                "auth command {} exited with {}",
                self.program, out.status
            )));
        }
        let token = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if token.is_empty() {
            return Err(SyncError::Internal(format!(
                "auth command {} produced no token",
                self.program
            )));
        }
        let expires_at = self
            .ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        Ok(RefreshedToken { token, expires_at })
    }
}

// ---- shared helpers ----

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, SyncError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(SyncError::Internal(format!(
            "invalid gvk key: {key} (expect v1/Kind or group/v1/Kind)"
        ))),
    }
}

fn api_version_of(gvk_key: &str) -> (String, String) {
    let parts: Vec<&str> = gvk_key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => ((*version).to_string(), (*kind).to_string()),
        [group, version, kind] => (format!("{group}/{version}"), (*kind).to_string()),
        _ => (String::new(), gvk_key.to_string()),
    }
}

/// Render the desired fields into a full object: type meta and identity are
/// stamped in, the expected resourceVersion (if any) rides along so the
/// server enforces optimistic concurrency as well.
pub fn render_object(spec: &ResourceSpec, expected_version: Option<&str>) -> Json {
    let mut v = spec.fields.clone();
    if !v.is_object() {
        v = Json::Object(serde_json::Map::new());
    }
    let (api_version, kind) = api_version_of(&spec.identity.gvk_key);
    let obj = v.as_object_mut().expect("just coerced to object");
    obj.entry("apiVersion".to_string()).or_insert(Json::String(api_version));
    obj.entry("kind".to_string()).or_insert(Json::String(kind));
    let meta = obj
        .entry("metadata".to_string())
        .or_insert(Json::Object(serde_json::Map::new()));
    if let Some(m) = meta.as_object_mut() {
        m.insert("name".into(), Json::String(spec.identity.name.clone()));
        if let Some(ns) = &spec.identity.namespace {
            m.insert("namespace".into(), Json::String(ns.clone()));
        }
        match expected_version {
            Some(rv) => {
                m.insert("resourceVersion".into(), Json::String(rv.to_string()));
            }
            None => {
                m.remove("resourceVersion");
            }
        }
    }
    v
}

/// Shape a raw object into an ObservedState (fresh each read, replaced
/// wholesale).
pub fn observed_from_value(id: &Identity, raw: Json) -> ObservedState {
    let resource_version = raw
        .get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let conditions = raw
        .get("status")
        .and_then(|s| s.get("conditions"))
        .cloned()
        .and_then(|c| serde_json::from_value::<Vec<Condition>>(c).ok())
        .unwrap_or_default();
    ObservedState { identity: id.clone(), fields: raw, resource_version, conditions }
}

fn map_status(code: u16, msg: &str, id: &Identity) -> SyncError {
    match code {
        404 => SyncError::NotFound(id.clone()),
        401 | 403 => SyncError::Permission { identity: id.clone(), detail: msg.to_string() },
        408 | 429 => SyncError::Transient(msg.to_string()),
        c if c >= 500 => SyncError::Transient(format!("server error {c}: {msg}")),
        c => SyncError::Internal(format!("api error {c}: {msg}")),
    }
}

fn map_kube_err(e: kube::Error, id: &Identity) -> SyncError {
    match e {
        kube::Error::Api(ae) => map_status(ae.code, &ae.message, id),
        kube::Error::HyperError(e) => SyncError::Transient(e.to_string()),
        kube::Error::Service(e) => SyncError::Transient(e.to_string()),
        other => SyncError::Internal(other.to_string()),
    }
}

// ---- kube-backed executor ----

/// Executor over `kube::Api<DynamicObject>` with discovery-based resource
/// lookup and SSA writes. The base config is kept so the client can be
/// rebuilt whenever the auth guard hands back a rotated bearer token.
pub struct KubeCluster {
    config: kube::Config,
    client: RwLock<Client>,
    versions: VersionCache,
    auth: Option<AuthGuard>,
    applied_token: StdMutex<Option<String>>,
    resources: tokio::sync::Mutex<FxHashMap<String, (kube::core::ApiResource, bool)>>,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self, SyncError> {
        let config = kube::Config::infer()
            .await
            .map_err(|e| SyncError::Internal(format!("inferring kube config: {e}")))?;
        Self::with_config(config)
    }

    pub fn with_config(config: kube::Config) -> Result<Self, SyncError> {
        let client = Client::try_from(config.clone())
            .map_err(|e| SyncError::Internal(format!("building kube client: {e}")))?;
        Ok(Self {
            config,
            client: RwLock::new(client),
            versions: VersionCache::default(),
            auth: None,
            applied_token: StdMutex::new(None),
            resources: tokio::sync::Mutex::new(FxHashMap::default()),
        })
    }

    pub fn with_auth(mut self, guard: AuthGuard) -> Self {
        self.auth = Some(guard);
        self
    }

    pub fn versions(&self) -> &VersionCache {
        &self.versions
    }

    fn client(&self) -> Client {
        self.client.read().expect("client lock poisoned").clone()
    }

    /// Refresh credentials if needed; a rotated token rebuilds the client so
    /// every subsequent call authenticates with it.
    async fn pre_call(&self, id: &Identity) -> Result<(), SyncError> {
        let Some(auth) = &self.auth else { return Ok(()) };
        let token = auth.bearer().await?;
        {
            let applied = self.applied_token.lock().expect("auth state poisoned");
            if applied.as_deref() == Some(token.as_str()) {
                return Ok(());
            }
        }
        let mut config = self.config.clone();
        config.auth_info.token = Some(token.clone().into());
        config.auth_info.token_file = None;
        config.auth_info.exec = None;
        config.auth_info.auth_provider = None;
        let client = Client::try_from(config)
            .map_err(|e| SyncError::Internal(format!("rebuilding kube client: {e}")))?;
        *self.client.write().expect("client lock poisoned") = client;
        *self.applied_token.lock().expect("auth state poisoned") = Some(token);
        debug!(identity = %id, "bearer token rotated; client rebuilt");
        Ok(())
    }

    async fn api_for(&self, id: &Identity) -> Result<Api<DynamicObject>, SyncError> {
        let gvk = parse_gvk_key(&id.gvk_key)?;
        let (ar, namespaced) = {
            let mut cache = self.resources.lock().await;
            match cache.get(&id.gvk_key) {
                Some(hit) => hit.clone(),
                None => {
                    let found = find_api_resource(self.client(), &gvk).await?;
                    cache.insert(id.gvk_key.clone(), found.clone());
                    found
                }
            }
        };
        if namespaced {
            match id.namespace.as_deref() {
                Some(ns) => Ok(Api::namespaced_with(self.client(), ns, &ar)),
                None => Err(SyncError::Internal(format!(
                    "namespace required for namespaced kind {}",
                    id.gvk_key
                ))),
            }
        } else {
            Ok(Api::all_with(self.client(), &ar))
        }
    }
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool), SyncError> {
    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| SyncError::Transient(format!("discovery: {e}")))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(SyncError::Internal(format!(
        "GVK not served by cluster: {}/{}/{}",
        gvk.group, gvk.version, gvk.kind
    )))
}

#[async_trait::async_trait]
impl ClusterOps for KubeCluster {
    async fn get(&self, id: &Identity) -> Result<Option<ObservedState>, SyncError> {
        self.pre_call(id).await?;
        let api = self.api_for(id).await?;
        match api.get_opt(&id.name).await.map_err(|e| map_kube_err(e, id))? {
            Some(obj) => {
                let raw = serde_json::to_value(&obj)
                    .map_err(|e| SyncError::Internal(format!("serializing object: {e}")))?;
                let obs = observed_from_value(id, raw);
                if let Some(rv) = &obs.resource_version {
                    self.versions.record(id, rv);
                }
                Ok(Some(obs))
            }
            None => Ok(None),
        }
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ObservedState, SyncError> {
        let id = &spec.identity;
        self.pre_call(id).await?;
        counter!("cluster_create_total", 1u64);
        let api = self.api_for(id).await?;
        let rendered = render_object(spec, None);
        let obj: DynamicObject = serde_json::from_value(rendered)
            .map_err(|e| SyncError::Internal(format!("rendering object: {e}")))?;
        let created = api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 409 => SyncError::AlreadyExists(id.clone()),
                other => map_kube_err(other, id),
            })?;
        let raw = serde_json::to_value(&created)
            .map_err(|e| SyncError::Internal(format!("serializing object: {e}")))?;
        let obs = observed_from_value(id, raw);
        if let Some(rv) = &obs.resource_version {
            self.versions.record(id, rv);
        }
        info!(identity = %id, rv = obs.resource_version.as_deref().unwrap_or(""), "created");
        Ok(obs)
    }

    async fn update(
        &self,
        spec: &ResourceSpec,
        patch: &Patch,
        expected_version: &str,
    ) -> Result<ObservedState, SyncError> {
        let id = &spec.identity;
        self.pre_call(id).await?;
        counter!("cluster_update_total", 1u64);
        let api = self.api_for(id).await?;

        // Freshness guard: abort with Conflict before sending a stale patch.
        // Skipped when the version cache already holds the expected rv.
        if preflight_needed(&self.versions, id, expected_version) {
            if let Some(live) = api.get_opt(&id.name).await.map_err(|e| map_kube_err(e, id))? {
                let live_rv = live.metadata.resource_version.clone().unwrap_or_default();
                if !live_rv.is_empty() && live_rv != expected_version {
                    counter!("cluster_update_stale_total", 1u64);
                    return Err(SyncError::Conflict {
                        identity: id.clone(),
                        expected: expected_version.to_string(),
                        live: live_rv,
                    });
                }
            } else {
                return Err(SyncError::NotFound(id.clone()));
            }
        } else {
            counter!("cluster_preflight_skipped_total", 1u64);
            debug!(identity = %id, rv = expected_version, "version cache current; preflight read skipped");
        }

        // SSA with the expected rv embedded; the server rejects a racing
        // writer with 409 even if the preflight passed.
        let rendered = render_object(spec, Some(expected_version));
        let pp = PatchParams::apply(FIELD_MANAGER);
        let updated = api
            .patch(&id.name, &pp, &kube::api::Patch::Apply(&rendered))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 409 => SyncError::Conflict {
                    identity: id.clone(),
                    expected: expected_version.to_string(),
                    live: ae.message,
                },
                other => map_kube_err(other, id),
            })?;
        let raw = serde_json::to_value(&updated)
            .map_err(|e| SyncError::Internal(format!("serializing object: {e}")))?;
        let obs = observed_from_value(id, raw);
        if let Some(rv) = &obs.resource_version {
            self.versions.record(id, rv);
        }
        info!(identity = %id, edits = patch.entries.len(), rv = obs.resource_version.as_deref().unwrap_or(""), "updated");
        Ok(obs)
    }

    async fn delete(&self, id: &Identity, expected_version: Option<&str>) -> Result<(), SyncError> {
        self.pre_call(id).await?;
        counter!("cluster_delete_total", 1u64);
        let api = self.api_for(id).await?;
        let dp = DeleteParams {
            preconditions: expected_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..Default::default()
        };
        api.delete(&id.name, &dp).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 409 => SyncError::Conflict {
                identity: id.clone(),
                expected: expected_version.unwrap_or("").to_string(),
                live: ae.message,
            },
            other => map_kube_err(other, id),
        })?;
        self.versions.forget(id);
        info!(identity = %id, "deleted");
        Ok(())
    }
}

// ---- in-memory mock ----

#[derive(Debug, Clone)]
struct StoredObject {
    fields: Json,
    rv: u64,
}

#[derive(Debug, Default)]
pub struct CallCounts {
    get: AtomicUsize,
    create: AtomicUsize,
    update: AtomicUsize,
    delete: AtomicUsize,
}

/// In-memory `ClusterOps` for tests: scriptable failures, injectable status
/// on create, optional per-call latency so concurrency windows are testable.
#[derive(Default)]
pub struct MockCluster {
    objects: StdMutex<FxHashMap<Identity, StoredObject>>,
    rv_counter: AtomicU64,
    latency: StdMutex<Duration>,
    fail_plan: StdMutex<FxHashMap<&'static str, VecDeque<SyncError>>>,
    status_seed: StdMutex<FxHashMap<String, Json>>,
    counts: CallCounts,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latency(&self, d: Duration) {
        *self.latency.lock().expect("mock poisoned") = d;
    }

    /// Queue an error for the next call of `op` ("get"/"create"/"update"/"delete").
    pub fn fail_next(&self, op: &'static str, err: SyncError) {
        self.fail_plan
            .lock()
            .expect("mock poisoned")
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Status injected into every created object of the given gvk key
    /// (e.g. a token the server mints on TokenRequest creation).
    pub fn seed_status(&self, gvk_key: &str, status: Json) {
        self.status_seed
            .lock()
            .expect("mock poisoned")
            .insert(gvk_key.to_string(), status);
    }

    /// Insert a live object directly, bypassing counters.
    pub fn seed(&self, id: Identity, fields: Json) {
        let rv = self.next_rv();
        self.objects
            .lock()
            .expect("mock poisoned")
            .insert(id, StoredObject { fields, rv });
    }

    /// Overwrite the object's status out-of-band (server-side progress).
    pub fn set_status(&self, id: &Identity, status: Json) {
        let mut objects = self.objects.lock().expect("mock poisoned");
        if let Some(obj) = objects.get_mut(id) {
            obj.fields["status"] = status;
            obj.rv = self.rv_counter.fetch_add(1, Ordering::SeqCst) + 1;
        }
    }

    pub fn gets(&self) -> usize {
        self.counts.get.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.counts.create.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.counts.update.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.counts.delete.load(Ordering::SeqCst)
    }

    fn next_rv(&self) -> u64 {
        self.rv_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_failure(&self, op: &'static str) -> Option<SyncError> {
        self.fail_plan
            .lock()
            .expect("mock poisoned")
            .get_mut(op)
            .and_then(|q| q.pop_front())
    }

    async fn simulate_latency(&self) {
        let d = *self.latency.lock().expect("mock poisoned");
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
    }

    fn observe(&self, id: &Identity, obj: &StoredObject) -> ObservedState {
        let mut raw = obj.fields.clone();
        if let Some(meta) = raw
            .as_object_mut()
            .and_then(|o| o.get_mut("metadata"))
            .and_then(|m| m.as_object_mut())
        {
            meta.insert("resourceVersion".into(), Json::String(obj.rv.to_string()));
        }
        observed_from_value(id, raw)
    }
}

#[async_trait::async_trait]
impl ClusterOps for MockCluster {
    async fn get(&self, id: &Identity) -> Result<Option<ObservedState>, SyncError> {
        self.simulate_latency().await;
        self.counts.get.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_failure("get") {
            return Err(err);
        }
        let objects = self.objects.lock().expect("mock poisoned");
        Ok(objects.get(id).map(|o| self.observe(id, o)))
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ObservedState, SyncError> {
        self.simulate_latency().await;
        self.counts.create.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_failure("create") {
            return Err(err);
        }
        let id = spec.identity.clone();
        let mut fields = render_object(spec, None);
        if let Some(status) = self
            .status_seed
            .lock()
            .expect("mock poisoned")
            .get(&id.gvk_key)
            .cloned()
        {
            fields["status"] = status;
        }
        let rv = self.next_rv();
        let mut objects = self.objects.lock().expect("mock poisoned");
        if objects.contains_key(&id) {
            return Err(SyncError::AlreadyExists(id));
        }
        let stored = StoredObject { fields, rv };
        let obs = self.observe(&id, &stored);
        objects.insert(id, stored);
        Ok(obs)
    }

    async fn update(
        &self,
        spec: &ResourceSpec,
        patch: &Patch,
        expected_version: &str,
    ) -> Result<ObservedState, SyncError> {
        self.simulate_latency().await;
        self.counts.update.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_failure("update") {
            return Err(err);
        }
        let id = spec.identity.clone();
        let rv = self.next_rv();
        let mut objects = self.objects.lock().expect("mock poisoned");
        let stored = objects.get_mut(&id).ok_or_else(|| SyncError::NotFound(id.clone()))?;
        if stored.rv.to_string() != expected_version {
            return Err(SyncError::Conflict {
                identity: id,
                expected: expected_version.to_string(),
                live: stored.rv.to_string(),
            });
        }
        patch.apply_to(&mut stored.fields);
        stored.rv = rv;
        let obs = self.observe(&id, stored);
        Ok(obs)
    }

    async fn delete(&self, id: &Identity, expected_version: Option<&str>) -> Result<(), SyncError> {
        self.simulate_latency().await;
        self.counts.delete.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_failure("delete") {
            return Err(err);
        }
        let mut objects = self.objects.lock().expect("mock poisoned");
        let stored = objects.get(id).ok_or_else(|| SyncError::NotFound(id.clone()))?;
        if let Some(expected) = expected_version {
            if stored.rv.to_string() != expected {
                return Err(SyncError::Conflict {
                    identity: id.clone(),
                    expected: expected.to_string(),
                    live: stored.rv.to_string(),
                });
            }
        }
        objects.remove(id);
        Ok(())
    }
}
