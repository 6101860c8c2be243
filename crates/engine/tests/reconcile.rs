//! End-to-end reconcile flows against the in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use drift_cluster::{ClusterOps, MockCluster};
use drift_core::{Identity, ResourceSpec, RetryPolicies, RetryPolicy, SyncError};
use drift_diff::FieldRegistry;
use drift_engine::{Engine, EngineConfig, KindDescriptor, KindRegistry};
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(10);

fn fast_config() -> EngineConfig {
    let fast = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        jitter: 0.0,
        deadline: Duration::from_secs(5),
    };
    let mut cfg = EngineConfig::new();
    cfg.policies = RetryPolicies {
        read: fast.clone(),
        write: fast,
        wait: RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
            deadline: Duration::from_secs(5),
        },
    };
    cfg
}

fn registry() -> KindRegistry {
    let mut kinds = KindRegistry::builtin();
    kinds.register(KindDescriptor::new(
        "v1/ConfigMap",
        FieldRegistry::standard().mapping("data"),
    ));
    kinds
}

fn engine(mock: &Arc<MockCluster>) -> Engine {
    Engine::new(mock.clone(), registry(), fast_config())
}

fn sa_spec(name: &str) -> ResourceSpec {
    ResourceSpec {
        identity: Identity::new("v1/ServiceAccount", Some("default"), name),
        fields: json!({ "metadata": { "name": name, "namespace": "default" } }),
        resource_version: None,
    }
}

fn configmap_spec(name: &str, value: &str) -> ResourceSpec {
    ResourceSpec {
        identity: Identity::new("v1/ConfigMap", Some("default"), name),
        fields: json!({
            "metadata": { "name": name, "namespace": "default" },
            "data": { "key": value }
        }),
        resource_version: None,
    }
}

#[tokio::test]
async fn absent_object_is_created_then_converged() {
    let mock = Arc::new(MockCluster::new());
    let engine = engine(&mock);

    let obs = engine.reconcile(sa_spec("tokentest"), TIMEOUT).await.unwrap();
    assert_eq!(obs.identity.name, "tokentest");
    assert!(obs.resource_version.is_some());
    assert_eq!(mock.creates(), 1);

    // Second pass over the same spec is a pure read.
    let again = engine.reconcile(sa_spec("tokentest"), TIMEOUT).await.unwrap();
    assert_eq!(again.identity, obs.identity);
    assert_eq!(mock.creates(), 1);
    assert_eq!(mock.updates(), 0);
}

#[tokio::test]
async fn token_request_settles_with_minted_token() {
    let mock = Arc::new(MockCluster::new());
    mock.seed(
        Identity::new("v1/ServiceAccount", Some("default"), "tokentest"),
        json!({ "metadata": { "name": "tokentest", "namespace": "default" } }),
    );
    mock.seed_status(
        "authentication.k8s.io/v1/TokenRequest",
        json!({ "token": "eyJhbGciOiJSUzI1NiJ9.demo", "expirationTimestamp": "2026-08-27T12:00:00Z" }),
    );
    let engine = engine(&mock);

    let spec = ResourceSpec {
        identity: Identity::new("authentication.k8s.io/v1/TokenRequest", Some("default"), "tokentest"),
        fields: json!({
            "metadata": { "name": "tokentest", "namespace": "default" },
            "spec": { "audiences": ["api", "vault", "factors"] }
        }),
        resource_version: None,
    };
    let obs = engine.reconcile(spec, TIMEOUT).await.unwrap();
    let token = obs.field("status.token").and_then(|v| v.as_str()).unwrap_or_default();
    assert!(!token.is_empty(), "server-minted token must be surfaced");
}

#[tokio::test]
async fn live_object_is_updated_in_place() {
    let mock = Arc::new(MockCluster::new());
    let id = Identity::new("v1/ConfigMap", Some("default"), "settings");
    mock.seed(
        id.clone(),
        json!({
            "metadata": { "name": "settings", "namespace": "default" },
            "data": { "key": "old" }
        }),
    );
    let engine = engine(&mock);

    let obs = engine.reconcile(configmap_spec("settings", "new"), TIMEOUT).await.unwrap();
    assert_eq!(mock.creates(), 0);
    assert_eq!(mock.updates(), 1);
    assert_eq!(obs.field("data.key").and_then(|v| v.as_str()), Some("new"));
}

#[tokio::test]
async fn unknown_kind_is_rejected_up_front() {
    let mock = Arc::new(MockCluster::new());
    let engine = engine(&mock);
    let spec = ResourceSpec {
        identity: Identity::new("v1/Widget", Some("default"), "w"),
        fields: json!({ "metadata": { "name": "w" } }),
        resource_version: None,
    };
    let failure = engine.reconcile(spec, TIMEOUT).await.unwrap_err();
    assert!(matches!(failure.error, SyncError::SchemaMismatch { .. }));
    assert!(failure.last_observed.is_none());
    assert_eq!(mock.gets(), 0, "descriptor lookup precedes any cluster call");
}

#[tokio::test]
async fn deployment_settles_once_available() {
    let mock = Arc::new(MockCluster::new());
    let engine = engine(&mock);
    let id = Identity::new("apps/v1/Deployment", Some("default"), "web");

    let progressor = mock.clone();
    let target = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        progressor.set_status(
            &target,
            json!({ "conditions": [{ "type": "Available", "status": "True" }] }),
        );
    });

    let spec = ResourceSpec {
        identity: id,
        fields: json!({
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "replicas": 2 }
        }),
        resource_version: None,
    };
    let obs = engine.reconcile(spec, TIMEOUT).await.unwrap();
    assert_eq!(obs.condition("Available").map(|c| c.status.as_str()), Some("True"));
    assert!(mock.gets() > 1, "readiness requires polling");
}

#[tokio::test]
async fn failed_pod_aborts_the_wait() {
    let mock = Arc::new(MockCluster::new());
    mock.seed_status("v1/Pod", json!({ "phase": "Failed" }));
    let engine = engine(&mock);

    let spec = ResourceSpec {
        identity: Identity::new("v1/Pod", Some("default"), "job"),
        fields: json!({
            "metadata": { "name": "job", "namespace": "default" },
            "spec": { "containers": [{ "name": "main", "image": "busybox" }] }
        }),
        resource_version: None,
    };
    let failure = engine.reconcile(spec, TIMEOUT).await.unwrap_err();
    assert!(matches!(failure.error, SyncError::ResourceFailed { .. }));
    assert!(failure.last_observed.is_some(), "partial application must be reported");
}

#[tokio::test]
async fn remove_deletes_and_tolerates_absence() {
    let mock = Arc::new(MockCluster::new());
    let engine = engine(&mock);
    let id = Identity::new("v1/ConfigMap", Some("default"), "settings");

    // Removing something that never existed is already converged.
    engine.remove(id.clone(), TIMEOUT).await.unwrap();
    assert_eq!(mock.deletes(), 0);

    mock.seed(id.clone(), json!({ "metadata": { "name": "settings" } }));
    engine.remove(id.clone(), TIMEOUT).await.unwrap();
    assert_eq!(mock.deletes(), 1);

    let gone = mock.get(&id).await.unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn plan_reports_drift_without_mutating() {
    let mock = Arc::new(MockCluster::new());
    let id = Identity::new("v1/ConfigMap", Some("default"), "settings");
    mock.seed(
        id,
        json!({
            "metadata": { "name": "settings", "namespace": "default" },
            "data": { "key": "old" }
        }),
    );
    let engine = engine(&mock);

    let (patch, observed) = engine.plan(&configmap_spec("settings", "new")).await.unwrap();
    assert!(!patch.is_noop());
    assert!(observed.is_some());
    assert_eq!(mock.updates(), 0);
    assert_eq!(mock.creates(), 0);
}
