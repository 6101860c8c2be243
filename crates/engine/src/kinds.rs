//! Built-in kind descriptors: which fields each kind owns and what "ready"
//! means for it. Callers extend the registry for kinds not listed here.

use drift_core::ObservedState;
use drift_diff::FieldRegistry;
use drift_wait::ReadinessCheck;
use rustc_hash::FxHashMap;

/// Everything the engine needs to know about one kind.
pub struct KindDescriptor {
    pub gvk_key: String,
    pub fields: FieldRegistry,
    /// None means the object is usable as soon as the write lands.
    pub readiness: Option<ReadinessCheck>,
}

impl KindDescriptor {
    pub fn new(gvk_key: &str, fields: FieldRegistry) -> Self {
        Self { gvk_key: gvk_key.to_string(), fields, readiness: None }
    }

    pub fn with_readiness(mut self, check: ReadinessCheck) -> Self {
        self.readiness = Some(check);
        self
    }
}

/// Descriptor lookup by gvk key (`v1/Pod`, `apps/v1/Deployment`, ...).
#[derive(Default)]
pub struct KindRegistry {
    by_key: FxHashMap<String, KindDescriptor>,
}

impl KindRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with the kinds the engine ships support for.
    pub fn builtin() -> Self {
        let mut reg = Self::empty();
        reg.register(service_account());
        reg.register(token_request());
        reg.register(deployment());
        reg.register(pod());
        reg.register(pvc());
        reg.register(service());
        reg
    }

    /// Later registrations win, so callers can override a builtin.
    pub fn register(&mut self, desc: KindDescriptor) {
        self.by_key.insert(desc.gvk_key.clone(), desc);
    }

    pub fn descriptor(&self, gvk_key: &str) -> Option<&KindDescriptor> {
        self.by_key.get(gvk_key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.by_key.keys().map(|k| k.as_str())
    }
}

fn condition_true(obs: &ObservedState, type_: &str) -> bool {
    obs.condition(type_).map(|c| c.status == "True").unwrap_or(false)
}

fn phase_of(obs: &ObservedState) -> Option<&str> {
    obs.field("status.phase").and_then(|v| v.as_str())
}

fn service_account() -> KindDescriptor {
    let fields = FieldRegistry::standard()
        .scalar("automountServiceAccountToken")
        .sequence("secrets")
        .sequence("imagePullSecrets");
    KindDescriptor::new("v1/ServiceAccount", fields)
}

fn token_request() -> KindDescriptor {
    let fields = FieldRegistry::standard()
        .set("spec.audiences")
        .scalar("spec.expirationSeconds")
        .mapping("spec.boundObjectRef");
    // The server mints the token on creation; ready once it shows up.
    KindDescriptor::new("authentication.k8s.io/v1/TokenRequest", fields).with_readiness(
        ReadinessCheck::new(|obs| {
            obs.field("status.token")
                .and_then(|v| v.as_str())
                .map(|t| !t.is_empty())
                .unwrap_or(false)
        }),
    )
}

fn deployment() -> KindDescriptor {
    let fields = FieldRegistry::standard().mapping("spec");
    KindDescriptor::new("apps/v1/Deployment", fields).with_readiness(ReadinessCheck::with_failure(
        |obs| condition_true(obs, "Available"),
        |obs| {
            obs.condition("ReplicaFailure")
                .filter(|c| c.status == "True")
                .map(|c| {
                    let reason =
                        if c.reason.is_empty() { "ReplicaFailure".to_string() } else { c.reason.clone() };
                    (reason, c.message.clone())
                })
        },
    ))
}

fn pod() -> KindDescriptor {
    let fields = FieldRegistry::standard().mapping("spec");
    KindDescriptor::new("v1/Pod", fields).with_readiness(ReadinessCheck::with_failure(
        |obs| condition_true(obs, "Ready"),
        |obs| match phase_of(obs) {
            Some("Failed") => Some(("PodFailed".into(), "pod entered Failed phase".into())),
            _ => None,
        },
    ))
}

fn pvc() -> KindDescriptor {
    let fields = FieldRegistry::standard()
        .mapping("spec")
        .set("spec.accessModes");
    KindDescriptor::new("v1/PersistentVolumeClaim", fields).with_readiness(
        ReadinessCheck::with_failure(
            |obs| phase_of(obs) == Some("Bound"),
            |obs| match phase_of(obs) {
                Some("Lost") => Some(("ClaimLost".into(), "underlying volume was lost".into())),
                _ => None,
            },
        ),
    )
}

fn service() -> KindDescriptor {
    let fields = FieldRegistry::standard()
        .mapping("spec")
        .sequence("spec.ports");
    // Only LoadBalancer services have anything to wait for.
    KindDescriptor::new("v1/Service", fields).with_readiness(ReadinessCheck::new(|obs| {
        match obs.field("spec.type").and_then(|v| v.as_str()) {
            Some("LoadBalancer") => obs
                .field("status.loadBalancer.ingress")
                .and_then(|v| v.as_array())
                .map(|a| !a.is_empty())
                .unwrap_or(false),
            _ => true,
        }
    }))
}
