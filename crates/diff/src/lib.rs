//! Drift state differ: field-by-field comparison of desired vs observed
//! state, producing a minimal patch.
//!
//! Server-managed fields (resourceVersion, generation, status, ...) and any
//! annotation/label key matching the configured ignore regex sets are
//! excluded from comparison, so drift in those fields never triggers writes.

#![forbid(unsafe_code)]

use drift_core::{
    get_path, Identity, ObservedState, Patch, PatchEntry, PatchOp, ResourceSpec, SyncError,
};
use regex::Regex;
use serde_json::Value as Json;
use tracing::debug;

/// Annotation/label keys managed by external systems; each entry is a regex
/// (mirrors the provider-level `ignore_annotations`/`ignore_labels` lists).
#[derive(Debug, Default, Clone)]
pub struct IgnoreRules {
    annotations: Vec<Regex>,
    labels: Vec<Regex>,
}

impl IgnoreRules {
    pub fn compile(annotations: &[String], labels: &[String]) -> Result<Self, SyncError> {
        let build = |pats: &[String], what: &str| -> Result<Vec<Regex>, SyncError> {
            pats.iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        SyncError::Internal(format!("invalid ignore-{what} regex {p:?}: {e}"))
                    })
                })
                .collect()
        };
        Ok(Self {
            annotations: build(annotations, "annotations")?,
            labels: build(labels, "labels")?,
        })
    }

    pub fn ignores_annotation(&self, key: &str) -> bool {
        self.annotations.iter().any(|re| re.is_match(key))
    }

    pub fn ignores_label(&self, key: &str) -> bool {
        self.labels.iter().any(|re| re.is_match(key))
    }
}

/// Semantic type of a declared field path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    /// Free-form mapping; arbitrary sub-keys are valid under this path.
    Mapping,
    /// Order-sensitive list.
    Sequence,
    /// Order-insensitive list.
    Set,
}

/// One entry in the statically declared field registry for a kind.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub path: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Enumerated table of the field paths a kind supports. Validated up front
/// instead of discovered via runtime reflection.
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    rules: Vec<FieldRule>,
}

impl FieldRegistry {
    /// Registry pre-seeded with the metadata/type fields every kind carries.
    pub fn standard() -> Self {
        Self::default()
            .scalar("apiVersion")
            .scalar("kind")
            .required_scalar("metadata.name")
            .scalar("metadata.namespace")
            .mapping("metadata.labels")
            .mapping("metadata.annotations")
            .set("metadata.finalizers")
    }

    fn push(mut self, path: &str, kind: FieldKind, required: bool) -> Self {
        self.rules.push(FieldRule { path: path.to_string(), kind, required });
        self
    }

    pub fn scalar(self, path: &str) -> Self {
        self.push(path, FieldKind::Scalar, false)
    }

    pub fn required_scalar(self, path: &str) -> Self {
        self.push(path, FieldKind::Scalar, true)
    }

    pub fn mapping(self, path: &str) -> Self {
        self.push(path, FieldKind::Mapping, false)
    }

    pub fn sequence(self, path: &str) -> Self {
        self.push(path, FieldKind::Sequence, false)
    }

    pub fn set(self, path: &str) -> Self {
        self.push(path, FieldKind::Set, false)
    }

    /// Longest rule whose path is a segment-wise prefix of `path`.
    fn rule_for(&self, path: &[String]) -> Option<&FieldRule> {
        let mut best: Option<&FieldRule> = None;
        for rule in &self.rules {
            let segs: Vec<&str> = rule.path.split('.').collect();
            if segs.len() > path.len() {
                continue;
            }
            if segs.iter().zip(path.iter()).all(|(a, b)| *a == b.as_str()) {
                match best {
                    Some(b) if b.path.len() >= rule.path.len() => {}
                    _ => best = Some(rule),
                }
            }
        }
        best
    }

    /// Whether this registry declares (and therefore owns) the given path.
    pub fn governs(&self, path: &[String]) -> bool {
        self.rule_for(path).is_some()
    }

    fn kind_at(&self, path: &[String]) -> Option<FieldKind> {
        self.rule_for(path).map(|r| r.kind)
    }

    /// Check every leaf of the desired field tree against the registry and
    /// enforce required paths.
    pub fn validate(&self, identity: &Identity, fields: &Json) -> Result<(), SyncError> {
        let mut stack: Vec<(Vec<String>, &Json)> = vec![(Vec::new(), fields)];
        while let Some((path, v)) = stack.pop() {
            match v {
                Json::Object(map) if !map.is_empty() => {
                    for (k, vv) in map {
                        let mut sub = path.clone();
                        sub.push(k.clone());
                        stack.push((sub, vv));
                    }
                }
                _ => {
                    if !path.is_empty() && !self.governs(&path) {
                        return Err(SyncError::SchemaMismatch {
                            path: path.join("."),
                            detail: format!("field not declared for {}", identity.gvk_key),
                        });
                    }
                }
            }
        }
        for rule in self.rules.iter().filter(|r| r.required) {
            let segs: Vec<String> = rule.path.split('.').map(|s| s.to_string()).collect();
            if get_path(fields, &segs).is_none() {
                return Err(SyncError::SchemaMismatch {
                    path: rule.path.clone(),
                    detail: "required field missing".into(),
                });
            }
        }
        Ok(())
    }
}

/// Drop fields the server owns before comparing (same set the apply path
/// strips before computing summaries).
pub fn scrub(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Compute the minimal patch turning `observed` into `desired`.
///
/// Absent observed state yields a single whole-object add (create). Equal
/// trees (modulo server-managed and ignored fields) yield an empty patch.
pub fn diff(
    desired: &ResourceSpec,
    observed: Option<&ObservedState>,
    registry: &FieldRegistry,
    ignore: &IgnoreRules,
) -> Result<Patch, SyncError> {
    registry.validate(&desired.identity, &desired.fields)?;
    let want = scrub(desired.fields.clone());

    let live = match observed {
        None => {
            return Ok(Patch {
                entries: vec![PatchEntry { path: vec![], op: PatchOp::Add, value: Some(want) }],
            })
        }
        Some(o) => scrub(o.fields.clone()),
    };

    let mut entries = Vec::new();
    if let (Some(want_obj), Some(live_obj)) = (want.as_object(), live.as_object()) {
        for (k, wv) in want_obj {
            let path = vec![k.clone()];
            match live_obj.get(k) {
                Some(lv) => compare(&path, wv, lv, registry, ignore, &mut entries),
                None => entries.push(PatchEntry {
                    path,
                    op: PatchOp::Add,
                    value: Some(wv.clone()),
                }),
            }
        }
        // Governed root keys the desired spec dropped are drift too. Type
        // meta is stamped by the writer, so its absence in desired is not.
        for (k, lv) in live_obj {
            if want_obj.contains_key(k) || k == "apiVersion" || k == "kind" {
                continue;
            }
            let path = vec![k.clone()];
            if registry.governs(&path) {
                remove_live_only(&path, lv, registry, ignore, &mut entries);
            }
        }
    } else if want != live {
        entries.push(PatchEntry { path: vec![], op: PatchOp::Replace, value: Some(want) });
    }

    debug!(identity = %desired.identity, edits = entries.len(), "diff computed");
    Ok(Patch { entries })
}

fn ignored_key(path: &[String], ignore: &IgnoreRules) -> bool {
    if path.len() == 3 && path[0] == "metadata" {
        if path[1] == "annotations" {
            return ignore.ignores_annotation(&path[2]);
        }
        if path[1] == "labels" {
            return ignore.ignores_label(&path[2]);
        }
    }
    false
}

fn compare(
    path: &[String],
    want: &Json,
    live: &Json,
    registry: &FieldRegistry,
    ignore: &IgnoreRules,
    out: &mut Vec<PatchEntry>,
) {
    match (want, live) {
        (Json::Object(wo), Json::Object(lo)) => {
            for (k, wv) in wo {
                let mut sub = path.to_vec();
                sub.push(k.clone());
                if ignored_key(&sub, ignore) {
                    continue;
                }
                match lo.get(k) {
                    Some(lv) => compare(&sub, wv, lv, registry, ignore, out),
                    None => out.push(PatchEntry { path: sub, op: PatchOp::Add, value: Some(wv.clone()) }),
                }
            }
            for (k, lv) in lo {
                if wo.contains_key(k) {
                    continue;
                }
                let mut sub = path.to_vec();
                sub.push(k.clone());
                if ignored_key(&sub, ignore) || !registry.governs(&sub) {
                    continue;
                }
                remove_live_only(&sub, lv, registry, ignore, out);
            }
        }
        (Json::Array(wa), Json::Array(la)) => {
            let equal = match registry.kind_at(path) {
                Some(FieldKind::Set) => set_equal(wa, la),
                _ => wa == la,
            };
            if !equal {
                out.push(PatchEntry {
                    path: path.to_vec(),
                    op: PatchOp::Replace,
                    value: Some(want.clone()),
                });
            }
        }
        (w, l) => {
            if w != l {
                out.push(PatchEntry {
                    path: path.to_vec(),
                    op: PatchOp::Replace,
                    value: Some(w.clone()),
                });
            }
        }
    }
}

/// A live-only mapping the registry owns is pruned key-by-key so the ignore
/// rules still apply to individual entries; anything else goes in one remove.
fn remove_live_only(
    path: &[String],
    live: &Json,
    registry: &FieldRegistry,
    ignore: &IgnoreRules,
    out: &mut Vec<PatchEntry>,
) {
    if let (Some(obj), Some(FieldKind::Mapping)) = (live.as_object(), registry.kind_at(path)) {
        for k in obj.keys() {
            let mut sub = path.to_vec();
            sub.push(k.clone());
            if ignored_key(&sub, ignore) {
                continue;
            }
            out.push(PatchEntry { path: sub, op: PatchOp::Remove, value: None });
        }
        return;
    }
    out.push(PatchEntry { path: path.to_vec(), op: PatchOp::Remove, value: None });
}

fn set_equal(a: &[Json], b: &[Json]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut ka: Vec<String> = a.iter().map(|v| v.to_string()).collect();
    let mut kb: Vec<String> = b.iter().map(|v| v.to_string()).collect();
    ka.sort();
    kb.sort();
    ka == kb
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::Identity;

    fn registry() -> FieldRegistry {
        FieldRegistry::standard()
            .scalar("spec.replicas")
            .set("spec.audiences")
            .sequence("spec.containers")
            .mapping("spec.selector")
    }

    fn spec(fields: Json) -> ResourceSpec {
        ResourceSpec {
            identity: Identity::new("test/v1/Widget", Some("ns"), "w"),
            fields,
            resource_version: None,
        }
    }

    fn observed(fields: Json) -> ObservedState {
        ObservedState {
            identity: Identity::new("test/v1/Widget", Some("ns"), "w"),
            fields,
            resource_version: Some("10".into()),
            conditions: vec![],
        }
    }

    #[test]
    fn absent_observed_yields_create_patch() {
        let d = spec(serde_json::json!({ "metadata": { "name": "w" } }));
        let p = diff(&d, None, &registry(), &IgnoreRules::default()).unwrap();
        assert!(p.is_create());
    }

    #[test]
    fn noop_modulo_server_managed_fields() {
        let d = spec(serde_json::json!({
            "metadata": { "name": "w", "labels": { "app": "w" } },
            "spec": { "replicas": 2 }
        }));
        let o = observed(serde_json::json!({
            "metadata": {
                "name": "w",
                "labels": { "app": "w" },
                "resourceVersion": "10",
                "generation": 3,
                "uid": "00000000-0000-0000-0000-000000000001",
                "managedFields": [{ "manager": "drift" }]
            },
            "spec": { "replicas": 2 },
            "status": { "readyReplicas": 2 }
        }));
        let p = diff(&d, Some(&o), &registry(), &IgnoreRules::default()).unwrap();
        assert!(p.is_noop(), "expected no-op, got {:?}", p.entries);
    }

    #[test]
    fn noop_modulo_ignored_annotations_and_labels() {
        let ignore = IgnoreRules::compile(
            &["^kubectl\\.kubernetes\\.io/".into()],
            &["^ops\\.example\\.com/".into()],
        )
        .unwrap();
        let d = spec(serde_json::json!({
            "metadata": { "name": "w", "annotations": { "team": "infra" } }
        }));
        let o = observed(serde_json::json!({
            "metadata": {
                "name": "w",
                "annotations": {
                    "team": "infra",
                    "kubectl.kubernetes.io/last-applied-configuration": "{}"
                },
                "labels": { "ops.example.com/injected": "true" }
            }
        }));
        let p = diff(&d, Some(&o), &registry(), &ignore).unwrap();
        assert!(p.is_noop(), "expected no-op, got {:?}", p.entries);
    }

    #[test]
    fn detects_adds_replaces_and_removes() {
        let d = spec(serde_json::json!({
            "metadata": { "name": "w", "labels": { "app": "w", "team": "infra" } },
            "spec": { "replicas": 3 }
        }));
        let o = observed(serde_json::json!({
            "metadata": { "name": "w", "labels": { "app": "w", "stale": "yes" } },
            "spec": { "replicas": 2 }
        }));
        let p = diff(&d, Some(&o), &registry(), &IgnoreRules::default()).unwrap();
        let s = p.summary();
        assert_eq!(s.adds, 1, "labels.team added");
        assert_eq!(s.replaces, 1, "replicas replaced");
        assert_eq!(s.removes, 1, "labels.stale removed");
    }

    #[test]
    fn dropped_governed_root_mapping_is_removed() {
        let reg = FieldRegistry::standard().mapping("data");
        let d = spec(serde_json::json!({ "metadata": { "name": "w" } }));
        let o = observed(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Widget",
            "metadata": { "name": "w" },
            "data": { "a": "1", "b": "2" },
            "clusterIP": "10.0.0.1"
        }));
        let p = diff(&d, Some(&o), &reg, &IgnoreRules::default()).unwrap();
        assert_eq!(p.summary().removes, 2, "each dropped data key pruned");
        assert!(p.entries.iter().all(|e| e.path[0] == "data"), "type meta and server-owned root keys stay");

        // Applying the patch converges: the next diff is a no-op.
        let mut live = o.fields.clone();
        p.apply_to(&mut live);
        let settled = observed(live);
        let again = diff(&d, Some(&settled), &reg, &IgnoreRules::default()).unwrap();
        assert!(again.is_noop(), "expected no-op, got {:?}", again.entries);
    }

    #[test]
    fn set_fields_compare_order_insensitively() {
        let d = spec(serde_json::json!({
            "metadata": { "name": "w" },
            "spec": { "audiences": ["api", "vault", "factors"] }
        }));
        let o = observed(serde_json::json!({
            "metadata": { "name": "w" },
            "spec": { "audiences": ["vault", "factors", "api"] }
        }));
        let p = diff(&d, Some(&o), &registry(), &IgnoreRules::default()).unwrap();
        assert!(p.is_noop());
    }

    #[test]
    fn sequence_fields_compare_order_sensitively() {
        let d = spec(serde_json::json!({
            "metadata": { "name": "w" },
            "spec": { "containers": [{ "name": "a" }, { "name": "b" }] }
        }));
        let o = observed(serde_json::json!({
            "metadata": { "name": "w" },
            "spec": { "containers": [{ "name": "b" }, { "name": "a" }] }
        }));
        let p = diff(&d, Some(&o), &registry(), &IgnoreRules::default()).unwrap();
        assert_eq!(p.entries.len(), 1);
        assert_eq!(p.entries[0].op, PatchOp::Replace);
        assert_eq!(p.entries[0].dotted_path(), "spec.containers");
    }

    #[test]
    fn unknown_path_is_schema_mismatch() {
        let d = spec(serde_json::json!({
            "metadata": { "name": "w" },
            "spec": { "bogus": true }
        }));
        let err = diff(&d, None, &registry(), &IgnoreRules::default()).unwrap_err();
        match err {
            SyncError::SchemaMismatch { path, .. } => assert_eq!(path, "spec.bogus"),
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_is_schema_mismatch() {
        let d = spec(serde_json::json!({ "spec": { "replicas": 1 } }));
        let err = diff(&d, None, &registry(), &IgnoreRules::default()).unwrap_err();
        match err {
            SyncError::SchemaMismatch { path, .. } => assert_eq!(path, "metadata.name"),
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn applying_patch_converges_to_noop() {
        let d = spec(serde_json::json!({
            "metadata": { "name": "w", "labels": { "app": "w" } },
            "spec": { "replicas": 5, "selector": { "app": "w" } }
        }));
        let mut o = observed(serde_json::json!({
            "metadata": { "name": "w", "labels": { "app": "old", "stale": "x" } },
            "spec": { "replicas": 1 }
        }));
        let reg = registry();
        let p = diff(&d, Some(&o), &reg, &IgnoreRules::default()).unwrap();
        assert!(!p.is_noop());
        p.apply_to(&mut o.fields);
        let again = diff(&d, Some(&o), &reg, &IgnoreRules::default()).unwrap();
        assert!(again.is_noop(), "expected convergence, got {:?}", again.entries);
    }
}
