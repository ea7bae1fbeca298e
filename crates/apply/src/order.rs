//! Dependency ordering of a batch of objects.

use std::cmp::Ordering;

use kfold_core::RawObj;
use rustc_hash::FxHashMap;

/// Kinds that other kinds depend on, earliest first.
const DEFAULT_RANKS: &[&str] = &[
    "Namespace",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "ServiceAccount",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "StatefulSet",
    "Job",
    "CronJob",
    "Ingress",
    "APIService",
];

/// Immutable kind → rank table.
#[derive(Debug, Clone)]
pub struct KindRanks {
    ranks: FxHashMap<String, usize>,
}

impl Default for KindRanks {
    fn default() -> Self {
        Self::from_kinds(DEFAULT_RANKS.iter().copied())
    }
}

impl KindRanks {
    pub fn from_kinds<'a>(kinds: impl IntoIterator<Item = &'a str>) -> Self {
        let mut ranks = FxHashMap::default();
        for (i, k) in kinds.into_iter().enumerate() {
            ranks.entry(k.to_string()).or_insert(i);
        }
        Self { ranks }
    }

    pub fn rank(&self, kind: &str) -> Option<usize> {
        self.ranks.get(kind).copied()
    }
}

/// Total order: namespace (none first), kind rank (ranked kinds first,
/// unranked by kind name), apiVersion, name, generateName, uid.
#[derive(Debug, Clone, Copy)]
pub struct DependencyOrderer<'a> {
    ranks: &'a KindRanks,
}

impl<'a> DependencyOrderer<'a> {
    pub fn new(ranks: &'a KindRanks) -> Self {
        Self { ranks }
    }

    fn compare_kind(&self, a: &str, b: &str) -> Ordering {
        match (self.ranks.rank(a), self.ranks.rank(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }

    pub fn compare(&self, a: &RawObj, b: &RawObj) -> Ordering {
        a.namespace()
            .cmp(&b.namespace())
            .then_with(|| self.compare_kind(a.kind(), b.kind()))
            .then_with(|| a.api_version().cmp(b.api_version()))
            .then_with(|| a.name().unwrap_or("").cmp(b.name().unwrap_or("")))
            .then_with(|| a.generate_name().unwrap_or("").cmp(b.generate_name().unwrap_or("")))
            .then_with(|| a.uid().unwrap_or("").cmp(b.uid().unwrap_or("")))
    }

    /// Stable: fully tied objects keep their input order.
    pub fn sort(&self, objs: &mut [RawObj]) {
        objs.sort_by(|a, b| self.compare(a, b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> RawObj {
        let mut v = json!({ "apiVersion": api_version, "kind": kind, "metadata": { "name": name } });
        if let Some(ns) = ns {
            v["metadata"]["namespace"] = json!(ns);
        }
        RawObj::from_value(v).unwrap()
    }

    fn describe(objs: &[RawObj]) -> Vec<String> {
        objs.iter().map(RawObj::describe).collect()
    }

    #[test]
    fn ranked_kinds_come_first() {
        let ranks = KindRanks::default();
        let mut objs = vec![
            obj("apps/v1", "Deployment", Some("a"), "web"),
            obj("example.com/v1", "Widget", Some("a"), "w"),
            obj("v1", "Service", Some("a"), "web"),
            obj("example.com/v1", "Gadget", Some("a"), "g"),
            obj("v1", "ConfigMap", Some("a"), "cfg"),
        ];
        DependencyOrderer::new(&ranks).sort(&mut objs);
        assert_eq!(describe(&objs), ["ConfigMap a/cfg", "Service a/web", "Deployment a/web", "Gadget a/g", "Widget a/w"]);
    }

    #[test]
    fn namespace_is_the_primary_key() {
        let ranks = KindRanks::default();
        let mut objs = vec![
            obj("v1", "ConfigMap", Some("b"), "x"),
            obj("apps/v1", "Deployment", None, "cluster-wide"),
            obj("v1", "Namespace", None, "b"),
            obj("v1", "Secret", Some("a"), "x"),
        ];
        DependencyOrderer::new(&ranks).sort(&mut objs);
        assert_eq!(describe(&objs), ["Namespace b", "Deployment cluster-wide", "Secret a/x", "ConfigMap b/x"]);
    }

    #[test]
    fn ties_break_on_api_version_then_name() {
        let ranks = KindRanks::default();
        let mut objs = vec![
            obj("extensions/v1beta1", "Deployment", None, "a"),
            obj("apps/v1", "Deployment", None, "b"),
            obj("apps/v1", "Deployment", None, "a"),
        ];
        DependencyOrderer::new(&ranks).sort(&mut objs);
        let got: Vec<(String, String)> = objs.iter().map(|o| (o.api_version().to_string(), o.name().unwrap().to_string())).collect();
        assert_eq!(got, [("apps/v1".into(), "a".into()), ("apps/v1".into(), "b".into()), ("extensions/v1beta1".into(), "a".into())]);
    }

    #[test]
    fn generate_name_breaks_ties_between_unnamed_objects() {
        let ranks = KindRanks::default();
        let pod = |prefix: &str| {
            RawObj::from_value(json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "generateName": prefix, "namespace": "a" } })).unwrap()
        };
        let mut objs = vec![pod("worker-"), pod("batch-"), obj("v1", "Pod", Some("a"), "api")];
        DependencyOrderer::new(&ranks).sort(&mut objs);
        let got: Vec<_> = objs.iter().map(|o| o.name().or(o.generate_name()).unwrap_or("")).collect();
        assert_eq!(got, ["batch-", "worker-", "api"]);
    }

    #[test]
    fn uid_is_the_last_tie_breaker() {
        let ranks = KindRanks::default();
        let with_uid = |uid: &str| {
            let mut o = obj("v1", "ConfigMap", Some("a"), "same");
            o.set_uid(uid);
            o
        };
        let mut objs = vec![with_uid("u-3"), with_uid("u-1"), with_uid("u-2")];
        DependencyOrderer::new(&ranks).sort(&mut objs);
        let uids: Vec<_> = objs.iter().filter_map(RawObj::uid).collect();
        assert_eq!(uids, ["u-1", "u-2", "u-3"]);
    }

    #[test]
    fn sorting_is_idempotent_and_stable() {
        let ranks = KindRanks::default();
        let orderer = DependencyOrderer::new(&ranks);
        let mut first = obj("v1", "ConfigMap", None, "same");
        first.set_annotation("marker", "first");
        let mut second = obj("v1", "ConfigMap", None, "same");
        second.set_annotation("marker", "second");
        let mut objs = vec![obj("v1", "Secret", None, "s"), first, obj("v1", "Namespace", None, "n"), second];
        orderer.sort(&mut objs);
        let once = objs.clone();
        orderer.sort(&mut objs);
        assert_eq!(objs, once);
        let markers: Vec<_> = objs.iter().filter_map(|o| o.annotation("marker")).collect();
        assert_eq!(markers, ["first", "second"]);
    }
}
