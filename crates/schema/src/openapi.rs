//! Patch metadata read from the server's OpenAPI v2 document.
//!
//! Only the `x-kubernetes-patch-strategy` / `x-kubernetes-patch-merge-key`
//! extensions matter here; everything else in the schema is ignored.

use std::collections::HashMap;
use std::sync::Arc;

use kfold_core::Gvk;
use serde_json::{Map, Value as Json};

use crate::SchemaError;

const MAX_REF_DEPTH: usize = 16;

/// Built-in API definitions are published under this prefix. Custom
/// resources get reversed-group names and the server rejects strategic
/// patches for them.
const BUILTIN_PREFIX: &str = "io.k8s.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListStrategy {
    /// Replace the whole list.
    Atomic,
    /// Merge elements of an object list by the given key.
    MergeByKey(String),
    /// Merge a list of scalars as a set.
    MergePrimitive,
}

/// Why no patch metadata is available for a kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoPatchMeta {
    NotPublished,
    CustomResource,
}

/// Index over `definitions`, keyed by `x-kubernetes-group-version-kind`.
#[derive(Debug, Clone)]
pub struct SchemaIndex {
    defs: Arc<Map<String, Json>>,
    by_gvk: HashMap<Gvk, String>,
}

impl SchemaIndex {
    pub fn from_openapi_v2(doc: &Json) -> Result<Self, SchemaError> {
        let defs = doc.get("definitions").and_then(Json::as_object).ok_or(SchemaError::NoDefinitions)?.clone();
        let mut by_gvk: HashMap<Gvk, String> = HashMap::new();
        for (name, def) in defs.iter() {
            let Some(gvks) = def.get("x-kubernetes-group-version-kind").and_then(Json::as_array) else { continue };
            for g in gvks {
                let field = |k: &str| g.get(k).and_then(Json::as_str).unwrap_or("").to_string();
                let gvk = Gvk::new(field("group"), field("version"), field("kind"));
                if gvk.kind.is_empty() || gvk.version.is_empty() {
                    continue;
                }
                // Built-in definitions win if a kind is published twice.
                match by_gvk.get(&gvk) {
                    Some(existing) if is_builtin(existing) => {}
                    _ => {
                        by_gvk.insert(gvk, name.clone());
                    }
                }
            }
        }
        tracing::debug!(definitions = defs.len(), kinds = by_gvk.len(), "openapi schema indexed");
        Ok(Self { defs: Arc::new(defs), by_gvk })
    }

    pub fn len(&self) -> usize {
        self.by_gvk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gvk.is_empty()
    }

    pub fn lookup(&self, gvk: &Gvk) -> Result<PatchMeta, NoPatchMeta> {
        let name = self.by_gvk.get(gvk).ok_or(NoPatchMeta::NotPublished)?;
        if !is_builtin(name) {
            return Err(NoPatchMeta::CustomResource);
        }
        let node = self.defs.get(name).cloned().ok_or(NoPatchMeta::NotPublished)?;
        Ok(PatchMeta { defs: Arc::clone(&self.defs), node })
    }
}

fn is_builtin(def_name: &str) -> bool {
    def_name.starts_with(BUILTIN_PREFIX)
}

/// A cursor into the schema positioned at one field.
#[derive(Debug, Clone)]
pub struct PatchMeta {
    defs: Arc<Map<String, Json>>,
    node: Json,
}

impl PatchMeta {
    fn resolved(&self) -> &Json {
        let mut cur = &self.node;
        for _ in 0..MAX_REF_DEPTH {
            let target = ref_of(cur).and_then(|r| r.strip_prefix("#/definitions/")).and_then(|n| self.defs.get(n));
            match target {
                Some(t) => cur = t,
                None => break,
            }
        }
        cur
    }

    fn child(&self, node: &Json) -> PatchMeta {
        PatchMeta { defs: Arc::clone(&self.defs), node: node.clone() }
    }

    /// Schema of an object field, or of map values when the object is a map.
    pub fn field(&self, key: &str) -> Option<PatchMeta> {
        let node = self.resolved();
        if let Some(prop) = node.get("properties").and_then(|p| p.get(key)) {
            return Some(self.child(prop));
        }
        node.get("additionalProperties").filter(|a| a.is_object()).map(|a| self.child(a))
    }

    /// Schema of array elements.
    pub fn items(&self) -> Option<PatchMeta> {
        self.resolved().get("items").filter(|i| i.is_object()).map(|i| self.child(i))
    }

    /// List strategy declared on this field. Extensions sit on the property
    /// itself, not on the referenced definition.
    pub fn list_strategy(&self) -> ListStrategy {
        let strategy = self.node.get("x-kubernetes-patch-strategy").and_then(Json::as_str).unwrap_or("");
        if !strategy.split(',').any(|s| s.trim() == "merge") {
            return ListStrategy::Atomic;
        }
        match self.node.get("x-kubernetes-patch-merge-key").and_then(Json::as_str) {
            Some(key) if !key.is_empty() => ListStrategy::MergeByKey(key.to_string()),
            _ => ListStrategy::MergePrimitive,
        }
    }
}

fn ref_of(node: &Json) -> Option<&str> {
    if let Some(r) = node.get("$ref").and_then(Json::as_str) {
        return Some(r);
    }
    // Newer servers wrap references as `allOf: [{$ref}]` to attach descriptions.
    node.get("allOf").and_then(Json::as_array).and_then(|a| a.first()).and_then(|f| f.get("$ref")).and_then(Json::as_str)
}
