//! Three-way patch computation and application.
//!
//! `three_way` computes the changes that turn `current` into `modified` while
//! deleting only the fields that disappeared between `original` (what was
//! applied last time) and `modified`. Fields owned by other writers, present
//! in `current` but never in `original`, are left alone.
//!
//! With patch metadata the result is a strategic merge patch: object lists
//! with a merge key are merged element-wise and removals are expressed with
//! `$patch: delete`; scalar lists with the merge strategy use
//! `$deleteFromPrimitiveList/<field>`. Without metadata every list is atomic
//! and the result is a plain RFC 7386 merge patch.

use kfold_core::PatchBody;
use serde_json::{Map, Value as Json};

use crate::openapi::{ListStrategy, PatchMeta};

pub const PATCH_DIRECTIVE: &str = "$patch";
pub const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";

pub fn three_way(original: Option<&Json>, modified: &Json, current: &Json, meta: Option<&PatchMeta>) -> Map<String, Json> {
    let empty = Map::new();
    let original = original.and_then(Json::as_object).unwrap_or(&empty);
    let modified = modified.as_object().unwrap_or(&empty);
    let current = current.as_object().unwrap_or(&empty);
    diff_maps(original, current, modified, meta)
}

fn diff_maps(original: &Map<String, Json>, current: &Map<String, Json>, modified: &Map<String, Json>, meta: Option<&PatchMeta>) -> Map<String, Json> {
    let empty = Map::new();
    let mut patch = Map::new();
    for (k, mv) in modified {
        let Some(cv) = current.get(k) else {
            patch.insert(k.clone(), mv.clone());
            continue;
        };
        if cv == mv {
            continue;
        }
        let child = meta.and_then(|m| m.field(k));
        let ov = original.get(k);
        match (cv, mv) {
            (Json::Object(c), Json::Object(m)) => {
                let o = ov.and_then(Json::as_object).unwrap_or(&empty);
                let sub = diff_maps(o, c, m, child.as_ref());
                if !sub.is_empty() {
                    patch.insert(k.clone(), Json::Object(sub));
                }
            }
            (Json::Array(c), Json::Array(m)) => {
                diff_list(k, ov.and_then(Json::as_array).map(Vec::as_slice), c, m, child.as_ref(), &mut patch);
            }
            _ => {
                patch.insert(k.clone(), mv.clone());
            }
        }
    }
    for k in original.keys() {
        if !modified.contains_key(k) && current.contains_key(k) {
            patch.insert(k.clone(), Json::Null);
        }
    }
    patch
}

fn key_of<'a>(item: &'a Json, merge_key: &str) -> Option<&'a Json> {
    item.as_object().and_then(|o| o.get(merge_key))
}

fn find_by_key<'a>(items: &'a [Json], merge_key: &str, value: &Json) -> Option<&'a Json> {
    items.iter().find(|i| key_of(i, merge_key) == Some(value))
}

fn keyed(items: &[Json], merge_key: &str) -> bool {
    items.iter().all(|i| key_of(i, merge_key).is_some())
}

fn scalars(items: &[Json]) -> bool {
    items.iter().all(|i| !i.is_object() && !i.is_array())
}

fn diff_list(key: &str, original: Option<&[Json]>, current: &[Json], modified: &[Json], meta: Option<&PatchMeta>, patch: &mut Map<String, Json>) {
    let strategy = meta.map(PatchMeta::list_strategy).unwrap_or(ListStrategy::Atomic);
    match strategy {
        ListStrategy::MergeByKey(mk) if keyed(current, &mk) && keyed(modified, &mk) => {
            let empty = Map::new();
            let items_meta = meta.and_then(PatchMeta::items);
            let mut out = Vec::new();
            for m in modified {
                let Some(kv) = key_of(m, &mk) else { continue };
                match find_by_key(current, &mk, kv) {
                    None => out.push(m.clone()),
                    Some(c) if c == m => {}
                    Some(c) => {
                        let o = original.and_then(|o| find_by_key(o, &mk, kv)).and_then(Json::as_object).unwrap_or(&empty);
                        let (Some(cm), Some(mm)) = (c.as_object(), m.as_object()) else { continue };
                        let mut sub = diff_maps(o, cm, mm, items_meta.as_ref());
                        if !sub.is_empty() {
                            sub.insert(mk.clone(), kv.clone());
                            out.push(Json::Object(sub));
                        }
                    }
                }
            }
            for o in original.unwrap_or(&[]) {
                let Some(kv) = key_of(o, &mk) else { continue };
                if find_by_key(modified, &mk, kv).is_none() && find_by_key(current, &mk, kv).is_some() {
                    let mut directive = Map::new();
                    directive.insert(mk.clone(), kv.clone());
                    directive.insert(PATCH_DIRECTIVE.into(), Json::String("delete".into()));
                    out.push(Json::Object(directive));
                }
            }
            if !out.is_empty() {
                patch.insert(key.to_string(), Json::Array(out));
            }
        }
        ListStrategy::MergePrimitive if scalars(current) && scalars(modified) => {
            let additions: Vec<Json> = modified.iter().filter(|m| !current.contains(m)).cloned().collect();
            let deletions: Vec<Json> = original
                .unwrap_or(&[])
                .iter()
                .filter(|o| !modified.contains(o) && current.contains(o))
                .cloned()
                .collect();
            if !additions.is_empty() {
                patch.insert(key.to_string(), Json::Array(additions));
            }
            if !deletions.is_empty() {
                patch.insert(format!("{DELETE_FROM_PRIMITIVE_LIST}{key}"), Json::Array(deletions));
            }
        }
        _ => {
            patch.insert(key.to_string(), Json::Array(modified.to_vec()));
        }
    }
}

/// Apply a strategic merge patch in place.
pub fn apply_strategic(target: &mut Json, patch: &Json, meta: Option<&PatchMeta>) {
    let Some(p) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    let Json::Object(t) = target else { return };
    for (k, pv) in p {
        if let Some(field) = k.strip_prefix(DELETE_FROM_PRIMITIVE_LIST) {
            if let (Some(Json::Array(items)), Some(del)) = (t.get_mut(field), pv.as_array()) {
                items.retain(|i| !del.contains(i));
            }
            continue;
        }
        let child = meta.and_then(|m| m.field(k));
        match pv {
            Json::Null => {
                t.remove(k);
            }
            Json::Object(_) => {
                let slot = t.entry(k.clone()).or_insert(Json::Null);
                apply_strategic(slot, pv, child.as_ref());
            }
            Json::Array(items) => apply_list(t, k, items, child.as_ref()),
            _ => {
                t.insert(k.clone(), pv.clone());
            }
        }
    }
}

fn apply_list(target: &mut Map<String, Json>, key: &str, items: &[Json], meta: Option<&PatchMeta>) {
    let strategy = meta.map(PatchMeta::list_strategy).unwrap_or(ListStrategy::Atomic);
    if !matches!(target.get(key), Some(Json::Array(_))) {
        let cleaned = items.iter().filter(|i| i.get(PATCH_DIRECTIVE).is_none()).cloned().collect();
        target.insert(key.to_string(), Json::Array(cleaned));
        return;
    }
    let Some(Json::Array(existing)) = target.get_mut(key) else { return };
    match strategy {
        ListStrategy::MergeByKey(mk) => {
            let items_meta = meta.and_then(PatchMeta::items);
            for pe in items {
                let Some(kv) = key_of(pe, &mk).cloned() else {
                    existing.push(pe.clone());
                    continue;
                };
                if pe.get(PATCH_DIRECTIVE).and_then(Json::as_str) == Some("delete") {
                    existing.retain(|e| key_of(e, &mk) != Some(&kv));
                    continue;
                }
                match existing.iter_mut().find(|e| key_of(e, &mk) == Some(&kv)) {
                    Some(e) => apply_strategic(e, pe, items_meta.as_ref()),
                    None => existing.push(pe.clone()),
                }
            }
        }
        ListStrategy::MergePrimitive => {
            for pe in items {
                if !existing.contains(pe) {
                    existing.push(pe.clone());
                }
            }
        }
        ListStrategy::Atomic => *existing = items.to_vec(),
    }
}

/// Apply either patch flavour in place. `meta` is only consulted for strategic patches.
pub fn apply_patch(target: &mut Json, body: &PatchBody, meta: Option<&PatchMeta>) {
    match body {
        PatchBody::Merge(p) => json_patch::merge(target, p),
        PatchBody::Strategic(p) => apply_strategic(target, p, meta),
    }
}
