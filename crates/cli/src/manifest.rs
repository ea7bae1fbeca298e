//! Rendered manifests on disk as an object source.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use kfold_apply::ObjectSource;
use kfold_core::annotations::COMPONENT;
use kfold_core::RawObj;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

fn max_manifest_bytes() -> u64 {
    std::env::var("KFOLD_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(8 * 1024 * 1024)
}

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Reads YAML/JSON manifest files. Each file is one component, named by its
/// file stem; directories contribute their manifest files in name order.
pub struct ManifestSource {
    paths: Vec<PathBuf>,
}

impl ManifestSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    fn files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for p in &self.paths {
            if p.is_dir() {
                let mut entries: Vec<PathBuf> = std::fs::read_dir(p)
                    .with_context(|| format!("listing {}", p.display()))?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|f| f.is_file() && f.extension().and_then(|x| x.to_str()).is_some_and(|x| EXTENSIONS.contains(&x)))
                    .collect();
                entries.sort();
                out.extend(entries);
            } else {
                out.push(p.clone());
            }
        }
        Ok(out)
    }
}

fn component_of(path: &Path) -> String {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_string()
}

fn flatten(doc: Json, out: &mut Vec<Json>) {
    let is_list = doc.get("kind").and_then(Json::as_str).is_some_and(|k| k == "List" || k.ends_with("List"))
        && doc.get("items").is_some_and(Json::is_array);
    if !is_list {
        out.push(doc);
        return;
    }
    if let Some(Json::Array(items)) = doc.get("items").cloned() {
        for item in items {
            flatten(item, out);
        }
    }
}

/// Parse a multi-document manifest; `kind: List` documents are flattened and
/// every object is annotated with `component`.
pub fn parse_manifest(text: &str, component: &str) -> Result<Vec<RawObj>> {
    let mut docs = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(de).with_context(|| format!("document {}", i + 1))?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(value).with_context(|| format!("document {}: converting to JSON", i + 1))?;
        flatten(json, &mut docs);
    }
    docs.into_iter()
        .enumerate()
        .map(|(i, v)| {
            let mut obj = RawObj::from_value(v).map_err(|e| anyhow!("object {}: {e}", i + 1))?;
            if !component.is_empty() {
                obj.set_annotation(COMPONENT, component);
            }
            Ok(obj)
        })
        .collect()
}

#[async_trait::async_trait]
impl ObjectSource for ManifestSource {
    async fn objects(&self, env: &str, components: &[String]) -> Result<Vec<RawObj>> {
        let mut out = Vec::new();
        for file in self.files()? {
            let component = component_of(&file);
            if !components.is_empty() && !components.iter().any(|c| *c == component) {
                continue;
            }
            let size = std::fs::metadata(&file).with_context(|| format!("reading {}", file.display()))?.len();
            if size > max_manifest_bytes() {
                return Err(anyhow!("{} is too large ({size} bytes > {})", file.display(), max_manifest_bytes()));
            }
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let objs = parse_manifest(&text, &component).with_context(|| format!("parsing {}", file.display()))?;
            debug!(env, file = %file.display(), objects = objs.len(), "manifest loaded");
            out.extend(objs);
        }
        if out.is_empty() {
            return Err(anyhow!("no objects found for environment {env}"));
        }
        Ok(out)
    }
}
