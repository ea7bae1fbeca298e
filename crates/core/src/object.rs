use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::Gvk;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ObjError {
    #[error("object is not a JSON mapping")]
    NotAnObject,
    #[error("object missing {0}")]
    MissingField(&'static str),
}

/// A Kubernetes-style object kept in its raw JSON form.
///
/// Used both for desired objects coming from manifests and for live objects
/// returned by the store. Construction guarantees `apiVersion`, `kind` and a
/// `metadata` mapping carrying `name` or `generateName`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Json", into = "Json")]
pub struct RawObj(Json);

impl TryFrom<Json> for RawObj {
    type Error = ObjError;

    fn try_from(v: Json) -> Result<Self, Self::Error> {
        RawObj::from_value(v)
    }
}

impl From<RawObj> for Json {
    fn from(o: RawObj) -> Json {
        o.0
    }
}

impl RawObj {
    pub fn from_value(v: Json) -> Result<Self, ObjError> {
        let obj = v.as_object().ok_or(ObjError::NotAnObject)?;
        if !obj.get("apiVersion").is_some_and(Json::is_string) {
            return Err(ObjError::MissingField("apiVersion"));
        }
        if !obj.get("kind").is_some_and(Json::is_string) {
            return Err(ObjError::MissingField("kind"));
        }
        let meta = obj.get("metadata").and_then(Json::as_object).ok_or(ObjError::MissingField("metadata"))?;
        let has_name = |k: &str| meta.get(k).and_then(Json::as_str).is_some_and(|s| !s.is_empty());
        if !has_name("name") && !has_name("generateName") {
            return Err(ObjError::MissingField("metadata.name"));
        }
        Ok(Self(v))
    }

    pub fn as_value(&self) -> &Json {
        &self.0
    }

    pub fn into_value(self) -> Json {
        self.0
    }

    fn str_at(&self, top: &str) -> &str {
        self.0.get(top).and_then(Json::as_str).unwrap_or("")
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get(key)).and_then(Json::as_str).filter(|s| !s.is_empty())
    }

    fn meta_mut(&mut self) -> Option<&mut Map<String, Json>> {
        self.0.as_object_mut().and_then(|root| child_map(root, "metadata"))
    }

    fn string_map_mut(&mut self, key: &str) -> Option<&mut Map<String, Json>> {
        self.meta_mut().and_then(|meta| child_map(meta, key))
    }

    pub fn api_version(&self) -> &str {
        self.str_at("apiVersion")
    }

    pub fn kind(&self) -> &str {
        self.str_at("kind")
    }

    pub fn gvk(&self) -> Gvk {
        Gvk::from_api_version(self.api_version(), self.kind())
    }

    pub fn name(&self) -> Option<&str> {
        self.meta_str("name")
    }

    pub fn set_name(&mut self, name: &str) {
        if let Some(meta) = self.meta_mut() {
            meta.insert("name".into(), Json::String(name.to_string()));
        }
    }

    pub fn generate_name(&self) -> Option<&str> {
        self.meta_str("generateName")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace")
    }

    pub fn set_namespace(&mut self, ns: &str) {
        if let Some(meta) = self.meta_mut() {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta_str("uid")
    }

    pub fn set_uid(&mut self, uid: &str) {
        if let Some(meta) = self.meta_mut() {
            meta.insert("uid".into(), Json::String(uid.to_string()));
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta_str("resourceVersion")
    }

    pub fn set_resource_version(&mut self, rv: Option<&str>) {
        let Some(meta) = self.meta_mut() else { return };
        match rv {
            Some(rv) => {
                meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
            }
            None => {
                meta.remove("resourceVersion");
            }
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(Json::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        if let Some(m) = self.string_map_mut("annotations") {
            m.insert(key.to_string(), Json::String(value.to_string()));
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get("labels")).and_then(|a| a.get(key)).and_then(Json::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        if let Some(m) = self.string_map_mut("labels") {
            m.insert(key.to_string(), Json::String(value.to_string()));
        }
    }

    /// True when an owner reference marks a controller; such objects are pruned by their controller.
    pub fn has_controller_owner(&self) -> bool {
        self.0
            .get("metadata")
            .and_then(|m| m.get("ownerReferences"))
            .and_then(Json::as_array)
            .is_some_and(|refs| refs.iter().any(|r| r.get("controller").and_then(Json::as_bool).unwrap_or(false)))
    }

    /// `Kind ns/name`, or `Kind name` for cluster-scoped objects.
    pub fn describe(&self) -> String {
        let name = self.name().or(self.generate_name()).unwrap_or("");
        match self.namespace() {
            Some(ns) => format!("{} {}/{}", self.kind(), ns, name),
            None => format!("{} {}", self.kind(), name),
        }
    }
}

/// The mapping under `key`, created or replacing a non-mapping value.
fn child_map<'m>(parent: &'m mut Map<String, Json>, key: &str) -> Option<&'m mut Map<String, Json>> {
    let slot = parent.entry(key).or_insert_with(|| Json::Object(Map::new()));
    if !slot.is_object() {
        *slot = Json::Object(Map::new());
    }
    slot.as_object_mut()
}
