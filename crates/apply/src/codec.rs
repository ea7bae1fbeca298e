//! Pristine snapshots: the last-applied form of an object, kept on the
//! object itself under the managed annotation as
//! `{"pristine": base64(gzip(json))}`.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use kfold_core::annotations::{DEPLOY_MANAGER, LABEL_DEPLOY_MANAGER, MANAGED};
use kfold_core::RawObj;
use serde_json::{Map, Value as Json};

use crate::error::ApplyError;

const PRISTINE: &str = "pristine";

/// Key order of a map is part of the encoded bytes; sort it explicitly so the
/// output does not depend on how the value was built.
fn canonical(v: &Json) -> Json {
    match v {
        Json::Object(m) => {
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonical(&m[k.as_str()]));
            }
            Json::Object(out)
        }
        Json::Array(a) => Json::Array(a.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

pub fn encode_pristine(snapshot: &Json) -> Result<String, ApplyError> {
    let bytes = serde_json::to_vec(&canonical(snapshot)).map_err(|e| ApplyError::Encoding(e.to_string()))?;
    let mut gz = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    gz.write_all(&bytes).map_err(|e| ApplyError::Encoding(e.to_string()))?;
    let packed = gz.finish().map_err(|e| ApplyError::Encoding(e.to_string()))?;
    Ok(STANDARD.encode(packed))
}

pub fn decode_pristine(encoded: &str) -> Result<Json, ApplyError> {
    let packed = STANDARD.decode(encoded.trim()).map_err(|e| ApplyError::Decoding(format!("base64: {e}")))?;
    let mut bytes = Vec::new();
    GzDecoder::new(packed.as_slice()).read_to_end(&mut bytes).map_err(|e| ApplyError::Decoding(format!("gzip: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApplyError::Decoding(format!("json: {e}")))
}

/// Record the object's current form as its pristine snapshot and mark it as
/// managed. The snapshot is taken before either marker is added.
pub fn tag_managed(obj: &mut RawObj) -> Result<(), ApplyError> {
    let encoded = encode_pristine(obj.as_value())?;
    let mut payload = Map::new();
    payload.insert(PRISTINE.into(), Json::String(encoded));
    obj.set_annotation(MANAGED, &Json::Object(payload).to_string());
    obj.set_label(LABEL_DEPLOY_MANAGER, DEPLOY_MANAGER);
    Ok(())
}

/// Decoded pristine snapshot of a live object; `None` when it carries no
/// managed annotation.
pub fn pristine_of(live: &RawObj) -> Result<Option<Json>, ApplyError> {
    let Some(raw) = live.annotation(MANAGED) else { return Ok(None) };
    let payload: Json = serde_json::from_str(raw).map_err(|e| ApplyError::Decoding(format!("{MANAGED}: {e}")))?;
    match payload.get(PRISTINE).and_then(Json::as_str) {
        Some(encoded) if !encoded.is_empty() => decode_pristine(encoded).map(Some),
        _ => Ok(None),
    }
}

/// The object as it was last applied, or the live object itself when it was
/// never tagged.
pub fn rebuild_object(live: &RawObj) -> Result<RawObj, ApplyError> {
    match pristine_of(live)? {
        Some(snapshot) => Ok(RawObj::from_value(snapshot)?),
        None => Ok(live.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Json {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod", "labels": { "tier": "front", "app": "web" } },
            "spec": { "replicas": 3, "template": { "spec": { "containers": [ { "name": "web", "image": "nginx:1.25", "args": ["-g", "daemon off;"] } ] } } }
        })
    }

    #[test]
    fn round_trip_is_lossless() {
        let d = deployment();
        let enc = encode_pristine(&d).unwrap();
        assert_eq!(decode_pristine(&enc).unwrap(), d);
        assert_eq!(decode_pristine(&encode_pristine(&json!({})).unwrap()).unwrap(), json!({}));
    }

    #[test]
    fn round_trip_keeps_float_bits() {
        for f in [1.0715660391465826e-75, -1.81996730402717e-179, -1.603964615428183e143, -9.643915712060552e-234, 0.1, f64::MAX] {
            let v = json!({ "spec": { "weight": f } });
            let back = decode_pristine(&encode_pristine(&v).unwrap()).unwrap();
            assert_eq!(back["spec"]["weight"].as_f64().map(f64::to_bits), Some(f.to_bits()), "{f:e}");
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(encode_pristine(&deployment()).unwrap(), encode_pristine(&deployment()).unwrap());
    }

    #[test]
    fn decode_reports_each_layer() {
        assert!(matches!(decode_pristine("%%%"), Err(ApplyError::Decoding(m)) if m.starts_with("base64")));
        let not_gzip = STANDARD.encode(b"plain text");
        assert!(matches!(decode_pristine(&not_gzip), Err(ApplyError::Decoding(m)) if m.starts_with("gzip")));
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"{not json").unwrap();
        let bad_json = STANDARD.encode(gz.finish().unwrap());
        assert!(matches!(decode_pristine(&bad_json), Err(ApplyError::Decoding(m)) if m.starts_with("json")));
    }

    #[test]
    fn tag_then_rebuild_recovers_the_desired_object() {
        let desired = RawObj::from_value(deployment()).unwrap();
        let mut tagged = desired.clone();
        tag_managed(&mut tagged).unwrap();
        assert!(tagged.annotation(MANAGED).unwrap().starts_with("{\"pristine\":"));
        assert_eq!(tagged.label(LABEL_DEPLOY_MANAGER), Some(DEPLOY_MANAGER));
        assert_eq!(rebuild_object(&tagged).unwrap(), desired);
    }

    #[test]
    fn rebuild_without_annotation_returns_live() {
        let live = RawObj::from_value(deployment()).unwrap();
        assert_eq!(pristine_of(&live).unwrap(), None);
        assert_eq!(rebuild_object(&live).unwrap(), live);
    }

    #[test]
    fn corrupt_annotation_is_a_decoding_error() {
        let mut live = RawObj::from_value(deployment()).unwrap();
        live.set_annotation(MANAGED, "{\"pristine\":\"!!!\"}");
        assert!(matches!(pristine_of(&live), Err(ApplyError::Decoding(_))));
        live.set_annotation(MANAGED, "not json");
        assert!(matches!(pristine_of(&live), Err(ApplyError::Decoding(_))));
    }
}
