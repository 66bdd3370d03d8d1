//! Layered configuration: YAML files merged in order, canonicalized to JSON
//! and fingerprinted, then consumed as typed [`Settings`] with env overrides.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

mod settings;

pub use settings::{LockMode, Settings};

/// A merged, canonicalized config blob and its fingerprint.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Canonicalize (stable key order, compact encoding) and fingerprint a
    /// merged blob. Every constructor funnels through here, so the hash is
    /// always taken over the canonical bytes.
    fn from_value(merged: Value) -> Result<Self> {
        let config_json = canonicalize(merged);
        let canonical_json =
            serde_json::to_string(&config_json).context("canonical config encode failed")?;
        let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));

        Ok(Self {
            config_json,
            canonical_json,
            config_hash,
        })
    }

    /// No config layers at all; settings come from defaults plus env.
    pub fn empty() -> Self {
        Self::from_value(Value::Object(Map::new())).expect("empty config canonicalizes")
    }
}

/// Read and merge YAML layers in order (later layers win), then
/// canonicalize and hash the result.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Map::new());

    for path in paths {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config layer {path} failed"))?;
        let layer: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config layer {path} failed"))?;
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("config layer {path} is not json-representable"))?;
        merged = merge_layers(merged, layer);
    }

    LoadedConfig::from_value(merged)
}

/// Later layers win: objects merge key-by-key, everything else (arrays
/// included) is replaced wholesale.
fn merge_layers(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged_val = match base_map.remove(&key) {
                    Some(base_val) => merge_layers(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged_val);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Rebuild every object with its keys in sorted order so the compact
/// encoding is deterministic regardless of layer order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.into_iter().collect();
            let mut out = Map::with_capacity(sorted.len());
            for (key, val) in sorted {
                out.insert(key, canonicalize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        scalar => scalar,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn layer_merge_overrides_scalars_and_merges_objects() {
        let merged = merge_layers(
            json!({"a": {"x": 1, "y": 2}, "b": [1, 2]}),
            json!({"a": {"y": 3, "z": 4}, "b": [9]}),
        );
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": [9]}));
    }

    #[test]
    fn later_layer_wins_on_type_conflicts() {
        assert_eq!(
            merge_layers(json!({"a": {"x": 1}}), json!({"a": 7})),
            json!({"a": 7})
        );
        assert_eq!(merge_layers(json!(1), json!({"a": 2})), json!({"a": 2}));
    }

    #[test]
    fn canonical_encoding_is_key_order_independent() {
        let a = LoadedConfig::from_value(json!({"b": 1, "a": {"d": 2, "c": 3}})).unwrap();
        let b = LoadedConfig::from_value(json!({"a": {"c": 3, "d": 2}, "b": 1})).unwrap();
        assert_eq!(a.canonical_json, b.canonical_json);
        assert_eq!(a.config_hash, b.config_hash);
    }

    #[test]
    fn canonicalization_preserves_array_order() {
        let loaded = LoadedConfig::from_value(json!({"xs": [3, 1, 2]})).unwrap();
        assert_eq!(loaded.canonical_json, r#"{"xs":[3,1,2]}"#);
    }

    #[test]
    fn empty_config_hash_is_stable() {
        let a = LoadedConfig::empty();
        let b = LoadedConfig::empty();
        assert_eq!(a.canonical_json, "{}");
        assert_eq!(a.config_hash, b.config_hash);
    }
}
