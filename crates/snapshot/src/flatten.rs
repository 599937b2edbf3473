//! Flattening nested state dicts into logical paths and back
//!
//! `flatten` walks a nested state representation and produces flat
//! `path -> value` pairs plus container entries describing the nesting;
//! `inflate` is its exact inverse. Round-trip law:
//! `inflate(flatten(x)) == x` in structure, including empty containers.

use crate::manifest::{DictEntry, Entry, Manifest};
use snapshot_core::{Error, Result, StateDict, StateValue, Value};
use std::collections::BTreeMap;

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    }
}

/// Flatten a nested state dict rooted at `prefix`.
///
/// Returns the structural manifest (container entries only; leaf entries are
/// added later during write planning) and the flat `path -> value` map.
pub fn flatten(state_dict: &StateDict, prefix: &str) -> (Manifest, BTreeMap<String, Value>) {
    let mut manifest = Manifest::new();
    let mut flattened = BTreeMap::new();
    manifest.insert(
        prefix.to_string(),
        Entry::Dict(DictEntry {
            keys: state_dict.keys().cloned().collect(),
        }),
    );
    flatten_into(state_dict, prefix, &mut manifest, &mut flattened);
    (manifest, flattened)
}

fn flatten_into(
    state_dict: &StateDict,
    prefix: &str,
    manifest: &mut Manifest,
    flattened: &mut BTreeMap<String, Value>,
) {
    for (key, state_value) in state_dict {
        let path = join(prefix, key);
        match state_value {
            StateValue::Dict(nested) => {
                manifest.insert(
                    path.clone(),
                    Entry::Dict(DictEntry {
                        keys: nested.keys().cloned().collect(),
                    }),
                );
                flatten_into(nested, &path, manifest, flattened);
            }
            StateValue::Leaf(value) => {
                flattened.insert(path, value.clone());
            }
        }
    }
}

/// Reconstruct the nested state dict rooted at `prefix` from flat values.
///
/// Exact inverse of [`flatten`]: the container entries in `manifest` drive
/// the nesting shape; leaves are taken from `flattened`.
pub fn inflate(
    manifest: &Manifest,
    flattened: &BTreeMap<String, Value>,
    prefix: &str,
) -> Result<StateDict> {
    let root = match manifest.get(prefix) {
        Some(Entry::Dict(d)) => d,
        Some(_) => {
            return Err(Error::Validation {
                message: format!("\"{}\" is not a container entry", prefix),
            })
        }
        None => {
            return Err(Error::Validation {
                message: format!("no container entry for prefix \"{}\"", prefix),
            })
        }
    };

    let mut state_dict = StateDict::new();
    for key in &root.keys {
        let path = join(prefix, key);
        if let Some(Entry::Dict(_)) = manifest.get(&path) {
            state_dict.insert(key.clone(), StateValue::Dict(inflate(manifest, flattened, &path)?));
        } else {
            let value = flattened.get(&path).ok_or_else(|| Error::Validation {
                message: format!("missing flattened value for path \"{}\"", path),
            })?;
            state_dict.insert(key.clone(), StateValue::Leaf(value.clone()));
        }
    }
    Ok(state_dict)
}
