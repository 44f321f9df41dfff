// Copyright 2025 Datapunk Contributors.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use serde_json::value::{Map, Value};

const KEY_SEPARATOR: &str = "_";

#[inline]
pub fn flatten(to_flatten: Value) -> Result<Value, anyhow::Error> {
    flatten_with_level(to_flatten, 0)
}

/// Flattens the provided JSON object (`to_flatten`) into a single level map.
/// `max_level` 0 means unlimited depth, otherwise nesting below `max_level`
/// is kept as a JSON string.
///
/// # Errors
/// Will return `Err` if `to_flatten` is not an object.
pub fn flatten_with_level(to_flatten: Value, max_level: u32) -> Result<Value, anyhow::Error> {
    let to_flatten = match to_flatten {
        Value::Object(v) => {
            if v.is_empty() || !v.iter().any(|(_k, v)| v.is_object() || v.is_array()) {
                return Ok(Value::Object(v));
            }
            Value::Object(v)
        }
        _ => {
            return Err(anyhow::anyhow!("flatten value must be an object"));
        }
    };

    let mut flat = Map::<String, Value>::new();
    flatten_value(to_flatten, "".to_owned(), max_level, 0, &mut flat)?;
    Ok(Value::Object(flat))
}

fn flatten_value(
    current: Value,
    parent_key: String,
    max_level: u32,
    depth: u32,
    flattened: &mut Map<String, Value>,
) -> Result<(), anyhow::Error> {
    if max_level > 0 && depth >= max_level {
        // depth limited, keep the rest as a serialized blob
        flattened.insert(parent_key, Value::String(current.to_string()));
        return Ok(());
    }
    match current {
        Value::Object(map) => {
            if map.is_empty() && !parent_key.is_empty() {
                flattened.insert(parent_key.clone(), Value::Object(Map::new()));
            }
            for (k, v) in map {
                let key = if parent_key.is_empty() {
                    k
                } else {
                    format!("{parent_key}{KEY_SEPARATOR}{k}")
                };
                flatten_value(v, key, max_level, depth + 1, flattened)?;
            }
        }
        Value::Array(arr) => {
            if arr.is_empty() && !parent_key.is_empty() {
                flattened.insert(parent_key.clone(), Value::Array(vec![]));
            }
            for (i, v) in arr.into_iter().enumerate() {
                let key = if parent_key.is_empty() {
                    i.to_string()
                } else {
                    format!("{parent_key}{KEY_SEPARATOR}{i}")
                };
                flatten_value(v, key, max_level, depth + 1, flattened)?;
            }
        }
        _ => {
            flattened.insert(parent_key, current);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_flatten_nested() {
        let v = json!({"a": {"b": 1, "c": [2, 3]}, "d": "x"});
        let flat = flatten(v).unwrap();
        assert_eq!(flat, json!({"a_b": 1, "a_c_0": 2, "a_c_1": 3, "d": "x"}));
    }

    #[test]
    fn test_flatten_depth_limited() {
        let v = json!({"a": {"b": {"c": 1}}});
        let flat = flatten_with_level(v, 2).unwrap();
        let obj = flat.as_object().unwrap();
        assert!(obj.get("a_b").unwrap().is_string());
    }

    #[test]
    fn test_flatten_rejects_scalar() {
        assert!(flatten(json!(42)).is_err());
    }

    #[test]
    fn test_flatten_already_flat() {
        let v = json!({"a": 1, "b": "x"});
        assert_eq!(flatten(v.clone()).unwrap(), v);
    }
}
