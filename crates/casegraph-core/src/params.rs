//! Typed accessors over the free-form JSON parameter bags carried by
//! analysis requests.

use crate::JsonMap;
use serde_json::Value;

pub fn str_param<'a>(map: &'a JsonMap, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

pub fn bool_param(map: &JsonMap, key: &str, default: bool) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub fn f64_param(map: &JsonMap, key: &str, default: f64) -> f64 {
    map.get(key).and_then(Value::as_f64).unwrap_or(default)
}

pub fn usize_param(map: &JsonMap, key: &str, default: usize) -> usize {
    map.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

/// Reads an array of strings; non-string elements are dropped.
pub fn string_list_param(map: &JsonMap, key: &str) -> Option<Vec<String>> {
    map.get(key).and_then(Value::as_array).map(|values| {
        values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}
