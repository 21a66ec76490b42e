// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use serde_json::Value;

use crate::app::types::{BackendKind, Params};

/// Layer name holding defaults shared by every provider.
pub const GLOBAL_LAYER: &str = "all";

/// Merges `additional` over `base`.
///
/// Keys holding lists on both sides are concatenated (base first); every other key
/// is replaced by the value from `additional`.
pub fn merge_params(base: &Params, additional: &Params) -> Params {
    let mut merged = base.clone();
    for (key, value) in additional {
        match (merged.get_mut(key), value) {
            (Some(Value::Array(existing)), Value::Array(extra)) => {
                existing.extend(extra.iter().cloned());
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Resolves the default parameter set for one provider from the configured layers:
/// global (`all`) < backend type (`local`/`gcp`) < provider name.
pub fn layered_defaults(
    layers: &std::collections::BTreeMap<String, Params>,
    kind: BackendKind,
    provider_name: &str,
) -> Params {
    let mut out = layers.get(GLOBAL_LAYER).cloned().unwrap_or_default();
    if let Some(by_kind) = layers.get(kind.as_str()) {
        out = merge_params(&out, by_kind);
    }
    if provider_name != kind.as_str() && provider_name != GLOBAL_LAYER {
        if let Some(by_name) = layers.get(provider_name) {
            out = merge_params(&out, by_name);
        }
    }
    out
}

pub fn param_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Reads a scalar as text, accepting numbers and booleans too (`disk-size = 10`).
pub fn param_text(params: &Params, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(value) => Some(value.trim().to_string()).filter(|v| !v.is_empty()),
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}

pub fn param_bool(params: &Params, key: &str) -> Option<bool> {
    match params.get(key)? {
        Value::Bool(value) => Some(*value),
        Value::String(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn param_list(params: &Params, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(value) => Some(value.clone()),
                Value::Number(value) => Some(value.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(value)) => vec![value.clone()],
        _ => Vec::new(),
    }
}

/// Parses `key=value` pairs given on the command line. Values that parse as JSON
/// (numbers, booleans, lists) keep their type; everything else is a string.
pub fn parse_param_pairs(pairs: &[String]) -> Result<Params, String> {
    let mut out = Params::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(format!("expected key=value, got '{pair}'"));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in '{pair}'"));
        }
        let value = serde_json::from_str::<Value>(raw.trim())
            .ok()
            .filter(|value| !value.is_object())
            .unwrap_or_else(|| Value::String(raw.trim().to_string()));
        out.insert(key.to_string(), value);
    }
    Ok(out)
}
