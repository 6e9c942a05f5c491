use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::tables::Dataset;
use serde::de::DeserializeOwned;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn dataset<'a>(state: &'a AppState, req: &Request) -> Result<&'a Dataset, serde_json::Value> {
    state
        .dataset
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_dataset", "open a dataset first", None))
}

/// Deserializes the whole params object into `T`.
pub fn parse_params<T: DeserializeOwned>(req: &Request) -> Result<T, serde_json::Value> {
    let raw = if req.params.is_null() {
        serde_json::json!({})
    } else {
        req.params.clone()
    };
    serde_json::from_value(raw).map_err(|e| err(&req.id, "bad_params", e.to_string(), None))
}
