use crate::ipc::error::{calc_err, ok};
use crate::ipc::helpers::{dataset, required_str};
use crate::ipc::types::{AppState, Request};
use crate::tables;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "dataset": state.dataset.as_ref().map(|d| d.summary())
        }),
    )
}

fn handle_dataset_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = match required_str(req, "path") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };

    // A failed load leaves the previous dataset in place.
    match tables::open_dataset(&path) {
        Ok(ds) => {
            let summary = ds.summary();
            state.dataset = Some(ds);
            ok(&req.id, json!(summary))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_dataset_info(state: &mut AppState, req: &Request) -> serde_json::Value {
    match dataset(state, req) {
        Ok(ds) => ok(
            &req.id,
            json!({
                "summary": ds.summary(),
                "config": ds.config,
            }),
        ),
        Err(e) => e,
    }
}

fn handle_modes_list(_state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "modes": [
                {
                    "mode": "popularity",
                    "label": "Top 5 Popular Presentations",
                    "caption": "View the top 5 popular presentations."
                },
                {
                    "mode": "weightedScore",
                    "label": "What is your weighted score?",
                    "caption": "View your weighted score."
                },
                {
                    "mode": "passRate",
                    "label": "%Pass of the Assignments",
                    "caption": "View the %pass of the assessment."
                }
            ]
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "dataset.open" => Some(handle_dataset_open(state, req)),
        "dataset.info" => Some(handle_dataset_info(state, req)),
        "modes.list" => Some(handle_modes_list(state, req)),
        _ => None,
    }
}
