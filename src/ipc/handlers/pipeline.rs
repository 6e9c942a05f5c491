use crate::calc::{self, PipelineRequest, PopularityFilters};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{dataset, parse_params, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn run_request(state: &AppState, req: &Request, pipeline: PipelineRequest) -> serde_json::Value {
    let ds = match dataset(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match calc::run(&pipeline, ds) {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_pipeline_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    match parse_params::<PipelineRequest>(req) {
        Ok(pipeline) => run_request(state, req, pipeline),
        Err(e) => e,
    }
}

fn handle_popularity_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let filters = match req.params.get("filters") {
        None => PopularityFilters::default(),
        Some(v) if v.is_null() => PopularityFilters::default(),
        Some(v) => match serde_json::from_value::<PopularityFilters>(v.clone()) {
            Ok(f) => f,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("invalid filters: {}", e),
                    Some(json!({ "filters": v })),
                )
            }
        },
    };
    run_request(state, req, PipelineRequest::Popularity { filters })
}

fn handle_weighted_score_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    run_request(state, req, PipelineRequest::WeightedScore { student_id })
}

fn handle_pass_rate_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let module_code = match required_str(req, "moduleCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let presentation_code = match required_str(req, "presentationCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_ids = match req.params.get("assessmentIds") {
        None => Vec::new(),
        Some(v) if v.is_null() => Vec::new(),
        Some(v) => {
            let Some(raw) = v.as_array() else {
                return err(&req.id, "bad_params", "assessmentIds must be an array", None);
            };
            let mut ids = Vec::with_capacity(raw.len());
            for item in raw {
                let Some(id) = item.as_i64() else {
                    return err(
                        &req.id,
                        "bad_params",
                        "assessmentIds must contain only integers",
                        Some(json!({ "value": item })),
                    );
                };
                ids.push(id);
            }
            ids
        }
    };
    run_request(
        state,
        req,
        PipelineRequest::PassRate {
            module_code,
            presentation_code,
            assessment_ids,
        },
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "pipeline.run" => Some(handle_pipeline_run(state, req)),
        "popularity.open" => Some(handle_popularity_open(state, req)),
        "weightedScore.open" => Some(handle_weighted_score_open(state, req)),
        "passRate.open" => Some(handle_pass_rate_open(state, req)),
        _ => None,
    }
}
