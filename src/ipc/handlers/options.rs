use crate::calc::YearOption;
use crate::ipc::error::ok;
use crate::ipc::helpers::{dataset, optional_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::HashSet;

/// Distinct values in first-seen order.
fn distinct<'a, I>(values: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    values.into_iter().filter(|v| seen.insert(*v)).collect()
}

fn handle_popularity_options(state: &mut AppState, req: &Request) -> serde_json::Value {
    let ds = match dataset(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let completed: Vec<_> = ds
        .students
        .iter()
        .filter(|s| s.final_result.is_completed())
        .collect();

    ok(
        &req.id,
        json!({
            "genders": distinct(completed.iter().map(|s| s.gender.as_str())),
            "regions": distinct(completed.iter().map(|s| s.region.as_str())),
            "educations": distinct(completed.iter().map(|s| s.highest_education.as_str())),
            "ageBands": distinct(completed.iter().map(|s| s.age_band.as_str())),
            "years": YearOption::ALL.iter().map(|y| y.as_str()).collect::<Vec<_>>(),
        }),
    )
}

fn handle_weighted_score_options(state: &mut AppState, req: &Request) -> serde_json::Value {
    let ds = match dataset(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut seen = HashSet::new();
    let student_ids: Vec<i64> = ds
        .submissions
        .iter()
        .map(|s| s.student_id)
        .filter(|id| seen.insert(*id))
        .collect();
    ok(&req.id, json!({ "studentIds": student_ids }))
}

fn handle_pass_rate_options(state: &mut AppState, req: &Request) -> serde_json::Value {
    let ds = match dataset(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let module_code = optional_str(req, "moduleCode");
    let presentation_code = optional_str(req, "presentationCode");

    let modules = distinct(ds.assessments.iter().map(|a| a.module_code.as_str()));
    let presentations = distinct(ds.assessments.iter().map(|a| a.presentation_code.as_str()));

    // Only assessments of the chosen offering are selectable.
    let mut assessment_ids: Vec<i64> = Vec::new();
    let mut assessments: Vec<serde_json::Value> = Vec::new();
    if let (Some(m), Some(p)) = (&module_code, &presentation_code) {
        let mut seen = HashSet::new();
        for a in ds
            .assessments
            .iter()
            .filter(|a| &a.module_code == m && &a.presentation_code == p)
        {
            if !seen.insert(a.assessment_id) {
                continue;
            }
            assessment_ids.push(a.assessment_id);
            assessments.push(json!({
                "assessmentId": a.assessment_id,
                "assessmentType": a.assessment_type,
                "weight": a.weight,
                "date": a.date,
            }));
        }
    }

    ok(
        &req.id,
        json!({
            "modules": modules,
            "presentations": presentations,
            "assessmentIds": assessment_ids,
            "assessments": assessments,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "popularity.options" => Some(handle_popularity_options(state, req)),
        "weightedScore.options" => Some(handle_weighted_score_options(state, req)),
        "passRate.options" => Some(handle_pass_rate_options(state, req)),
        _ => None,
    }
}
