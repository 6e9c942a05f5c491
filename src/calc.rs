use crate::chart::{Axis, BarPoint, ChartSpec, Lane, Orientation, PieSlice, TextPosition};
use crate::tables::{AssessmentDef, Dataset, STUDENT_INFO_TABLE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

impl std::fmt::Display for CalcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Formats a number the way chart labels show it: no trailing `.0`.
pub fn format_number(v: f64) -> String {
    format!("{}", v)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum YearOption {
    #[serde(rename = "2013")]
    Y2013,
    #[serde(rename = "2014")]
    Y2014,
    #[default]
    #[serde(rename = "both", alias = "2013&2014")]
    Both,
}

impl YearOption {
    pub const ALL: [YearOption; 3] = [YearOption::Y2013, YearOption::Y2014, YearOption::Both];

    pub fn as_str(self) -> &'static str {
        match self {
            YearOption::Y2013 => "2013",
            YearOption::Y2014 => "2014",
            YearOption::Both => "both",
        }
    }

    fn matches(self, year: i64) -> bool {
        match self {
            YearOption::Y2013 => year == 2013,
            YearOption::Y2014 => year == 2014,
            YearOption::Both => year == 2013 || year == 2014,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PopularityFilters {
    pub genders: Vec<String>,
    pub regions: Vec<String>,
    pub educations: Vec<String>,
    pub age_bands: Vec<String>,
    pub year: YearOption,
}

fn selected(selection: &[String], value: &str) -> bool {
    selection.is_empty() || selection.iter().any(|s| s == value)
}

/// Year carried by a presentation code: all of its digits read as one integer
/// (`"2013J"` → 2013).
pub fn presentation_year(presentation_code: &str) -> Result<i64, CalcError> {
    let digits: String = presentation_code
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Err(CalcError::with_details(
            "malformed_presentation_code",
            format!("presentation code {:?} has no year digits", presentation_code),
            json!({ "presentationCode": presentation_code }),
        ));
    }
    digits.parse::<i64>().map_err(|_| {
        CalcError::with_details(
            "malformed_presentation_code",
            format!("presentation code {:?} has an out of range year", presentation_code),
            json!({ "presentationCode": presentation_code }),
        )
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopularityRow {
    pub presentation_key: String,
    pub student_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopularityResult {
    pub filters: PopularityFilters,
    pub rows: Vec<PopularityRow>,
    /// Number of presentations left after filtering, before the top-N cut.
    pub distinct_keys: usize,
    pub chart: ChartSpec,
}

pub fn popularity(ds: &Dataset, filters: &PopularityFilters) -> Result<PopularityResult, CalcError> {
    let cfg = &ds.config;
    let mut students_by_key: BTreeMap<String, HashSet<i64>> = BTreeMap::new();

    for (row, s) in ds.students.iter().enumerate() {
        // Every row must carry a year, including rows the filters drop below.
        let year = presentation_year(&s.presentation_code).map_err(|mut e| {
            e.details = Some(json!({
                "table": STUDENT_INFO_TABLE,
                "row": row,
                "presentationCode": s.presentation_code,
            }));
            e
        })?;
        if !s.final_result.is_completed() {
            continue;
        }
        if !filters.year.matches(year) {
            continue;
        }
        if !selected(&filters.genders, &s.gender)
            || !selected(&filters.regions, &s.region)
            || !selected(&filters.educations, &s.highest_education)
            || !selected(&filters.age_bands, &s.age_band)
        {
            continue;
        }
        students_by_key
            .entry(s.presentation_key())
            .or_default()
            .insert(s.student_id);
    }

    let distinct_keys = students_by_key.len();
    // BTreeMap yields keys ascending; the stable sort keeps that order on ties.
    let mut rows: Vec<PopularityRow> = students_by_key
        .into_iter()
        .map(|(presentation_key, ids)| PopularityRow {
            presentation_key,
            student_count: ids.len(),
        })
        .collect();
    rows.sort_by(|a, b| b.student_count.cmp(&a.student_count));
    rows.truncate(cfg.top_n);

    let chart = ChartSpec::Bar {
        title: format!("Top {} Popular Module Presentations", cfg.top_n),
        orientation: Orientation::Horizontal,
        x: Axis::new("studentCount", "Number of Students"),
        y: Axis::new("presentationKey", "Module Presentation"),
        series: rows
            .iter()
            .map(|r| BarPoint {
                label: r.presentation_key.clone(),
                value: r.student_count as f64,
                text: r.student_count.to_string(),
                category: None,
            })
            .collect(),
        reverse_category_axis: true,
        text_position: TextPosition::Outside,
        color_by: None,
    };

    Ok(PopularityResult {
        filters: filters.clone(),
        rows,
        distinct_keys,
        chart,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseScore {
    pub module_presentation: String,
    pub total_weighted_score: f64,
    pub total_weight: f64,
    /// Set when the student's weights in this course sum to zero; the course
    /// then contributes a zero score instead of dividing by zero.
    pub zero_weight: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionDetail {
    pub assessment_id: i64,
    pub module_presentation: String,
    pub score: Option<f64>,
    pub assessment_type: String,
    pub weight: f64,
    pub normalized_weight: f64,
    pub weighted_score: f64,
    pub display_label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedScoreResult {
    pub student_id: i64,
    pub courses: Vec<CourseScore>,
    pub details: Vec<SubmissionDetail>,
    pub charts: Vec<ChartSpec>,
}

fn index_assessments(defs: &[AssessmentDef]) -> Result<HashMap<i64, &AssessmentDef>, CalcError> {
    let mut out: HashMap<i64, &AssessmentDef> = HashMap::with_capacity(defs.len());
    for d in defs {
        if out.insert(d.assessment_id, d).is_some() {
            return Err(CalcError::with_details(
                "duplicate_assessment",
                format!("assessment {} is defined more than once", d.assessment_id),
                json!({ "assessmentId": d.assessment_id }),
            ));
        }
    }
    Ok(out)
}

fn display_label(score: Option<f64>, weight: f64) -> String {
    let score_text = score.map(format_number).unwrap_or_else(|| "-".to_string());
    format!("{} (Weight: {})", score_text, format_number(weight))
}

pub fn weighted_score(ds: &Dataset, student_id: i64) -> Result<WeightedScoreResult, CalcError> {
    let defs = index_assessments(&ds.assessments)?;

    // Every submission must resolve, not only the selected student's.
    let mut joined: Vec<(usize, &AssessmentDef)> = Vec::new();
    for (row, sub) in ds.submissions.iter().enumerate() {
        let Some(def) = defs.get(&sub.assessment_id).copied() else {
            return Err(CalcError::with_details(
                "unresolved_assessment",
                format!(
                    "submission by student {} references unknown assessment {}",
                    sub.student_id, sub.assessment_id
                ),
                json!({
                    "row": row,
                    "studentId": sub.student_id,
                    "assessmentId": sub.assessment_id,
                }),
            ));
        };
        if sub.student_id == student_id {
            joined.push((row, def));
        }
    }

    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for (_, def) in &joined {
        *totals.entry(def.module_presentation()).or_insert(0.0) += def.weight;
    }

    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    let mut details: Vec<SubmissionDetail> = Vec::with_capacity(joined.len());
    for (row, def) in &joined {
        let sub = &ds.submissions[*row];
        let mp = def.module_presentation();
        let total = totals.get(&mp).copied().unwrap_or(0.0);
        let normalized_weight = if total != 0.0 { def.weight / total } else { 0.0 };
        // A missing score keeps its weight in the denominator but adds nothing.
        let weighted = sub.score.map(|s| s * normalized_weight).unwrap_or(0.0);
        *sums.entry(mp.clone()).or_insert(0.0) += weighted;
        details.push(SubmissionDetail {
            assessment_id: def.assessment_id,
            module_presentation: mp,
            score: sub.score,
            assessment_type: def.assessment_type.clone(),
            weight: def.weight,
            normalized_weight,
            weighted_score: weighted,
            display_label: display_label(sub.score, def.weight),
        });
    }

    let courses: Vec<CourseScore> = totals
        .into_iter()
        .map(|(module_presentation, total_weight)| CourseScore {
            total_weighted_score: sums.get(&module_presentation).copied().unwrap_or(0.0),
            module_presentation,
            total_weight,
            zero_weight: total_weight == 0.0,
        })
        .collect();

    let charts = vec![
        ChartSpec::Table {
            title: format!(
                "Total Weighted Scores by Course for Student ID: {}",
                student_id
            ),
            columns: vec!["module_presentation".to_string(), "weighted_score".to_string()],
            rows: courses
                .iter()
                .map(|c| vec![json!(c.module_presentation), json!(c.total_weighted_score)])
                .collect(),
        },
        ChartSpec::Bar {
            title: format!(
                "Detailed Scores and Assessment Types for Student ID: {}",
                student_id
            ),
            orientation: Orientation::Vertical,
            x: Axis::new("assessmentId", "id_assessment"),
            y: Axis::new("score", "score"),
            series: details
                .iter()
                .map(|d| BarPoint {
                    label: d.assessment_id.to_string(),
                    value: d.score.unwrap_or(0.0),
                    text: d.display_label.clone(),
                    category: Some(d.assessment_type.clone()),
                })
                .collect(),
            reverse_category_axis: false,
            text_position: TextPosition::Outside,
            color_by: Some("assessmentType".to_string()),
        },
    ];

    Ok(WeightedScoreResult {
        student_id,
        courses,
        details,
        charts,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreCategory {
    pub label: String,
    pub count: usize,
    pub percentage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentDistribution {
    pub assessment_id: i64,
    /// Scored submissions; equals the sum of the category counts.
    pub total: usize,
    pub missing_count: usize,
    pub categories: Vec<ScoreCategory>,
    pub lane: Lane,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassRateResult {
    pub module_code: String,
    pub presentation_code: String,
    pub assessments: Vec<AssessmentDistribution>,
    pub charts: Vec<ChartSpec>,
}

pub fn format_percentage(count: usize, total: usize) -> String {
    if total == 0 {
        return "0%".to_string();
    }
    format!("{:.2}%", count as f64 / total as f64 * 100.0)
}

/// Drops repeated ids, keeping the first occurrence in place.
pub fn dedupe_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

pub fn pass_rate(
    ds: &Dataset,
    module_code: &str,
    presentation_code: &str,
    assessment_ids: &[i64],
) -> Result<PassRateResult, CalcError> {
    let threshold = ds.config.pass_threshold;
    let selection = dedupe_ids(assessment_ids);

    let belongs: HashSet<i64> = ds
        .assessments
        .iter()
        .filter(|a| a.module_code == module_code && a.presentation_code == presentation_code)
        .map(|a| a.assessment_id)
        .collect();
    if let Some(bad) = selection.iter().find(|id| !belongs.contains(id)) {
        return Err(CalcError::with_details(
            "bad_params",
            format!(
                "assessment {} does not belong to {}",
                bad,
                crate::tables::presentation_key(module_code, presentation_code)
            ),
            json!({
                "assessmentId": bad,
                "moduleCode": module_code,
                "presentationCode": presentation_code,
            }),
        ));
    }

    // (above, below, missing) per selected assessment.
    let mut counts: HashMap<i64, (usize, usize, usize)> =
        selection.iter().map(|id| (*id, (0, 0, 0))).collect();
    for sub in &ds.submissions {
        let Some(entry) = counts.get_mut(&sub.assessment_id) else {
            continue;
        };
        match sub.score {
            Some(s) if s >= threshold => entry.0 += 1,
            Some(_) => entry.1 += 1,
            None => entry.2 += 1,
        }
    }

    let above_label = format!("Above or Equal to {}", format_number(threshold));
    let below_label = format!("Below {}", format_number(threshold));

    let mut assessments = Vec::with_capacity(selection.len());
    let mut charts = Vec::with_capacity(selection.len());
    for (idx, id) in selection.iter().enumerate() {
        let (above, below, missing) = counts.get(id).copied().unwrap_or_default();
        let total = above + below;
        let categories = vec![
            ScoreCategory {
                label: above_label.clone(),
                count: above,
                percentage: format_percentage(above, total),
            },
            ScoreCategory {
                label: below_label.clone(),
                count: below,
                percentage: format_percentage(below, total),
            },
        ];
        let lane = Lane::for_index(idx);
        charts.push(ChartSpec::Pie {
            title: format!("Distribution of Scores for Assessment {}", id),
            slices: categories
                .iter()
                .map(|c| PieSlice {
                    label: c.label.clone(),
                    value: c.count as f64,
                    text: c.percentage.clone(),
                })
                .collect(),
            lane,
        });
        assessments.push(AssessmentDistribution {
            assessment_id: *id,
            total,
            missing_count: missing,
            categories,
            lane,
        });
    }

    Ok(PassRateResult {
        module_code: module_code.to_string(),
        presentation_code: presentation_code.to_string(),
        assessments,
        charts,
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum PipelineRequest {
    Popularity {
        #[serde(default)]
        filters: PopularityFilters,
    },
    #[serde(rename_all = "camelCase")]
    WeightedScore { student_id: i64 },
    #[serde(rename_all = "camelCase")]
    PassRate {
        module_code: String,
        presentation_code: String,
        #[serde(default)]
        assessment_ids: Vec<i64>,
    },
}

impl PipelineRequest {
    pub fn mode(&self) -> &'static str {
        match self {
            PipelineRequest::Popularity { .. } => "popularity",
            PipelineRequest::WeightedScore { .. } => "weightedScore",
            PipelineRequest::PassRate { .. } => "passRate",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum PipelineResult {
    Popularity(PopularityResult),
    WeightedScore(WeightedScoreResult),
    PassRate(PassRateResult),
}

impl PipelineResult {
    pub fn charts(&self) -> Vec<&ChartSpec> {
        match self {
            PipelineResult::Popularity(r) => vec![&r.chart],
            PipelineResult::WeightedScore(r) => r.charts.iter().collect(),
            PipelineResult::PassRate(r) => r.charts.iter().collect(),
        }
    }
}

pub fn run(request: &PipelineRequest, ds: &Dataset) -> Result<PipelineResult, CalcError> {
    let result = match request {
        PipelineRequest::Popularity { filters } => {
            popularity(ds, filters).map(PipelineResult::Popularity)
        }
        PipelineRequest::WeightedScore { student_id } => {
            weighted_score(ds, *student_id).map(PipelineResult::WeightedScore)
        }
        PipelineRequest::PassRate {
            module_code,
            presentation_code,
            assessment_ids,
        } => pass_rate(ds, module_code, presentation_code, assessment_ids)
            .map(PipelineResult::PassRate),
    }?;
    let titles: Vec<&str> = result.charts().iter().map(|c| c.title()).collect();
    tracing::debug!(mode = request.mode(), dataset_id = %ds.id, charts = ?titles, "ran pipeline");
    Ok(result)
}
