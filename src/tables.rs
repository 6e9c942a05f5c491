use crate::calc::CalcError;
use crate::config::{self, DashboardConfig};
use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use zip::ZipArchive;

pub const STUDENT_INFO_TABLE: &str = "studentInfo";
pub const ASSESSMENTS_TABLE: &str = "assessments";
pub const STUDENT_ASSESSMENT_TABLE: &str = "studentAssessment";

const STUDENT_INFO_COLUMNS: &[&str] = &[
    "code_module",
    "code_presentation",
    "id_student",
    "gender",
    "region",
    "highest_education",
    "age_band",
    "final_result",
];
const ASSESSMENTS_COLUMNS: &[&str] = &[
    "code_module",
    "code_presentation",
    "id_assessment",
    "assessment_type",
    "weight",
];
const STUDENT_ASSESSMENT_COLUMNS: &[&str] = &["id_assessment", "id_student", "score"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalResult {
    Pass,
    Fail,
    Withdrawn,
    Distinction,
}

impl FinalResult {
    pub fn is_completed(self) -> bool {
        matches!(self, FinalResult::Pass | FinalResult::Distinction)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StudentRecord {
    #[serde(rename = "id_student")]
    pub student_id: i64,
    pub gender: String,
    pub region: String,
    pub highest_education: String,
    pub age_band: String,
    #[serde(rename = "code_module")]
    pub module_code: String,
    #[serde(rename = "code_presentation")]
    pub presentation_code: String,
    pub final_result: FinalResult,
}

impl StudentRecord {
    pub fn presentation_key(&self) -> String {
        presentation_key(&self.module_code, &self.presentation_code)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssessmentDef {
    #[serde(rename = "id_assessment")]
    pub assessment_id: i64,
    #[serde(rename = "code_module")]
    pub module_code: String,
    #[serde(rename = "code_presentation")]
    pub presentation_code: String,
    pub assessment_type: String,
    #[serde(deserialize_with = "percent")]
    pub weight: f64,
    #[serde(default, deserialize_with = "optional_number")]
    pub date: Option<f64>,
}

impl AssessmentDef {
    pub fn module_presentation(&self) -> String {
        presentation_key(&self.module_code, &self.presentation_code)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssessmentSubmission {
    #[serde(rename = "id_student")]
    pub student_id: i64,
    #[serde(rename = "id_assessment")]
    pub assessment_id: i64,
    /// `None` when the source leaves the score blank or writes `?`.
    #[serde(deserialize_with = "optional_percent")]
    pub score: Option<f64>,
}

pub fn presentation_key(module_code: &str, presentation_code: &str) -> String {
    format!("{}_{}", module_code, presentation_code)
}

fn parse_finite(t: &str) -> Result<f64, String> {
    match t.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("not a number: {:?}", t)),
    }
}

fn check_percent(v: f64) -> Result<f64, String> {
    if (0.0..=100.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("{} is outside 0..=100", v))
    }
}

fn optional_number<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    let t = raw.trim();
    if t.is_empty() || t == "?" {
        return Ok(None);
    }
    parse_finite(t).map(Some).map_err(serde::de::Error::custom)
}

/// Scores and weights are percentages.
fn optional_percent<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match optional_number(d)? {
        Some(v) => check_percent(v).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn percent<'de, D>(d: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    parse_finite(raw.trim())
        .and_then(check_percent)
        .map_err(serde::de::Error::custom)
}

/// Parses one CSV table. Header names are checked up front so a missing
/// column is reported once rather than as a failure on every row.
pub fn load_table<T, R>(table: &str, reader: R, required: &[&str]) -> Result<Vec<T>, CalcError>
where
    T: DeserializeOwned,
    R: Read,
{
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = rdr.headers().map_err(|e| {
        CalcError::new("load_failed", format!("{}: unreadable header: {}", table, e))
    })?;
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .collect();
    if !missing.is_empty() {
        return Err(CalcError::with_details(
            "load_failed",
            format!("{}: missing columns: {}", table, missing.join(", ")),
            json!({ "table": table, "missingColumns": missing }),
        ));
    }

    let mut out = Vec::new();
    for row in rdr.deserialize::<T>() {
        let rec = row.map_err(|e| {
            let line = e.position().map(|p| p.line());
            CalcError::with_details(
                "malformed_row",
                format!("{}: {}", table, e),
                json!({ "table": table, "line": line }),
            )
        })?;
        out.push(rec);
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub table: String,
    pub file_name: String,
    pub sha256: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSummary {
    pub dataset_id: String,
    pub source: String,
    pub loaded_at: String,
    pub student_rows: usize,
    pub assessment_rows: usize,
    pub submission_rows: usize,
    pub sources: Vec<SourceInfo>,
}

/// The three tables as loaded. Never mutated after construction; the
/// next `dataset.open` replaces the whole value.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: String,
    pub source: PathBuf,
    pub loaded_at: String,
    pub config: DashboardConfig,
    pub students: Vec<StudentRecord>,
    pub assessments: Vec<AssessmentDef>,
    pub submissions: Vec<AssessmentSubmission>,
    pub sources: Vec<SourceInfo>,
}

impl Dataset {
    pub fn from_tables(
        config: DashboardConfig,
        students: Vec<StudentRecord>,
        assessments: Vec<AssessmentDef>,
        submissions: Vec<AssessmentSubmission>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: PathBuf::new(),
            loaded_at: chrono::Utc::now().to_rfc3339(),
            config,
            students,
            assessments,
            submissions,
            sources: Vec::new(),
        }
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            dataset_id: self.id.clone(),
            source: self.source.to_string_lossy().to_string(),
            loaded_at: self.loaded_at.clone(),
            student_rows: self.students.len(),
            assessment_rows: self.assessments.len(),
            submission_rows: self.submissions.len(),
            sources: self.sources.clone(),
        }
    }
}

struct RawSource {
    file_name: String,
    bytes: Vec<u8>,
}

impl RawSource {
    fn info(&self, table: &str, rows: usize) -> SourceInfo {
        SourceInfo {
            table: table.to_string(),
            file_name: self.file_name.clone(),
            sha256: sha256_hex(&self.bytes),
            rows,
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    if read < 4 {
        return Ok(false);
    }
    Ok(sig == [0x50, 0x4B, 0x03, 0x04])
}

fn read_from_dir(dir: &Path, names: &[&str]) -> anyhow::Result<Vec<RawSource>> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let p = dir.join(name);
        let bytes =
            std::fs::read(&p).with_context(|| format!("failed to read {}", p.to_string_lossy()))?;
        out.push(RawSource {
            file_name: name.to_string(),
            bytes,
        });
    }
    Ok(out)
}

fn read_from_zip(path: &Path, names: &[&str]) -> anyhow::Result<Vec<RawSource>> {
    let f = File::open(path)
        .with_context(|| format!("failed to open archive {}", path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(f).context("invalid zip archive")?;

    let mut found: Vec<Option<RawSource>> = names.iter().map(|_| None).collect();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("failed to read archive entry")?;
        if entry.is_dir() {
            continue;
        }
        // Archives often nest the tables under a top-level folder.
        let base = entry
            .name()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let Some(slot) = names.iter().position(|n| *n == base) else {
            continue;
        };
        if found[slot].is_some() {
            continue;
        }
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to extract {}", entry.name()))?;
        found[slot] = Some(RawSource {
            file_name: entry.name().to_string(),
            bytes,
        });
    }

    names
        .iter()
        .zip(found)
        .map(|(name, src)| src.ok_or_else(|| anyhow!("archive is missing {}", name)))
        .collect()
}

fn read_sources(path: &Path, cfg: &DashboardConfig) -> anyhow::Result<Vec<RawSource>> {
    let names = [
        cfg.files.student_info.as_str(),
        cfg.files.assessments.as_str(),
        cfg.files.student_assessment.as_str(),
    ];
    if path.is_dir() {
        return read_from_dir(path, &names);
    }
    if !path.exists() {
        return Err(anyhow!("dataset source not found: {}", path.to_string_lossy()));
    }
    if is_zip_file(path)? {
        return read_from_zip(path, &names);
    }
    Err(anyhow!(
        "dataset source must be a directory or a zip archive: {}",
        path.to_string_lossy()
    ))
}

fn load_failed(e: anyhow::Error) -> CalcError {
    CalcError::new("load_failed", format!("{e:#}"))
}

/// Loads a dataset from a directory of CSV files or a zip archive holding them.
pub fn open_dataset(path: &Path) -> Result<Dataset, CalcError> {
    let cfg = config::load_for_source(path).map_err(load_failed)?;
    let raw = read_sources(path, &cfg).map_err(load_failed)?;
    let [student_src, assessment_src, submission_src]: [RawSource; 3] = raw
        .try_into()
        .map_err(|_| CalcError::new("load_failed", "expected three source tables"))?;

    let students: Vec<StudentRecord> = load_table(
        STUDENT_INFO_TABLE,
        student_src.bytes.as_slice(),
        STUDENT_INFO_COLUMNS,
    )?;
    let assessments: Vec<AssessmentDef> = load_table(
        ASSESSMENTS_TABLE,
        assessment_src.bytes.as_slice(),
        ASSESSMENTS_COLUMNS,
    )?;
    let submissions: Vec<AssessmentSubmission> = load_table(
        STUDENT_ASSESSMENT_TABLE,
        submission_src.bytes.as_slice(),
        STUDENT_ASSESSMENT_COLUMNS,
    )?;

    let sources = vec![
        student_src.info(STUDENT_INFO_TABLE, students.len()),
        assessment_src.info(ASSESSMENTS_TABLE, assessments.len()),
        submission_src.info(STUDENT_ASSESSMENT_TABLE, submissions.len()),
    ];

    let mut ds = Dataset::from_tables(cfg, students, assessments, submissions);
    ds.source = path.to_path_buf();
    ds.sources = sources;
    tracing::info!(
        dataset_id = %ds.id,
        source = %path.to_string_lossy(),
        students = ds.students.len(),
        assessments = ds.assessments.len(),
        submissions = ds.submissions.len(),
        "dataset loaded"
    );
    Ok(ds)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUDENT_INFO: &str = "\
code_module,code_presentation,id_student,gender,region,highest_education,imd_band,age_band,num_of_prev_attempts,studied_credits,disability,final_result
AAA,2013J,11391,M,East Anglian Region,HE Qualification,90-100%,55<=,0,240,N,Pass
AAA,2013J,28400,F,Scotland,HE Qualification,20-30%,35-55,0,60,N,Withdrawn
";

    #[test]
    fn student_info_ignores_extra_columns() {
        let rows: Vec<StudentRecord> =
            load_table(STUDENT_INFO_TABLE, STUDENT_INFO.as_bytes(), STUDENT_INFO_COLUMNS)
                .expect("load students");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].student_id, 11391);
        assert_eq!(rows[0].final_result, FinalResult::Pass);
        assert_eq!(rows[1].final_result, FinalResult::Withdrawn);
        assert_eq!(rows[0].presentation_key(), "AAA_2013J");
    }

    #[test]
    fn unknown_final_result_is_malformed() {
        let text = "\
code_module,code_presentation,id_student,gender,region,highest_education,age_band,final_result
AAA,2013J,1,M,Wales,None,0-35,Maybe
";
        let e = load_table::<StudentRecord, _>(
            STUDENT_INFO_TABLE,
            text.as_bytes(),
            STUDENT_INFO_COLUMNS,
        )
        .unwrap_err();
        assert_eq!(e.code, "malformed_row");
        assert_eq!(e.details.as_ref().and_then(|d| d.get("line")), Some(&json!(2)));
    }

    #[test]
    fn missing_column_reported_once() {
        let text = "id_assessment,id_student\n1,2\n";
        let e = load_table::<AssessmentSubmission, _>(
            STUDENT_ASSESSMENT_TABLE,
            text.as_bytes(),
            STUDENT_ASSESSMENT_COLUMNS,
        )
        .unwrap_err();
        assert_eq!(e.code, "load_failed");
        assert!(e.message.contains("score"), "{}", e.message);
    }

    #[test]
    fn blank_and_question_mark_scores_are_missing() {
        let text = "\
id_assessment,id_student,date_submitted,is_banked,score
1752,11391,18,0,78
1752,28400,22,0,
1753,28400,22,0,?
";
        let rows: Vec<AssessmentSubmission> = load_table(
            STUDENT_ASSESSMENT_TABLE,
            text.as_bytes(),
            STUDENT_ASSESSMENT_COLUMNS,
        )
        .expect("load submissions");
        assert_eq!(rows[0].score, Some(78.0));
        assert_eq!(rows[1].score, None);
        assert_eq!(rows[2].score, None);
    }

    #[test]
    fn garbage_score_is_not_treated_as_missing() {
        let text = "id_assessment,id_student,score\n1752,11391,abc\n";
        let e = load_table::<AssessmentSubmission, _>(
            STUDENT_ASSESSMENT_TABLE,
            text.as_bytes(),
            STUDENT_ASSESSMENT_COLUMNS,
        )
        .unwrap_err();
        assert_eq!(e.code, "malformed_row");
    }

    #[test]
    fn non_finite_and_out_of_range_scores_are_malformed() {
        for bad in ["NaN", "inf", "-40", "100.5"] {
            let text = format!("id_assessment,id_student,score\n20,1,{}\n", bad);
            let e = load_table::<AssessmentSubmission, _>(
                STUDENT_ASSESSMENT_TABLE,
                text.as_bytes(),
                STUDENT_ASSESSMENT_COLUMNS,
            )
            .unwrap_err();
            assert_eq!(e.code, "malformed_row", "score {}", bad);
        }

        let edges = "id_assessment,id_student,score\n20,1,0\n20,2,100\n";
        let rows: Vec<AssessmentSubmission> = load_table(
            STUDENT_ASSESSMENT_TABLE,
            edges.as_bytes(),
            STUDENT_ASSESSMENT_COLUMNS,
        )
        .expect("bounds are inclusive");
        assert_eq!(rows[0].score, Some(0.0));
        assert_eq!(rows[1].score, Some(100.0));
    }

    #[test]
    fn weight_outside_percent_range_is_malformed() {
        for bad in ["NaN", "-inf", "-5", "150", ""] {
            let text = format!(
                "code_module,code_presentation,id_assessment,assessment_type,date,weight\nAAA,2013J,1,TMA,19,{}\n",
                bad
            );
            let e = load_table::<AssessmentDef, _>(
                ASSESSMENTS_TABLE,
                text.as_bytes(),
                ASSESSMENTS_COLUMNS,
            )
            .unwrap_err();
            assert_eq!(e.code, "malformed_row", "weight {:?}", bad);
        }
    }

    #[test]
    fn assessment_date_is_optional() {
        let text = "\
code_module,code_presentation,id_assessment,assessment_type,date,weight
AAA,2013J,1752,TMA,19,10
AAA,2013J,1757,Exam,,100
";
        let rows: Vec<AssessmentDef> =
            load_table(ASSESSMENTS_TABLE, text.as_bytes(), ASSESSMENTS_COLUMNS)
                .expect("load assessments");
        assert_eq!(rows[0].date, Some(19.0));
        assert_eq!(rows[1].date, None);
        assert_eq!(rows[1].weight, 100.0);
        assert_eq!(rows[1].module_presentation(), "AAA_2013J");
    }

    #[test]
    fn sha256_hex_is_lowercase_and_full_length() {
        let h = sha256_hex(b"abc");
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
