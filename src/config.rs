use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "dashboard.json";
pub const DATA_ENV: &str = "COURSEDASHD_DATA";
pub const LOG_ENV: &str = "COURSEDASHD_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceFiles {
    pub student_info: String,
    pub assessments: String,
    pub student_assessment: String,
}

impl Default for SourceFiles {
    fn default() -> Self {
        Self {
            student_info: "studentInfo.csv".to_string(),
            assessments: "assessments.csv".to_string(),
            student_assessment: "studentAssessment.csv".to_string(),
        }
    }
}

/// Tunables shared by the three pipelines and the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DashboardConfig {
    pub top_n: usize,
    pub pass_threshold: f64,
    pub files: SourceFiles,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            top_n: 5,
            pass_threshold: 60.0,
            files: SourceFiles::default(),
        }
    }
}

/// Reads `dashboard.json` next to the data files when present.
/// Archives and directories without the file get the defaults.
pub fn load_for_source(source: &Path) -> anyhow::Result<DashboardConfig> {
    if !source.is_dir() {
        return Ok(DashboardConfig::default());
    }
    let p = source.join(CONFIG_FILE_NAME);
    if !p.is_file() {
        return Ok(DashboardConfig::default());
    }
    let text = std::fs::read_to_string(&p)
        .with_context(|| format!("failed to read {}", p.to_string_lossy()))?;
    let cfg: DashboardConfig = serde_json::from_str(&text)
        .with_context(|| format!("{} is invalid JSON", p.to_string_lossy()))?;
    if cfg.top_n == 0 {
        anyhow::bail!("{}: topN must be at least 1", CONFIG_FILE_NAME);
    }
    tracing::debug!(path = %p.to_string_lossy(), "loaded dashboard config");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults_for_missing_keys() {
        let cfg: DashboardConfig =
            serde_json::from_str(r#"{ "passThreshold": 50 }"#).expect("parse config");
        assert_eq!(cfg.pass_threshold, 50.0);
        assert_eq!(cfg.top_n, 5);
        assert_eq!(cfg.files.assessments, "assessments.csv");
    }

    #[test]
    fn missing_source_uses_defaults() {
        let cfg = load_for_source(Path::new("/definitely/not/here.zip")).expect("defaults");
        assert_eq!(cfg, DashboardConfig::default());
    }
}
