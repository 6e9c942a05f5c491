//! Chart descriptions handed to the renderer. The sidecar never draws;
//! it only says what to draw.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[serde(rename = "h")]
    Horizontal,
    #[serde(rename = "v")]
    Vertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TextPosition {
    Inside,
    Outside,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lane {
    A,
    B,
}

impl Lane {
    /// Alternates lanes by selection index: even → A, odd → B.
    pub fn for_index(idx: usize) -> Self {
        if idx % 2 == 0 {
            Lane::A
        } else {
            Lane::B
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Axis {
    pub field: String,
    pub label: String,
}

impl Axis {
    pub fn new(field: &str, label: &str) -> Self {
        Self {
            field: field.to_string(),
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BarPoint {
    pub label: String,
    pub value: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PieSlice {
    pub label: String,
    pub value: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChartSpec {
    #[serde(rename_all = "camelCase")]
    Bar {
        title: String,
        orientation: Orientation,
        x: Axis,
        y: Axis,
        series: Vec<BarPoint>,
        /// Category axis drawn top-down so the first point sits on top.
        reverse_category_axis: bool,
        text_position: TextPosition,
        #[serde(skip_serializing_if = "Option::is_none")]
        color_by: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Pie {
        title: String,
        slices: Vec<PieSlice>,
        lane: Lane,
    },
    #[serde(rename_all = "camelCase")]
    Table {
        title: String,
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
}

impl ChartSpec {
    pub fn title(&self) -> &str {
        match self {
            ChartSpec::Bar { title, .. }
            | ChartSpec::Pie { title, .. }
            | ChartSpec::Table { title, .. } => title,
        }
    }
}
