use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabled::{Table, Tabled};

use crate::dimension::Dimension;
use crate::trace::Trace;

/// Letter grade for an overall score.
///
/// Variants are ordered best first, so `Grade::S < Grade::D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
	S,
	A,
	B,
	C,
	D,
}

impl Grade {
	pub const ALL: [Grade; 5] = [Grade::S, Grade::A, Grade::B, Grade::C, Grade::D];

	pub fn from_score(score: f64) -> Self {
		if score >= 90.0 {
			Grade::S
		} else if score >= 80.0 {
			Grade::A
		} else if score >= 70.0 {
			Grade::B
		} else if score >= 60.0 {
			Grade::C
		} else {
			Grade::D
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Grade::S => "S",
			Grade::A => "A",
			Grade::B => "B",
			Grade::C => "C",
			Grade::D => "D",
		}
	}
}

impl fmt::Display for Grade {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown grade '{0}' (expected S, A, B, C or D)")]
pub struct UnknownGrade(pub String);

impl FromStr for Grade {
	type Err = UnknownGrade;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let letter = s.trim().to_ascii_uppercase();
		Grade::ALL
			.into_iter()
			.find(|g| g.as_str() == letter)
			.ok_or_else(|| UnknownGrade(s.to_string()))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubScore {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub score: f64,
	pub max_score: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub comment: Option<String>,
}

/// Parsed model verdict for one dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionResult {
	pub dimension: Dimension,
	pub dimension_name: String,
	pub score: f64,
	pub max_score: f64,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub sub_scores: BTreeMap<String, SubScore>,
	#[serde(default)]
	pub strengths: Vec<String>,
	#[serde(default)]
	pub weaknesses: Vec<String>,
	#[serde(default)]
	pub suggestions: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub commentary: Option<String>,
	/// Dimension-specific sections the model returned (notable lines, twists, ...)
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub extra: Map<String, Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub raw_response: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub traces: Vec<Trace>,
}

impl DimensionResult {
	pub fn new(dimension: Dimension, score: f64, max_score: f64) -> Self {
		Self {
			dimension,
			dimension_name: dimension.name().to_string(),
			score,
			max_score,
			sub_scores: BTreeMap::new(),
			strengths: Vec::new(),
			weaknesses: Vec::new(),
			suggestions: Vec::new(),
			commentary: None,
			extra: Map::new(),
			raw_response: None,
			error: None,
			traces: Vec::new(),
		}
	}

	/// A dimension that could not be scored. Counts as 0 and is left out of the
	/// weighted overall score.
	pub fn failed(dimension: Dimension, error: impl Into<String>) -> Self {
		Self {
			error: Some(error.into()),
			..Self::new(dimension, 0.0, 100.0)
		}
	}

	pub fn is_failed(&self) -> bool {
		self.error.is_some()
	}

	/// Score rescaled to 0..=100.
	pub fn percent(&self) -> f64 {
		if self.max_score <= 0.0 {
			0.0
		} else {
			self.score / self.max_score * 100.0
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedScore {
	pub dimension: Dimension,
	pub dimension_name: String,
	pub score: f64,
	pub max_score: f64,
	pub weight: f64,
	pub weighted_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallScore {
	pub total_score: f64,
	pub max_score: f64,
	pub grade: Grade,
	pub details: Vec<WeightedScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
	pub script_name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub script_path: Option<PathBuf>,
	pub evaluated_at: DateTime<Utc>,
	/// Characters in the source script before truncation
	pub script_chars: usize,
	#[serde(default)]
	pub truncated: bool,
	pub dimensions: BTreeMap<Dimension, DimensionResult>,
	pub overall: OverallScore,
}

#[derive(Debug, Clone, Tabled)]
struct SummaryRow {
	dimension: String,
	score: String,
	weight: String,
	weighted: String,
	status: String,
}

impl EvaluationResult {
	pub fn failed_dimensions(&self) -> impl Iterator<Item = &DimensionResult> {
		self.dimensions.values().filter(|d| d.is_failed())
	}

	pub fn summary_table(&self) -> String {
		let rows: Vec<SummaryRow> = self
			.dimensions
			.values()
			.map(|d| {
				let weighted = self
					.overall
					.details
					.iter()
					.find(|w| w.dimension == d.dimension)
					.map(|w| format!("{:.2}", w.weighted_score))
					.unwrap_or_else(|| "-".to_string());
				let status = match &d.error {
					Some(err) => format!("failed: {}", truncate(err, 48)),
					None => "ok".to_string(),
				};
				SummaryRow {
					dimension: d.dimension_name.clone(),
					score: format!("{}/{}", fmt_number(d.score), fmt_number(d.max_score)),
					weight: format!("{:.0}%", d.dimension.weight() * 100.0),
					weighted,
					status,
				}
			})
			.collect();

		let table = Table::new(rows).to_string();
		let summary_text = format!(
			"{}  Overall: {:.2}/{}  Grade: {}",
			self.script_name,
			self.overall.total_score,
			fmt_number(self.overall.max_score),
			self.overall.grade
		);

		format!("{}\n\n{}\n", table, summary_text)
	}
}

/// Formats whole numbers without a trailing `.0`.
pub fn fmt_number(v: f64) -> String {
	if v.fract() == 0.0 && v.abs() < 1e15 {
		format!("{}", v as i64)
	} else {
		format!("{:.2}", v)
	}
}

fn truncate(s: &str, max_len: usize) -> String {
	if s.chars().count() <= max_len {
		return s.to_string();
	}
	let mut truncated = s.chars().take(max_len.saturating_sub(1)).collect::<String>();
	truncated.push('…');
	truncated
}
