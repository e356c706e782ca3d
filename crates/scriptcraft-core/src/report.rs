use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use scriptcraft_types::{fmt_number, DimensionResult, EvaluationResult, Grade};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::aggregate::{rank, BatchStatistics};

pub const GENERATOR: &str = concat!("scriptcraft v", env!("CARGO_PKG_VERSION"));

const HIGHLIGHT_LIMIT: usize = 5;
const LEADERBOARD_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Markdown,
    Json,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Markdown => "md",
            ReportFormat::Json => "json",
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportFormat::Markdown => f.write_str("markdown"),
            ReportFormat::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown report format '{0}' (expected markdown or json)")]
pub struct UnknownFormat(pub String);

impl FromStr for ReportFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            "json" => Ok(ReportFormat::Json),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub generator: String,
    pub script_name: String,
}

/// On-disk shape of a JSON report: the result itself plus a `metadata` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    #[serde(flatten)]
    pub result: EvaluationResult,
    pub metadata: ReportMetadata,
}

pub fn render_json(result: &EvaluationResult) -> Result<String> {
    let report = JsonReport {
        result: result.clone(),
        metadata: ReportMetadata {
            generated_at: Utc::now(),
            generator: GENERATOR.to_string(),
            script_name: result.script_name.clone(),
        },
    };
    serde_json::to_string_pretty(&report).context("failed to serialize JSON report")
}

pub fn render_markdown(result: &EvaluationResult) -> String {
    let mut md = String::new();
    let generated = Local::now().format("%Y-%m-%d %H:%M:%S");

    let _ = writeln!(md, "# Script Evaluation Report: {}\n", result.script_name);
    let _ = writeln!(md, "- **Generated**: {}", generated);
    let _ = writeln!(
        md,
        "- **Evaluated**: {}",
        result.evaluated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(md, "- **Script length**: {} characters", result.script_chars);
    if result.truncated {
        md.push_str("- **Note**: the script was truncated before evaluation\n");
    }
    md.push('\n');

    md.push_str("## Overall\n\n");
    let _ = writeln!(
        md,
        "**Total score: {:.2} / {}**  Grade: **{}** ({})\n",
        result.overall.total_score,
        fmt_number(result.overall.max_score),
        result.overall.grade,
        grade_label(result.overall.grade)
    );

    md.push_str("| Dimension | Score | Max | Weight | Weighted |\n");
    md.push_str("|---|---|---|---|---|\n");
    for d in &result.overall.details {
        let _ = writeln!(
            md,
            "| {} | {} | {} | {:.0}% | {:.2} |",
            cell(&d.dimension_name),
            fmt_number(d.score),
            fmt_number(d.max_score),
            d.weight * 100.0,
            d.weighted_score
        );
    }
    for d in result.failed_dimensions() {
        let _ = writeln!(
            md,
            "| {} | failed | - | {:.0}% | - |",
            cell(&d.dimension_name),
            d.dimension.weight() * 100.0
        );
    }
    md.push('\n');

    md.push_str("## Dimension details\n\n");
    for d in result.dimensions.values() {
        render_dimension(&mut md, d);
    }

    let strengths = first_unique(result.dimensions.values().flat_map(|d| d.strengths.iter()));
    if !strengths.is_empty() {
        md.push_str("## Key strengths\n\n");
        for s in strengths {
            let _ = writeln!(md, "- {}", s);
        }
        md.push('\n');
    }

    let improvements = first_unique(result.dimensions.values().flat_map(|d| d.suggestions.iter()));
    if !improvements.is_empty() {
        md.push_str("## Priority improvements\n\n");
        for (i, s) in improvements.iter().enumerate() {
            let _ = writeln!(md, "{}. {}", i + 1, s);
        }
        md.push('\n');
    }

    let _ = writeln!(md, "---\n*Generated by {}*", GENERATOR);
    md
}

fn render_dimension(md: &mut String, d: &DimensionResult) {
    let _ = writeln!(md, "### {}\n", d.dimension_name);

    if let Some(err) = &d.error {
        let _ = writeln!(md, "**Evaluation failed**: {}\n", err);
        return;
    }

    let _ = writeln!(md, "**Score: {} / {}**\n", fmt_number(d.score), fmt_number(d.max_score));

    if !d.sub_scores.is_empty() {
        md.push_str("| Item | Score | Comment |\n|---|---|---|\n");
        for (key, sub) in &d.sub_scores {
            let _ = writeln!(
                md,
                "| {} | {}/{} | {} |",
                cell(sub.name.as_deref().unwrap_or(key)),
                fmt_number(sub.score),
                fmt_number(sub.max_score),
                cell(sub.comment.as_deref().unwrap_or(""))
            );
        }
        md.push('\n');
    }

    bullet_section(md, "Strengths", &d.strengths);
    bullet_section(md, "Weaknesses", &d.weaknesses);

    if !d.suggestions.is_empty() {
        md.push_str("**Suggestions**\n\n");
        for (i, s) in d.suggestions.iter().enumerate() {
            let _ = writeln!(md, "{}. {}", i + 1, s);
        }
        md.push('\n');
    }

    render_extras(md, d);

    if let Some(commentary) = &d.commentary {
        let _ = writeln!(md, "> {}\n", commentary);
    }
}

fn bullet_section(md: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(md, "**{}**\n", title);
    for item in items {
        let _ = writeln!(md, "- {}", item);
    }
    md.push('\n');
}

fn render_extras(md: &mut String, d: &DimensionResult) {
    if let Some(Value::Array(lines)) = d.extra.get("notable_lines") {
        md.push_str("**Notable lines**\n\n");
        for line in lines {
            let _ = writeln!(
                md,
                "- **{}**: \"{}\" ({})",
                field(line, "speaker"),
                field(line, "line"),
                field(line, "reason")
            );
        }
        md.push('\n');
    }

    if let Some(Value::Array(characters)) = d.extra.get("character_analysis") {
        md.push_str("**Character analysis**\n\n| Character | Role | Score | Analysis |\n|---|---|---|---|\n");
        for c in characters {
            let _ = writeln!(
                md,
                "| {} | {} | {}/{} | {} |",
                cell(&field(c, "character")),
                cell(&field(c, "role")),
                cell(&field(c, "score")),
                cell(&field(c, "max_score")),
                cell(&field(c, "analysis"))
            );
        }
        md.push('\n');
    }

    if let Some(Value::Array(twists)) = d.extra.get("twists_identified") {
        md.push_str("**Twists**\n\n");
        for t in twists {
            let _ = writeln!(
                md,
                "- [{}] {} (effectiveness {}/{})",
                field(t, "position"),
                field(t, "description"),
                field(t, "effectiveness_score"),
                field(t, "max_score")
            );
        }
        md.push('\n');
    }

    if let Some(audience @ Value::Object(_)) = d.extra.get("target_audience") {
        md.push_str("**Target audience**\n\n");
        for (label, key) in [
            ("Primary", "primary"),
            ("Age range", "age_range"),
            ("Gender preference", "gender_preference"),
            ("Interests", "interest_tags"),
        ] {
            let value = field(audience, key);
            if !value.is_empty() {
                let _ = writeln!(md, "- {}: {}", label, value);
            }
        }
        md.push('\n');
    }
}

fn field(value: &Value, key: &str) -> String {
    value.get(key).map(value_text).unwrap_or_default()
}

/// Keeps free text inside one Markdown table cell.
fn cell(text: &str) -> String {
    text.replace("\r\n", " ")
        .replace(['\n', '\r'], " ")
        .replace('|', "\\|")
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.as_f64().map(fmt_number).unwrap_or_else(|| n.to_string()),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn first_unique<'a>(items: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::new();
    for item in items {
        let item = item.trim();
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
            if out.len() == HIGHLIGHT_LIMIT {
                break;
            }
        }
    }
    out
}

fn grade_label(grade: Grade) -> &'static str {
    match grade {
        Grade::S => "outstanding",
        Grade::A => "strong",
        Grade::B => "solid",
        Grade::C => "passable",
        Grade::D => "needs work",
    }
}

pub fn render_batch_summary(results: &[EvaluationResult]) -> String {
    let mut md = String::new();
    let stats = BatchStatistics::from_results(results);

    md.push_str("# Batch Evaluation Summary\n\n");
    let _ = writeln!(md, "- **Generated**: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(md, "- **Scripts evaluated**: {}\n", stats.count);

    md.push_str("## Leaderboard\n\n| Rank | Script | Score | Grade |\n|---|---|---|---|\n");
    for (i, r) in rank(results).iter().enumerate() {
        let _ = writeln!(
            md,
            "| {} | {} | {:.2} | {} |",
            i + 1,
            cell(&r.script_name),
            r.overall.total_score,
            r.overall.grade
        );
    }
    md.push('\n');

    md.push_str("## Statistics\n\n");
    let _ = writeln!(md, "- Average: {:.2}", stats.average);
    let _ = writeln!(
        md,
        "- Highest: {:.2} ({})",
        stats.max,
        stats.best_script.as_deref().unwrap_or("-")
    );
    let _ = writeln!(md, "- Lowest: {:.2}\n", stats.min);

    md.push_str("## Grade distribution\n\n| Grade | Count | Share | |\n|---|---|---|---|\n");
    for (grade, count) in &stats.grade_distribution {
        let share = if stats.count == 0 {
            0.0
        } else {
            *count as f64 / stats.count as f64 * 100.0
        };
        let _ = writeln!(
            md,
            "| {} | {} | {:.1}% | {} |",
            grade,
            count,
            share,
            "█".repeat(*count)
        );
    }
    md.push('\n');

    let _ = writeln!(md, "---\n*Generated by {}*", GENERATOR);
    md
}

/// Top of the leaderboard, one line per script, best first.
pub fn leaderboard_lines(results: &[EvaluationResult]) -> Vec<String> {
    rank(results)
        .into_iter()
        .take(LEADERBOARD_LIMIT)
        .enumerate()
        .map(|(i, r)| {
            format!(
                "{:>2}. {:<32} {:>6.2}  {}",
                i + 1,
                r.script_name,
                r.overall.total_score,
                r.overall.grade
            )
        })
        .collect()
}

/// Anything other than letters, digits, `-` and `_` becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "script".to_string()
    } else {
        cleaned
    }
}

/// Writes report files into one output directory.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, result: &EvaluationResult, formats: &[ReportFormat]) -> Result<Vec<PathBuf>> {
        let stamp = result.evaluated_at.with_timezone(&Local).format("%Y%m%d_%H%M%S");
        let stem = format!("{}_{}", sanitize_file_name(&result.script_name), stamp);

        let mut written = Vec::new();
        for format in formats {
            let body = match format {
                ReportFormat::Markdown => render_markdown(result),
                ReportFormat::Json => render_json(result)?,
            };
            let path = self.dir.join(format!("{}.{}", stem, format.extension()));
            std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), format = %format, "report written");
            written.push(path);
        }
        Ok(written)
    }

    pub fn write_batch_summary(&self, results: &[EvaluationResult]) -> Result<PathBuf> {
        let path = self
            .dir
            .join(format!("batch_summary_{}.md", Local::now().format("%Y%m%d_%H%M%S")));
        std::fs::write(&path, render_batch_summary(results))
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), scripts = results.len(), "batch summary written");
        Ok(path)
    }
}
