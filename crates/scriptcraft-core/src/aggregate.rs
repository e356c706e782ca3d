use std::collections::BTreeMap;

use scriptcraft_types::{Dimension, DimensionResult, EvaluationResult, Grade, OverallScore, WeightedScore};
use serde::{Deserialize, Serialize};

/// Weighted mean of the successfully scored dimensions, on a 0..=100 scale.
///
/// Each dimension contributes `score / max * weight * 100`; the sum is divided
/// by the total weight of the contributing dimensions, so a failed dimension
/// does not drag the score down. No successful dimension gives 0. The grade is
/// taken from the mean before it is rounded to two decimals.
pub fn compute_overall(dimensions: &BTreeMap<Dimension, DimensionResult>) -> OverallScore {
	let mut weighted_sum = 0.0f64;
	let mut weight_sum = 0.0f64;
	let mut details = Vec::new();

	for result in dimensions.values().filter(|r| !r.is_failed()) {
		let weight = result.dimension.weight();
		let weighted_score = result.percent() * weight;
		weighted_sum += weighted_score;
		weight_sum += weight;
		details.push(WeightedScore {
			dimension: result.dimension,
			dimension_name: result.dimension_name.clone(),
			score: result.score,
			max_score: result.max_score,
			weight,
			weighted_score,
		});
	}

	let total = if weight_sum > 0.0 { weighted_sum / weight_sum } else { 0.0 };

	OverallScore {
		total_score: round2(total),
		max_score: 100.0,
		grade: Grade::from_score(total),
		details,
	}
}

pub fn round2(v: f64) -> f64 {
	(v * 100.0).round() / 100.0
}

/// Results ordered best first. Ties keep their input order.
pub fn rank(results: &[EvaluationResult]) -> Vec<&EvaluationResult> {
	let mut ranked: Vec<&EvaluationResult> = results.iter().collect();
	ranked.sort_by(|a, b| b.overall.total_score.total_cmp(&a.overall.total_score));
	ranked
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatistics {
	pub count: usize,
	pub average: f64,
	pub max: f64,
	pub best_script: Option<String>,
	pub min: f64,
	pub grade_distribution: BTreeMap<Grade, usize>,
}

impl BatchStatistics {
	pub fn from_results(results: &[EvaluationResult]) -> Self {
		let mut grade_distribution: BTreeMap<Grade, usize> = Grade::ALL.iter().map(|g| (*g, 0)).collect();
		for r in results {
			*grade_distribution.entry(r.overall.grade).or_default() += 1;
		}

		let ranked = rank(results);
		let scores: Vec<f64> = results.iter().map(|r| r.overall.total_score).collect();
		let count = scores.len();
		let average = if count == 0 { 0.0 } else { round2(scores.iter().sum::<f64>() / count as f64) };

		Self {
			count,
			average,
			max: ranked.first().map(|r| r.overall.total_score).unwrap_or(0.0),
			best_script: ranked.first().map(|r| r.script_name.clone()),
			min: ranked.last().map(|r| r.overall.total_score).unwrap_or(0.0),
			grade_distribution,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;

	fn dims(entries: &[(Dimension, Option<f64>)]) -> BTreeMap<Dimension, DimensionResult> {
		entries
			.iter()
			.map(|(d, score)| {
				let r = match score {
					Some(s) => DimensionResult::new(*d, *s, 100.0),
					None => DimensionResult::failed(*d, "API timeout"),
				};
				(*d, r)
			})
			.collect()
	}

	fn result(name: &str, total: f64) -> EvaluationResult {
		EvaluationResult {
			script_name: name.to_string(),
			script_path: None,
			evaluated_at: Utc::now(),
			script_chars: 10,
			truncated: false,
			dimensions: BTreeMap::new(),
			overall: OverallScore {
				total_score: total,
				max_score: 100.0,
				grade: Grade::from_score(total),
				details: Vec::new(),
			},
		}
	}

	#[test]
	fn weighted_mean_over_all_dimensions() {
		let overall = compute_overall(&dims(&[
			(Dimension::Structure, Some(80.0)),
			(Dimension::Characters, Some(90.0)),
			(Dimension::Dialogue, Some(70.0)),
			(Dimension::DramaTraits, Some(60.0)),
			(Dimension::Commercial, Some(100.0)),
		]));
		// 20 + 22.5 + 14 + 9 + 15
		assert_eq!(overall.total_score, 80.5);
		assert_eq!(overall.grade, Grade::A);
		assert_eq!(overall.details.len(), 5);
	}

	#[test]
	fn failed_dimensions_are_excluded_and_weights_renormalised() {
		let overall = compute_overall(&dims(&[
			(Dimension::Structure, Some(80.0)),
			(Dimension::Dialogue, Some(60.0)),
			(Dimension::Commercial, None),
		]));
		// (20 + 12) / 0.45
		assert_eq!(overall.total_score, 71.11);
		assert_eq!(overall.grade, Grade::B);
		assert!(overall.details.iter().all(|d| d.dimension != Dimension::Commercial));
	}

	#[test]
	fn respects_non_hundred_max_scores() {
		let mut map = BTreeMap::new();
		map.insert(Dimension::Structure, DimensionResult::new(Dimension::Structure, 9.0, 10.0));
		let overall = compute_overall(&map);
		assert_eq!(overall.total_score, 90.0);
		assert_eq!(overall.grade, Grade::S);
	}

	#[test]
	fn nothing_scored_is_zero() {
		let overall = compute_overall(&dims(&[(Dimension::Structure, None)]));
		assert_eq!(overall.total_score, 0.0);
		assert_eq!(overall.grade, Grade::D);
		assert!(overall.details.is_empty());
	}

	#[test]
	fn grade_uses_unrounded_mean() {
		let overall = compute_overall(&dims(&[(Dimension::Structure, Some(89.996))]));
		assert_eq!(overall.total_score, 90.0);
		assert_eq!(overall.grade, Grade::A);

		let overall = compute_overall(&dims(&[(Dimension::Structure, Some(90.0))]));
		assert_eq!(overall.grade, Grade::S);
	}

	#[test]
	fn rank_and_statistics() {
		let results = vec![result("a", 72.0), result("b", 91.5), result("c", 55.0), result("d", 72.0)];
		let ranked: Vec<&str> = rank(&results).iter().map(|r| r.script_name.as_str()).collect();
		assert_eq!(ranked, vec!["b", "a", "d", "c"]);

		let stats = BatchStatistics::from_results(&results);
		assert_eq!(stats.count, 4);
		assert_eq!(stats.average, 72.63);
		assert_eq!(stats.max, 91.5);
		assert_eq!(stats.best_script.as_deref(), Some("b"));
		assert_eq!(stats.min, 55.0);
		assert_eq!(stats.grade_distribution[&Grade::B], 2);
		assert_eq!(stats.grade_distribution[&Grade::A], 0);
		assert_eq!(stats.grade_distribution[&Grade::S], 1);
	}
}
