use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One axis of the script rubric.
///
/// The set is fixed; the declaration order is the canonical evaluation and
/// report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
	Structure,
	Characters,
	Dialogue,
	DramaTraits,
	Commercial,
}

impl Dimension {
	pub const ALL: [Dimension; 5] = [
		Dimension::Structure,
		Dimension::Characters,
		Dimension::Dialogue,
		Dimension::DramaTraits,
		Dimension::Commercial,
	];

	pub fn key(self) -> &'static str {
		match self {
			Dimension::Structure => "structure",
			Dimension::Characters => "characters",
			Dimension::Dialogue => "dialogue",
			Dimension::DramaTraits => "drama_traits",
			Dimension::Commercial => "commercial",
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			Dimension::Structure => "Plot structure",
			Dimension::Characters => "Characterisation",
			Dimension::Dialogue => "Dialogue",
			Dimension::DramaTraits => "Short-drama traits",
			Dimension::Commercial => "Commercial potential",
		}
	}

	/// Share of the overall score. All weights sum to 1.0.
	pub fn weight(self) -> f64 {
		match self {
			Dimension::Structure => 0.25,
			Dimension::Characters => 0.25,
			Dimension::Dialogue => 0.20,
			Dimension::DramaTraits => 0.15,
			Dimension::Commercial => 0.15,
		}
	}

	pub fn description(self) -> &'static str {
		match self {
			Dimension::Structure => "Opening hook, pacing, conflict escalation, climax and ending",
			Dimension::Characters => "Protagonist appeal, character arcs, motivation and relationships",
			Dimension::Dialogue => "Naturalness, subtext, memorable lines and character voice",
			Dimension::DramaTraits => "Twists per episode, cliffhangers, emotional payoffs and rhythm",
			Dimension::Commercial => "Audience fit, market trends, virality and adaptation value",
		}
	}
}

impl fmt::Display for Dimension {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.key())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dimension '{0}' (expected one of: structure, characters, dialogue, drama_traits, commercial)")]
pub struct UnknownDimension(pub String);

impl FromStr for Dimension {
	type Err = UnknownDimension;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
		Dimension::ALL
			.into_iter()
			.find(|d| d.key() == normalized)
			.ok_or_else(|| UnknownDimension(s.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn weights_sum_to_one() {
		let total: f64 = Dimension::ALL.iter().map(|d| d.weight()).sum();
		assert!((total - 1.0).abs() < 1e-9);
	}

	#[test]
	fn parses_keys_leniently() {
		assert_eq!("drama-traits".parse::<Dimension>().unwrap(), Dimension::DramaTraits);
		assert_eq!(" Dialogue ".parse::<Dimension>().unwrap(), Dimension::Dialogue);
		assert!("pacing".parse::<Dimension>().is_err());
	}

	#[test]
	fn serializes_as_snake_case_key() {
		let v = serde_json::to_value(Dimension::DramaTraits).unwrap();
		assert_eq!(v, serde_json::json!("drama_traits"));
	}
}
