//! Turning model text into a `DimensionResult`.

use std::collections::BTreeMap;

use scriptcraft_types::{Dimension, DimensionResult, SubScore};
use serde_json::{Map, Value};

use crate::error::ResponseError;

const DEFAULT_MAX_SCORE: f64 = 100.0;

/// Keys with a dedicated field on `DimensionResult`; everything else goes to `extra`.
const KNOWN_KEYS: &[&str] = &[
	"dimension",
	"dimension_name",
	"total_score",
	"score",
	"max_score",
	"sub_scores",
	"strengths",
	"weaknesses",
	"suggestions",
	"comment",
	"summary",
	"overall_comment",
];

/// Trims and removes a surrounding Markdown code fence.
pub fn strip_code_fence(text: &str) -> &str {
	let mut s = text.trim();
	if let Some(rest) = s.strip_prefix("```json") {
		s = rest;
	} else if let Some(rest) = s.strip_prefix("```") {
		s = rest;
	}
	if let Some(rest) = s.strip_suffix("```") {
		s = rest;
	}
	s.trim()
}

/// Extracts the JSON object a model reply carries.
pub fn extract_object(text: &str) -> Result<Map<String, Value>, ResponseError> {
	let cleaned = strip_code_fence(text);
	let value = match serde_json::from_str::<Value>(cleaned) {
		Ok(v) => v,
		Err(err) => embedded_object(cleaned).ok_or_else(|| ResponseError::InvalidJson {
			message: err.to_string(),
		})?,
	};

	match value {
		Value::Object(map) => Ok(map),
		Value::Array(items) => match items.into_iter().next() {
			Some(Value::Object(map)) => Ok(map),
			Some(other) => Err(ResponseError::NotAnObject(type_name(&other))),
			None => Err(ResponseError::EmptyArray),
		},
		Value::Number(n) => Err(ResponseError::BareNumber(n.as_f64().unwrap_or_default())),
		other => Err(ResponseError::NotAnObject(type_name(&other))),
	}
}

/// The span from the first `{` to the last `}`, if it parses.
fn embedded_object(text: &str) -> Option<Value> {
	let start = text.find('{')?;
	let end = text.rfind('}')?;
	if end <= start {
		return None;
	}
	serde_json::from_str(&text[start..=end]).ok()
}

fn type_name(v: &Value) -> &'static str {
	match v {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}

/// Parses raw model text for `dimension`.
pub fn parse_dimension(dimension: Dimension, raw: &str) -> Result<DimensionResult, ResponseError> {
	let object = extract_object(raw)?;
	dimension_from_object(dimension, object, raw)
}

/// Builds a result from an already extracted object. `raw` is kept verbatim.
pub fn dimension_from_object(
	dimension: Dimension,
	mut object: Map<String, Value>,
	raw: &str,
) -> Result<DimensionResult, ResponseError> {
	let score = object
		.get("total_score")
		.and_then(number)
		.or_else(|| object.get("score").and_then(number))
		.ok_or(ResponseError::MissingScore)?;
	let max_score = object
		.get("max_score")
		.and_then(number)
		.filter(|m| *m > 0.0)
		.unwrap_or(DEFAULT_MAX_SCORE);

	let mut result = DimensionResult::new(dimension, score.clamp(0.0, max_score), max_score);
	result.strengths = string_list(object.get("strengths"));
	result.weaknesses = string_list(object.get("weaknesses"));
	result.suggestions = string_list(object.get("suggestions"));
	result.sub_scores = sub_scores(object.get("sub_scores"));
	result.commentary = ["comment", "summary", "overall_comment"]
		.iter()
		.find_map(|k| object.get(*k).and_then(Value::as_str))
		.map(str::to_string);
	result.raw_response = Some(raw.to_string());

	object.retain(|k, _| !KNOWN_KEYS.contains(&k.as_str()));
	result.extra = object;

	Ok(result)
}

/// Finite numbers, or strings holding one ("85", " 72.5 ").
fn number(v: &Value) -> Option<f64> {
	let n = match v {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	};
	n.filter(|n: &f64| n.is_finite())
}

fn string_list(v: Option<&Value>) -> Vec<String> {
	match v {
		Some(Value::Array(items)) => items
			.iter()
			.filter(|item| !item.is_null())
			.map(|item| match item {
				Value::String(s) => s.clone(),
				other => other.to_string(),
			})
			.collect(),
		Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
		_ => Vec::new(),
	}
}

fn sub_scores(v: Option<&Value>) -> BTreeMap<String, SubScore> {
	let Some(Value::Object(entries)) = v else {
		return BTreeMap::new();
	};

	entries
		.iter()
		.filter_map(|(key, entry)| {
			let sub = match entry {
				Value::Object(obj) => SubScore {
					name: obj.get("name").and_then(Value::as_str).map(str::to_string),
					score: obj.get("score").and_then(number)?,
					max_score: obj.get("max_score").and_then(number).unwrap_or(DEFAULT_MAX_SCORE),
					comment: obj.get("comment").and_then(Value::as_str).map(str::to_string),
				},
				bare => SubScore {
					name: None,
					score: number(bare)?,
					max_score: DEFAULT_MAX_SCORE,
					comment: None,
				},
			};
			Some((key.clone(), sub))
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn strips_fences() {
		assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
		assert_eq!(strip_code_fence("```\n{}\n```  "), "{}");
		assert_eq!(strip_code_fence("  {} "), "{}");
	}

	#[test]
	fn extracts_object_from_prose() {
		let text = "Here is my verdict:\n{\"total_score\": 70}\nThanks.";
		let obj = extract_object(text).unwrap();
		assert_eq!(obj["total_score"], json!(70));
	}

	#[test]
	fn array_yields_first_element() {
		let obj = extract_object("[{\"total_score\": 1}, {\"total_score\": 2}]").unwrap();
		assert_eq!(obj["total_score"], json!(1));
		assert!(matches!(extract_object("[]"), Err(ResponseError::EmptyArray)));
	}

	#[test]
	fn scalars_are_rejected() {
		assert!(matches!(extract_object("85"), Err(ResponseError::BareNumber(n)) if n == 85.0));
		assert!(matches!(extract_object("\"text\""), Err(ResponseError::NotAnObject("string"))));
		assert!(matches!(extract_object("not json"), Err(ResponseError::InvalidJson { .. })));
	}

	#[test]
	fn parses_full_dimension_reply() {
		let raw = r#"```json
{
  "dimension": "dialogue",
  "total_score": "82",
  "max_score": 100,
  "sub_scores": {
    "naturalness": {"name": "Naturalness", "score": 26, "max_score": 30, "comment": "fluent"},
    "subtext": 18
  },
  "strengths": ["Sharp banter", {"line": 3}],
  "weaknesses": [],
  "suggestions": ["Trim exposition in ep. 2"],
  "comment": "Solid overall",
  "notable_lines": [{"speaker": "Lin", "line": "You owe me a wedding.", "reason": "hook"}]
}
```"#;
		let r = parse_dimension(Dimension::Dialogue, raw).unwrap();

		assert_eq!(r.dimension, Dimension::Dialogue);
		assert_eq!(r.score, 82.0);
		assert_eq!(r.max_score, 100.0);
		assert_eq!(r.strengths, vec!["Sharp banter".to_string(), "{\"line\":3}".to_string()]);
		assert_eq!(r.suggestions.len(), 1);
		assert_eq!(r.commentary.as_deref(), Some("Solid overall"));
		assert_eq!(r.sub_scores["naturalness"].max_score, 30.0);
		assert_eq!(r.sub_scores["subtext"].score, 18.0);
		assert!(r.extra.contains_key("notable_lines"));
		assert!(!r.extra.contains_key("dimension"));
		assert_eq!(r.raw_response.as_deref(), Some(raw));
	}

	#[test]
	fn clamps_score_and_defaults_max() {
		let r = parse_dimension(Dimension::Structure, "{\"score\": 130, \"max_score\": 0}").unwrap();
		assert_eq!(r.max_score, 100.0);
		assert_eq!(r.score, 100.0);

		let r = parse_dimension(Dimension::Structure, "{\"total_score\": -5}").unwrap();
		assert_eq!(r.score, 0.0);
	}

	#[test]
	fn missing_score_is_an_error() {
		let err = parse_dimension(Dimension::Commercial, "{\"strengths\": []}").unwrap_err();
		assert!(matches!(err, ResponseError::MissingScore));
	}
}
