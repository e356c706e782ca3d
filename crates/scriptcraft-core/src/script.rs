use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ScriptError;

pub const TRUNCATION_MARKER: &str = "\n\n[Content truncated...]";

/// Script text ready to be embedded in prompts.
#[derive(Debug, Clone)]
pub struct Script {
	pub name: String,
	pub path: Option<PathBuf>,
	pub text: String,
	/// Character count before truncation
	pub original_chars: usize,
	pub truncated: bool,
}

impl Script {
	/// `max_chars` counts characters, not bytes.
	pub fn from_text(name: impl Into<String>, text: impl Into<String>, max_chars: usize) -> Result<Self, ScriptError> {
		let name = name.into();
		let text = text.into();
		if text.trim().is_empty() {
			return Err(ScriptError::Empty { name });
		}

		let original_chars = text.chars().count();
		let (text, truncated) = if original_chars > max_chars {
			let mut cut: String = text.chars().take(max_chars).collect();
			cut.push_str(TRUNCATION_MARKER);
			(cut, true)
		} else {
			(text, false)
		};

		Ok(Self {
			name,
			path: None,
			text,
			original_chars,
			truncated,
		})
	}

	pub async fn load(path: impl AsRef<Path>, max_chars: usize) -> Result<Self, ScriptError> {
		let path = path.as_ref();
		let bytes = tokio::fs::read(path).await.map_err(|source| ScriptError::Io {
			path: path.to_path_buf(),
			source,
		})?;

		let text = decode(&bytes);
		let mut script = Self::from_text(script_name(path), text, max_chars)?;
		script.path = Some(path.to_path_buf());

		if script.truncated {
			warn!(
				script = %script.name,
				chars = script.original_chars,
				max_chars,
				"script exceeds maximum length, truncated"
			);
		}
		debug!(script = %script.name, chars = script.original_chars, "loaded script");
		Ok(script)
	}
}

/// File stem, or the whole file name when there is no stem.
pub fn script_name(path: &Path) -> String {
	path.file_stem()
		.or_else(|| path.file_name())
		.map(|s| s.to_string_lossy().into_owned())
		.unwrap_or_else(|| "unnamed".to_string())
}

/// UTF-8 (BOM stripped), then GBK, then Latin-1 so that any byte sequence decodes.
fn decode(bytes: &[u8]) -> String {
	let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
	if let Ok(s) = std::str::from_utf8(bytes) {
		return s.to_string();
	}
	match encoding_rs::GBK.decode_without_bom_handling_and_without_replacement(bytes) {
		Some(s) => s.into_owned(),
		None => bytes.iter().map(|&b| b as char).collect(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn truncates_by_characters() {
		let text = "一二三四五六七八九十";
		let script = Script::from_text("s", text, 4).unwrap();
		assert!(script.truncated);
		assert_eq!(script.original_chars, 10);
		assert_eq!(script.text, format!("一二三四{}", TRUNCATION_MARKER));

		let script = Script::from_text("s", text, 10).unwrap();
		assert!(!script.truncated);
		assert_eq!(script.text, text);
	}

	#[test]
	fn empty_script_is_rejected() {
		assert!(matches!(Script::from_text("blank", " \n\t", 100), Err(ScriptError::Empty { .. })));
	}

	#[test]
	fn decodes_bom_and_latin1() {
		assert_eq!(decode(b"\xEF\xBB\xBFhello"), "hello");
		assert_eq!(decode(b"caf\xE9"), "café");
	}

	#[test]
	fn decodes_gbk_before_latin1() {
		assert_eq!(decode(&[0xBE, 0xE7, 0xB1, 0xBE]), "剧本");
		assert_eq!(decode(b"EP1 \xBE\xE7\xB1\xBE"), "EP1 剧本");
	}

	#[tokio::test]
	async fn load_uses_file_stem_as_name() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ceo_returns.txt");
		std::fs::write(&path, "EP1\nShe walks in.").unwrap();

		let script = Script::load(&path, 50_000).await.unwrap();
		assert_eq!(script.name, "ceo_returns");
		assert_eq!(script.path.as_deref(), Some(path.as_path()));
		assert!(!script.truncated);
	}

	#[tokio::test]
	async fn missing_file_is_io_error() {
		let err = Script::load("/definitely/not/here.txt", 10).await.unwrap_err();
		assert!(matches!(err, ScriptError::Io { .. }));
	}
}
