use std::collections::HashMap;
use std::path::Path;

use scriptcraft_types::Dimension;
use tracing::debug;

use crate::error::PromptError;

pub const SCRIPT_PLACEHOLDER: &str = "{script_content}";

const STRUCTURE: &str = include_str!("../prompts/structure.txt");
const CHARACTERS: &str = include_str!("../prompts/characters.txt");
const DIALOGUE: &str = include_str!("../prompts/dialogue.txt");
const DRAMA_TRAITS: &str = include_str!("../prompts/drama_traits.txt");
const COMMERCIAL: &str = include_str!("../prompts/commercial.txt");

fn builtin_template(dimension: Dimension) -> &'static str {
	match dimension {
		Dimension::Structure => STRUCTURE,
		Dimension::Characters => CHARACTERS,
		Dimension::Dialogue => DIALOGUE,
		Dimension::DramaTraits => DRAMA_TRAITS,
		Dimension::Commercial => COMMERCIAL,
	}
}

/// Per-dimension prompt templates. Built-ins are compiled in; a directory of
/// `<dimension>.txt` files can replace any of them.
#[derive(Debug, Clone, Default)]
pub struct PromptStore {
	overrides: HashMap<Dimension, String>,
}

impl PromptStore {
	pub fn builtin() -> Self {
		Self::default()
	}

	pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, PromptError> {
		let dir = dir.as_ref();
		let mut store = Self::builtin();
		for dimension in Dimension::ALL {
			let path = dir.join(format!("{}.txt", dimension.key()));
			if !path.is_file() {
				continue;
			}
			let template = std::fs::read_to_string(&path).map_err(|source| PromptError::Io {
				path: path.clone(),
				source,
			})?;
			debug!(dimension = %dimension, path = %path.display(), "loaded prompt override");
			store = store.with_template(dimension, template)?;
		}
		Ok(store)
	}

	pub fn with_template(mut self, dimension: Dimension, template: impl Into<String>) -> Result<Self, PromptError> {
		let template = template.into();
		if !template.contains(SCRIPT_PLACEHOLDER) {
			return Err(PromptError::MissingPlaceholder { dimension });
		}
		self.overrides.insert(dimension, template);
		Ok(self)
	}

	pub fn template(&self, dimension: Dimension) -> &str {
		self.overrides
			.get(&dimension)
			.map(String::as_str)
			.unwrap_or_else(|| builtin_template(dimension))
	}

	pub fn is_overridden(&self, dimension: Dimension) -> bool {
		self.overrides.contains_key(&dimension)
	}

	pub fn render(&self, dimension: Dimension, script_text: &str) -> String {
		self.template(dimension).replace(SCRIPT_PLACEHOLDER, script_text)
	}
}
