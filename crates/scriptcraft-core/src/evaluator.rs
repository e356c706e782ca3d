use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use scriptcraft_types::{Dimension, DimensionResult, EvaluationResult};
use tracing::{info, info_span, warn, Instrument};

use crate::aggregate::compute_overall;
use crate::client::{chat_json, ChatClient, ChatRequest};
use crate::config::DEFAULT_MAX_SCRIPT_CHARS;
use crate::parse::dimension_from_object;
use crate::prompts::PromptStore;
use crate::script::Script;
use crate::trace::collect_traces;

pub struct EvaluatorBuilder {
	client: Option<Arc<dyn ChatClient>>,
	prompts: PromptStore,
	dimensions: Vec<Dimension>,
	system_prompt: Option<String>,
	max_script_chars: usize,
	concurrency: usize,
}

impl EvaluatorBuilder {
	pub fn new() -> Self {
		Self {
			client: None,
			prompts: PromptStore::builtin(),
			dimensions: Dimension::ALL.to_vec(),
			system_prompt: None,
			max_script_chars: DEFAULT_MAX_SCRIPT_CHARS,
			concurrency: 1,
		}
	}

	pub fn client(mut self, client: Arc<dyn ChatClient>) -> Self {
		self.client = Some(client);
		self
	}

	pub fn prompts(mut self, prompts: PromptStore) -> Self {
		self.prompts = prompts;
		self
	}

	pub fn dimensions<I>(mut self, dimensions: I) -> Self
	where
		I: IntoIterator<Item = Dimension>,
	{
		self.dimensions = dimensions.into_iter().collect();
		self
	}

	pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
		self.system_prompt = Some(system_prompt.into());
		self
	}

	pub fn max_script_chars(mut self, n: usize) -> Self {
		self.max_script_chars = n.max(1);
		self
	}

	/// Scripts in flight during `evaluate_batch`.
	pub fn concurrency(mut self, n: usize) -> Self {
		self.concurrency = n.max(1);
		self
	}

	pub fn build(self) -> Result<ScriptEvaluator> {
		let mut dimensions = self.dimensions;
		dimensions.sort();
		dimensions.dedup();
		if dimensions.is_empty() {
			anyhow::bail!("at least one dimension must be selected");
		}

		Ok(ScriptEvaluator {
			client: self.client.ok_or_else(|| anyhow!("client must be set"))?,
			prompts: Arc::new(self.prompts),
			dimensions,
			system_prompt: self.system_prompt,
			max_script_chars: self.max_script_chars,
			concurrency: self.concurrency,
		})
	}
}

impl Default for EvaluatorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Outcome for one script of a batch.
#[derive(Debug)]
pub struct BatchEntry {
	pub path: PathBuf,
	pub outcome: Result<EvaluationResult>,
}

#[derive(Clone)]
pub struct ScriptEvaluator {
	client: Arc<dyn ChatClient>,
	prompts: Arc<PromptStore>,
	dimensions: Vec<Dimension>,
	system_prompt: Option<String>,
	max_script_chars: usize,
	concurrency: usize,
}

impl ScriptEvaluator {
	pub fn builder() -> EvaluatorBuilder {
		EvaluatorBuilder::new()
	}

	pub fn dimensions(&self) -> &[Dimension] {
		&self.dimensions
	}

	pub fn max_script_chars(&self) -> usize {
		self.max_script_chars
	}

	/// Scores every selected dimension in turn. A dimension that fails is kept
	/// as a failed result; the evaluation itself does not fail.
	pub async fn evaluate(&self, script: &Script) -> EvaluationResult {
		let span = info_span!("evaluate", script = %script.name);
		async {
			let total = self.dimensions.len();
			let mut dimensions = BTreeMap::new();

			for (idx, dimension) in self.dimensions.iter().copied().enumerate() {
				info!(
					dimension = %dimension,
					progress = %format!("{}/{}", idx + 1, total),
					"evaluating {}",
					dimension.name()
				);
				let result = self.evaluate_dimension(dimension, script).await;
				if let Some(err) = &result.error {
					warn!(dimension = %dimension, error = %err, "dimension evaluation failed");
				} else {
					info!(dimension = %dimension, score = result.score, max_score = result.max_score, "dimension scored");
				}
				dimensions.insert(dimension, result);
			}

			let overall = compute_overall(&dimensions);
			info!(total_score = overall.total_score, grade = %overall.grade, "evaluation complete");

			EvaluationResult {
				script_name: script.name.clone(),
				script_path: script.path.clone(),
				evaluated_at: Utc::now(),
				script_chars: script.original_chars,
				truncated: script.truncated,
				dimensions,
				overall,
			}
		}
		.instrument(span)
		.await
	}

	async fn evaluate_dimension(&self, dimension: Dimension, script: &Script) -> DimensionResult {
		let mut request = ChatRequest::new(self.prompts.render(dimension, &script.text));
		if let Some(system) = &self.system_prompt {
			request = request.system(system.clone());
		}

		let (outcome, traces) = collect_traces(async {
			let reply = chat_json(self.client.as_ref(), request).await?;
			let result = dimension_from_object(dimension, reply.object, &reply.raw)?;
			anyhow::Ok(result)
		})
		.await;

		let mut result = match outcome {
			Ok(result) => result,
			Err(err) => DimensionResult::failed(dimension, format!("{:#}", err)),
		};
		result.traces = traces;
		result
	}

	pub async fn evaluate_path(&self, path: impl AsRef<Path>) -> Result<EvaluationResult> {
		let script = Script::load(path, self.max_script_chars).await?;
		Ok(self.evaluate(&script).await)
	}

	/// Evaluates scripts with up to `concurrency` in flight. Entries come back in
	/// input order; a script that cannot be loaded becomes an error entry.
	pub async fn evaluate_batch<I, P>(&self, paths: I) -> Vec<BatchEntry>
	where
		I: IntoIterator<Item = P>,
		P: Into<PathBuf>,
	{
		let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
		let total = paths.len();
		info!(scripts = total, concurrency = self.concurrency, "starting batch evaluation");

		let entries: Vec<BatchEntry> = stream::iter(paths.into_iter().enumerate())
			.map(|(idx, path)| {
				let evaluator = self.clone();
				async move {
					info!(script = %path.display(), progress = %format!("{}/{}", idx + 1, total), "batch item");
					let outcome = evaluator.evaluate_path(&path).await;
					if let Err(err) = &outcome {
						warn!(script = %path.display(), error = %err, "batch item failed");
					}
					BatchEntry { path, outcome }
				}
			})
			.buffered(self.concurrency)
			.collect()
			.await;

		let succeeded = entries.iter().filter(|e| e.outcome.is_ok()).count();
		info!(succeeded, failed = total - succeeded, "batch evaluation complete");
		entries
	}
}
