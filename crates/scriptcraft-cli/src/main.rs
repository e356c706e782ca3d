use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use globset::{Glob, GlobMatcher};
use scriptcraft_core::report::leaderboard_lines;
use scriptcraft_core::{
	ArkClient, ChatClient, ChatRequest, EvalConfig, PromptStore, ReportFormat, ReportWriter, ScriptEvaluator,
};
use scriptcraft_store::{RecordQuery, Store};
use scriptcraft_types::{fmt_number, Dimension, EvaluationResult};
use tabled::{Table, Tabled};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scriptcraft", version, about = "Evaluate short-drama scripts with a chat model")]
struct Cli {
	/// YAML config file; ARK_* environment variables fill what it leaves out
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	/// Debug logging (RUST_LOG takes precedence)
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Evaluate one script file
	Evaluate(EvaluateArgs),
	/// Evaluate every matching script in a directory
	Batch(BatchArgs),
	/// List evaluation dimensions and their weights
	Dimensions,
	/// Show which settings are present
	CheckConfig,
	/// Send one request to verify the API connection
	Ping,
	/// Browse and manage saved evaluations
	#[command(subcommand)]
	History(HistoryCommand),
}

#[derive(Debug, Clone, clap::Args)]
struct OutputArgs {
	/// Dimension to evaluate (repeatable); defaults to all
	#[arg(short, long = "dimension")]
	dimensions: Vec<Dimension>,

	/// Report format: markdown, md or json (repeatable)
	#[arg(short, long = "format")]
	formats: Vec<ReportFormat>,

	/// Output directory for reports
	#[arg(short, long)]
	output: Option<PathBuf>,

	/// Do not save results to the history database
	#[arg(long)]
	no_history: bool,
}

#[derive(Debug, Clone, clap::Args)]
struct EvaluateArgs {
	script: PathBuf,

	#[command(flatten)]
	output: OutputArgs,
}

#[derive(Debug, Clone, clap::Args)]
struct BatchArgs {
	dir: PathBuf,

	/// File name glob, e.g. `*.txt` or `ep[12]*.txt`
	#[arg(short, long, default_value = "*.txt")]
	pattern: String,

	#[command(flatten)]
	output: OutputArgs,

	/// Also write a batch summary report
	#[arg(short, long)]
	summary: bool,

	/// Scripts evaluated in parallel
	#[arg(short = 'j', long)]
	concurrency: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
	/// List saved evaluations, newest first
	List {
		#[arg(long, default_value_t = scriptcraft_store::DEFAULT_PAGE_SIZE)]
		limit: usize,
		#[arg(long, default_value_t = 0)]
		offset: usize,
		/// Substring of the script name (case-insensitive)
		#[arg(long)]
		search: Option<String>,
	},
	/// Show one saved evaluation
	Show {
		id: String,
		/// Print the full stored result as JSON
		#[arg(long)]
		json: bool,
	},
	/// Delete one saved evaluation
	Delete { id: String },
	/// Delete every saved evaluation
	Clear {
		#[arg(long)]
		yes: bool,
	},
	/// Score statistics over the whole history
	Stats,
	/// Import JSON reports from a directory
	Import { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
	let _ = dotenvy::dotenv();
	let cli = Cli::parse();
	init_tracing(cli.verbose);

	let config = EvalConfig::load(cli.config.as_deref())?;
	match cli.command {
		Commands::Evaluate(args) => evaluate(&config, args).await?,
		Commands::Batch(args) => batch(&config, args).await?,
		Commands::Dimensions => dimensions(),
		Commands::CheckConfig => check_config(&config)?,
		Commands::Ping => ping(&config).await?,
		Commands::History(cmd) => history(&config, cmd)?,
	}
	Ok(())
}

fn init_tracing(verbose: bool) {
	let default = if verbose { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
		.with_writer(std::io::stderr)
		.with_target(false)
		.init();
}

fn build_evaluator(config: &EvalConfig, args: &OutputArgs, concurrency: usize) -> Result<ScriptEvaluator> {
	let client = ArkClient::new(config.client.clone())?;
	let prompts = match &config.prompts_dir {
		Some(dir) => PromptStore::from_dir(dir)?,
		None => PromptStore::builtin(),
	};
	let dimensions = if args.dimensions.is_empty() {
		config.dimensions.clone()
	} else {
		args.dimensions.clone()
	};

	ScriptEvaluator::builder()
		.client(Arc::new(client))
		.prompts(prompts)
		.dimensions(dimensions)
		.max_script_chars(config.max_script_chars)
		.concurrency(concurrency)
		.build()
}

fn formats(config: &EvalConfig, args: &OutputArgs) -> Vec<ReportFormat> {
	if args.formats.is_empty() {
		config.formats.clone()
	} else {
		args.formats.clone()
	}
}

fn report_writer(config: &EvalConfig, args: &OutputArgs) -> Result<ReportWriter> {
	ReportWriter::new(args.output.clone().unwrap_or_else(|| config.output_dir.clone()))
}

/// History is best effort; a failure here never fails the evaluation.
fn save_history(store: Option<&Store>, result: &EvaluationResult, files: &[PathBuf]) {
	if let Some(store) = store {
		if let Err(err) = store.add_record(result, files) {
			warn!(error = %format!("{:#}", err), "could not save evaluation to history");
		}
	}
}

fn open_history(config: &EvalConfig, args: &OutputArgs) -> Option<Store> {
	if args.no_history {
		return None;
	}
	match Store::open(&config.history_db) {
		Ok(store) => Some(store),
		Err(err) => {
			warn!(error = %format!("{:#}", err), "history disabled");
			None
		}
	}
}

async fn evaluate(config: &EvalConfig, args: EvaluateArgs) -> Result<()> {
	let evaluator = build_evaluator(config, &args.output, 1)?;
	let writer = report_writer(config, &args.output)?;

	let result = evaluator.evaluate_path(&args.script).await?;
	println!("{}", result.summary_table());

	let files = writer.write(&result, &formats(config, &args.output))?;
	for file in &files {
		println!("Report: {}", file.display());
	}
	save_history(open_history(config, &args.output).as_ref(), &result, &files);

	if result.failed_dimensions().count() == result.dimensions.len() {
		anyhow::bail!("every dimension failed for {}", args.script.display());
	}
	Ok(())
}

async fn batch(config: &EvalConfig, args: BatchArgs) -> Result<()> {
	let paths = find_scripts(&args.dir, &args.pattern)?;
	if paths.is_empty() {
		anyhow::bail!("no files matching '{}' in {}", args.pattern, args.dir.display());
	}
	info!(scripts = paths.len(), dir = %args.dir.display(), "found scripts");

	let concurrency = args.concurrency.unwrap_or(config.concurrency);
	let evaluator = build_evaluator(config, &args.output, concurrency)?;
	let writer = report_writer(config, &args.output)?;
	let formats = formats(config, &args.output);
	let store = open_history(config, &args.output);

	let mut results = Vec::new();
	let mut failed = 0usize;
	for entry in evaluator.evaluate_batch(paths).await {
		match entry.outcome {
			Ok(result) => {
				let files = writer.write(&result, &formats)?;
				save_history(store.as_ref(), &result, &files);
				results.push(result);
			}
			Err(err) => {
				eprintln!("✗ {}: {:#}", entry.path.display(), err);
				failed += 1;
			}
		}
	}

	if !results.is_empty() {
		println!("\nTop scripts:");
		for line in leaderboard_lines(&results) {
			println!("{}", line);
		}
	}
	if args.summary && results.len() > 1 {
		let path = writer.write_batch_summary(&results)?;
		println!("\nBatch summary: {}", path.display());
	}
	println!("\n{} succeeded, {} failed", results.len(), failed);

	if results.is_empty() {
		anyhow::bail!("no script could be evaluated");
	}
	Ok(())
}

/// Non-recursive, sorted by path.
fn find_scripts(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
	let matcher = glob_matcher(pattern)?;
	let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
		.with_context(|| format!("failed to read directory {}", dir.display()))?
		.filter_map(|entry| entry.ok().map(|e| e.path()))
		.filter(|p| p.is_file())
		.filter(|p| {
			p.file_name()
				.map(|n| matcher.is_match(n))
				.unwrap_or(false)
		})
		.collect();
	paths.sort();
	Ok(paths)
}

fn glob_matcher(pattern: &str) -> Result<GlobMatcher> {
	let glob = Glob::new(pattern).with_context(|| format!("invalid pattern '{}'", pattern))?;
	Ok(glob.compile_matcher())
}

#[derive(Tabled)]
struct DimensionRow {
	key: &'static str,
	name: &'static str,
	weight: String,
	description: &'static str,
}

fn dimensions() {
	let rows: Vec<DimensionRow> = Dimension::ALL
		.iter()
		.map(|d| DimensionRow {
			key: d.key(),
			name: d.name(),
			weight: format!("{:.0}%", d.weight() * 100.0),
			description: d.description(),
		})
		.collect();
	println!("{}", Table::new(rows));
}

fn check_config(config: &EvalConfig) -> Result<()> {
	let mut missing = Vec::new();
	let mark = |ok: bool| if ok { "✓" } else { "✗" };

	let key_ok = config.client.has_api_key();
	println!("{} API key      {}", mark(key_ok), if key_ok { "set" } else { "missing (ARK_API_KEY)" });
	if !key_ok {
		missing.push("API key");
	}

	let model = config.client.model.as_deref().filter(|m| !m.trim().is_empty());
	println!("{} Model        {}", mark(model.is_some()), model.unwrap_or("missing (MODEL_ENDPOINT)"));
	if model.is_none() {
		missing.push("model");
	}

	println!("✓ Base URL     {}", config.client.base_url);
	println!(
		"✓ Limits       timeout {}s, {} attempts, max_tokens {}",
		config.client.timeout_secs, config.client.max_retries, config.client.max_tokens
	);

	match &config.prompts_dir {
		Some(dir) => {
			let store = PromptStore::from_dir(dir);
			let overridden: Vec<&str> = match &store {
				Ok(s) => Dimension::ALL.iter().filter(|d| s.is_overridden(**d)).map(|d| d.key()).collect(),
				Err(_) => Vec::new(),
			};
			match store {
				Ok(_) => println!("✓ Prompts      {} (overrides: {})", dir.display(), overridden.join(", ")),
				Err(err) => {
					println!("✗ Prompts      {}: {}", dir.display(), err);
					missing.push("valid prompts");
				}
			}
		}
		None => println!("✓ Prompts      built-in"),
	}

	println!("✓ Output dir   {}", config.output_dir.display());
	println!("✓ History db   {}", config.history_db.display());

	if !missing.is_empty() {
		anyhow::bail!("configuration incomplete: {}", missing.join(", "));
	}
	Ok(())
}

async fn ping(config: &EvalConfig) -> Result<()> {
	let client = ArkClient::new(config.client.clone())?;
	println!("Pinging {} with model {}", client.endpoint(), client.model());

	let response = client
		.chat(&ChatRequest::new("Reply with the single word: pong"))
		.await
		.context("API request failed")?;

	println!("✓ Response: {}", response.content.trim());
	if let Some(usage) = response.usage {
		println!(
			"  tokens: {} in / {} out / {} total",
			usage.input_tokens, usage.output_tokens, usage.total_tokens
		);
	}
	Ok(())
}

#[derive(Tabled)]
struct RecordRow {
	id: String,
	script: String,
	score: String,
	grade: String,
	evaluated: String,
}

fn history(config: &EvalConfig, cmd: HistoryCommand) -> Result<()> {
	let store = Store::open(&config.history_db)?;

	match cmd {
		HistoryCommand::List { limit, offset, search } => {
			let page = store.list_records(&RecordQuery { limit, offset, search })?;
			if page.records.is_empty() {
				println!("No saved evaluations.");
				return Ok(());
			}
			let shown = page.records.len();
			let rows: Vec<RecordRow> = page
				.records
				.into_iter()
				.map(|r| RecordRow {
					id: r.id,
					script: r.script_name,
					score: format!("{:.2}", r.total_score),
					grade: r.grade.to_string(),
					evaluated: r.evaluated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
				})
				.collect();
			println!("{}", Table::new(rows));
			println!("Showing {}-{} of {}", offset + 1, offset + shown, page.total);
		}
		HistoryCommand::Show { id, json } => {
			if json {
				let result = store
					.load_result(&id)?
					.with_context(|| format!("no history record '{}'", id))?;
				println!("{}", serde_json::to_string_pretty(&result)?);
				return Ok(());
			}
			let record = store
				.get_record(&id)?
				.with_context(|| format!("no history record '{}'", id))?;
			println!("{}  ({})", record.script_name, record.id);
			println!("Evaluated: {}", record.evaluated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
			if let Some(path) = &record.script_path {
				println!("Script:    {}", path);
			}
			println!("{}", record.summary);
			for d in &record.dimension_scores {
				match &d.error {
					Some(err) => println!("  {:<22} failed: {}", d.dimension.name(), err),
					None => println!(
						"  {:<22} {}/{}",
						d.dimension.name(),
						fmt_number(d.score),
						fmt_number(d.max_score)
					),
				}
			}
			for file in &record.report_files {
				println!("Report:    {}", file.display());
			}
		}
		HistoryCommand::Delete { id } => {
			if !store.delete_record(&id)? {
				anyhow::bail!("no history record '{}'", id);
			}
			println!("Deleted {}", id);
		}
		HistoryCommand::Clear { yes } => {
			if !yes {
				anyhow::bail!("refusing to clear the history without --yes");
			}
			println!("Deleted {} record(s)", store.clear_all()?);
		}
		HistoryCommand::Stats => {
			let stats = store.statistics()?;
			println!("Evaluations: {}", stats.total);
			println!("Average:     {:.2}", stats.average);
			for bucket in &stats.distribution {
				println!("  {:>6}  {:>4}  {}", bucket.label, bucket.count, "█".repeat(bucket.count.min(50)));
			}
		}
		HistoryCommand::Import { dir } => {
			let summary = store.import_reports(&dir)?;
			println!(
				"Imported {} of {} report(s): {} skipped, {} failed",
				summary.imported, summary.total, summary.skipped, summary.failed
			);
		}
	}
	Ok(())
}
