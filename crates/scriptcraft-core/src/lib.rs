//! scriptcraft-core: rubric-driven evaluation of short-drama scripts.
//! Load a script, score it per dimension with a chat model, aggregate a weighted
//! grade and render reports.

pub mod aggregate;
pub mod client;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod parse;
pub mod prompts;
pub mod report;
pub mod script;
pub mod testing;
pub mod trace;

pub use aggregate::{compute_overall, rank, BatchStatistics};
pub use client::{chat_json, ArkClient, ChatClient, ChatRequest, ChatResponse, JsonReply};
pub use config::{ClientConfig, EvalConfig, DEFAULT_BASE_URL, DEFAULT_MAX_SCRIPT_CHARS};
pub use error::{ClientError, PromptError, ResponseError, ScriptError};
pub use evaluator::{BatchEntry, EvaluatorBuilder, ScriptEvaluator};
pub use prompts::PromptStore;
pub use report::{
    render_batch_summary, render_json, render_markdown, JsonReport, ReportFormat, ReportWriter,
};
pub use script::Script;
pub use trace::{collect_traces, record_trace};

pub use scriptcraft_types as types;
