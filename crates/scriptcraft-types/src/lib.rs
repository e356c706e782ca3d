//! scriptcraft-types: data model shared by the evaluator, the history store and the CLI.

pub mod dimension;
pub mod result;
pub mod trace;

pub use dimension::{Dimension, UnknownDimension};
pub use result::{
	fmt_number, DimensionResult, EvaluationResult, Grade, OverallScore, SubScore, UnknownGrade,
	WeightedScore,
};
pub use trace::{TokenUsage, Trace, TraceBuilder};
