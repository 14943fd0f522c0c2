//! Analysis job consumer.
//!
//! Workers drain the bus task queue, resolve the owning user's effective
//! settings, pull the run's log from the log store, trim it to budget and ask
//! the configured model for a report. Outcomes are persisted on the run and
//! announced on the bus.

pub mod model;
pub mod prompt;
pub mod truncate;
mod worker;

pub use model::{Completion, CompletionRequest, ModelClient, ModelError, OpenAiClient};
pub use prompt::build_prompt;
pub use truncate::truncate_lines;
pub use worker::{Analyzer, AnalyzerConfig};
