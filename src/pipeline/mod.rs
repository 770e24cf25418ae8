//! Email processing pipeline.
//!
//! Every run goes through:
//! 1. `MailStore::fetch_recent()` for the lookback window
//! 2. `Classifier::classify()` per message, paced to the model's rate limit
//! 3. `MailStore::organize()` for messages with at least one true facet
//!
//! Runs are time-boxed: the budget is checked before each message and the run
//! ends early with `timeout_reached` rather than overrunning the scheduler.

pub mod processor;
pub mod types;

pub use processor::Pipeline;
pub use types::{ProcessingReport, RunState};
