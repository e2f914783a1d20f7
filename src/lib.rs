//! CESA disaster-report collector for HDX.
//!
//! Fetches crowdsourced disaster reports from the PetaBencana.id API for a
//! trailing time window, flattens them into a single fixed-column CSV and
//! publishes that table as the one resource of one HDX dataset. Each
//! invocation is a complete run; modules are exposed for the binary and
//! the integration tests.

pub mod config;
pub mod hdx;
pub mod petabencana;
pub mod pipeline;
pub mod publish;
pub mod report;
pub mod window;

pub use config::Config;
pub use pipeline::{run, run_with, PipelineError, RunSummary};
