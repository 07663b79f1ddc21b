//! A file-pattern driven workflow runner.
//!
//! Pipelines declare rules with wildcard path patterns; requesting a set of
//! final artifacts resolves the rules into a DAG of task instances that run
//! external tools in dependency order, skipping up-to-date artifacts.

pub mod error;
pub mod execution;
pub mod output;
pub mod pattern;
pub mod plan;
pub mod rule;
pub mod snapshot;
pub mod util;
