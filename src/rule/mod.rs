pub mod config;

pub use config::{load_pipeline, parse_pipeline};

use crate::output::OutputMode;
use crate::pattern::Pattern;

/// A named set of path patterns within a rule. Expansions are desugared at
/// load time, so an entry may carry several concrete paths.
#[derive(Debug, Clone)]
pub struct IoEntry {
    pub name: String,
    pub paths: Vec<Pattern>,
}

/// A task template: wildcard-patterned inputs and outputs plus a command
/// template whose placeholders reference entry names.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub inputs: Vec<IoEntry>,
    pub outputs: Vec<IoEntry>,
    /// Wildcard-substituted strings available to the command, never
    /// dependency edges.
    pub params: Vec<(String, Pattern)>,
    pub command: String,
    /// Name of the output entry that receives the child's standard output.
    pub stdout: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug)]
pub struct Pipeline {
    pub rules: Vec<Rule>,
    pub default_targets: Vec<String>,
    pub workers: Option<usize>,
    pub default_timeout: Option<String>,
    pub output: Option<OutputMode>,
}
