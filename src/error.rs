use std::fmt;
use std::path::PathBuf;

use crate::util::CommandError;

#[derive(Debug)]
pub enum FlowError {
    /// A path pattern failed to compile or substitute.
    Pattern(String),
    /// The pipeline file could not be parsed.
    Parse(String),
    /// The pipeline file parsed but fails validation.
    Config(String),
    /// An artifact has no producing rule and does not exist on disk.
    NoProducer(PathBuf),
    /// More than one rule claims to produce the same artifact.
    AmbiguousTemplate { path: String, rules: Vec<String> },
    /// One rule's output patterns match the same artifact with different
    /// wildcard values.
    AmbiguousBinding {
        path: String,
        rule: String,
        bindings: Vec<String>,
    },
    /// Artifact resolution revisited an artifact still under resolution.
    CyclicDependency(Vec<String>),
    /// A task's external command exited with a nonzero status.
    ExternalCommandFailed {
        task: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    /// A task's command succeeded but a declared output is missing.
    OutputNotProduced { task: String, missing: Vec<PathBuf> },
    /// A task's external command exceeded its configured timeout.
    Timeout { task: String, command: String },
    Io(std::io::Error),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::Pattern(msg) => write!(f, "Pattern error: {}", msg),
            FlowError::Parse(msg) => write!(f, "Parse error: {}", msg),
            FlowError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FlowError::NoProducer(path) => write!(
                f,
                "No rule produces '{}' and it does not exist on disk",
                path.display()
            ),
            FlowError::AmbiguousTemplate { path, rules } => write!(
                f,
                "Ambiguous rules for '{}': claimed by {}",
                path,
                rules.join(", ")
            ),
            FlowError::AmbiguousBinding {
                path,
                rule,
                bindings,
            } => write!(
                f,
                "Ambiguous wildcard bindings for '{}' in rule '{}': {}",
                path,
                rule,
                bindings.join(" vs ")
            ),
            FlowError::CyclicDependency(cycle) => {
                write!(f, "Circular dependency: {}", cycle.join(" -> "))
            }
            FlowError::ExternalCommandFailed {
                task,
                command,
                code,
                stderr,
            } => {
                match code {
                    Some(code) => write!(f, "Task '{}' failed with exit code {}", task, code)?,
                    None => write!(f, "Task '{}' was terminated by a signal", task)?,
                }
                write!(f, ": {}", command)?;
                if !stderr.is_empty() {
                    write!(f, "\n{}", stderr.trim_end())?;
                }
                Ok(())
            }
            FlowError::OutputNotProduced { task, missing } => {
                let paths: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
                write!(
                    f,
                    "Task '{}' exited successfully but did not produce: {}",
                    task,
                    paths.join(", ")
                )
            }
            FlowError::Timeout { task, command } => {
                write!(f, "Task '{}' timed out: {}", task, command)
            }
            FlowError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for FlowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlowError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::Io(err)
    }
}

impl From<toml::de::Error> for FlowError {
    fn from(err: toml::de::Error) -> Self {
        FlowError::Parse(err.to_string())
    }
}

impl FlowError {
    /// Maps a process-level failure onto the run-level taxonomy.
    pub fn from_command(err: CommandError, task: &str, command: &str) -> Self {
        match err {
            CommandError::Timeout => FlowError::Timeout {
                task: task.to_string(),
                command: command.to_string(),
            },
            CommandError::Io(err) => FlowError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
