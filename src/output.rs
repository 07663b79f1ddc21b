use clap::ValueEnum;
use serde::Deserialize;

#[derive(ValueEnum, Deserialize, Clone, Debug)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Echo tool output live as it is produced.
    Stream,
    /// Print each task's captured output as one block after it finishes.
    Group,
}
