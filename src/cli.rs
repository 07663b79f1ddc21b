use clap::Parser;

use bioflow::output::OutputMode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline definition file to use
    #[arg(short = 'f', long = "file", default_value = "pipeline.toml")]
    pub file: String,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Override number of worker processes for parallel execution
    #[arg(short = 'j', long = "workers")]
    pub workers: Option<usize>,

    /// Override default per-task timeout (e.g., "5m", "30s", "1h30m")
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<String>,

    /// Show the planned task instances without running anything
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Keep running independent branches after a task fails
    #[arg(long = "keep-going")]
    pub keep_going: bool,

    /// How to display task output in the terminal
    #[arg(long = "output", value_enum)]
    pub output: Option<OutputMode>,

    /// Write a JSON execution report to this path after a successful run
    #[arg(long = "report")]
    pub report: Option<String>,

    /// Target artifacts to build, defaults to the pipeline's default targets
    pub targets: Vec<String>,
}
