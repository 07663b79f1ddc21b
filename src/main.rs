use std::fs::File;
use std::io::BufWriter;
use std::process;

use clap::Parser;

mod cli;

use bioflow::error::{FlowError, Result};
use bioflow::execution::PipelineRunner;
use bioflow::output::OutputMode;
use bioflow::plan::plan;
use bioflow::rule::load_pipeline;
use bioflow::snapshot::LiveFilesystem;
use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    match run_bioflow(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

async fn run_bioflow(args: Cli) -> Result<()> {
    let pipeline = load_pipeline(&args.file)?;

    let targets = if args.targets.is_empty() {
        pipeline.default_targets.clone()
    } else {
        args.targets.clone()
    };
    if targets.is_empty() {
        return Err(FlowError::Config(
            "no targets requested and the pipeline declares no default targets".to_string(),
        ));
    }

    let plan = plan(&pipeline.rules, &targets, &LiveFilesystem)?;

    if args.verbose {
        println!(
            "Planned {} task instances across {} levels",
            plan.instances.len(),
            plan.levels.len()
        );
        for level in &plan.levels {
            println!("  Level {}: {} tasks", level.level, level.tasks.len());
        }
    }

    if args.dry_run {
        println!("Dry run mode - showing what would be executed:");
        for level in &plan.levels {
            for &index in &level.tasks {
                let task = &plan.instances[index];
                println!("  {} would run: {}", task.label(), task.command);
            }
        }
        return Ok(());
    }

    let workers = args.workers.or(pipeline.workers);
    let default_timeout = args.timeout.clone().or(pipeline.default_timeout.clone());
    let output_mode = args
        .output
        .clone()
        .or(pipeline.output.clone())
        .unwrap_or(OutputMode::Group);

    let runner = PipelineRunner::new(
        args.verbose,
        default_timeout,
        workers,
        args.keep_going,
        output_mode,
    );
    let report = runner.run(&plan).await?;

    println!(
        "{} executed, {} skipped",
        report.executed.len(),
        report.skipped.len()
    );

    if let Some(path) = &args.report {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &report)
            .map_err(|e| FlowError::Config(format!("failed to write report: {}", e)))?;
    }

    Ok(())
}
