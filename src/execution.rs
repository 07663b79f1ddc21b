//! Staleness-aware execution of a planned DAG.
//!
//! Levels run in order; within a level, stale instances run concurrently
//! under a worker semaphore. A task only counts as successful when its
//! command exits zero AND every declared output exists afterwards, which
//! catches tools whose real output naming diverges from the declared
//! pattern.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::{FlowError, Result};
use crate::output::OutputMode;
use crate::plan::Plan;
use crate::plan::TaskInstance;
use crate::snapshot::{LiveFilesystem, is_stale};
use crate::util::{output_print_lock, parse_timeout, run_command_with_timeout};

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Default, Serialize)]
pub struct ExecutionReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct PipelineRunner {
    verbose: bool,
    default_timeout: Option<String>,
    workers: usize,
    keep_going: bool,
    output_mode: OutputMode,
}

impl PipelineRunner {
    pub fn new(
        verbose: bool,
        default_timeout: Option<String>,
        workers: Option<usize>,
        keep_going: bool,
        output_mode: OutputMode,
    ) -> Self {
        let workers = workers.unwrap_or_else(default_workers);
        Self {
            verbose,
            default_timeout,
            workers,
            keep_going,
            output_mode,
        }
    }

    /// Runs every stale instance of the plan in dependency order. The first
    /// task failure aborts scheduling (with `keep_going`, independent
    /// branches still run but descendants of the failure are skipped) and
    /// is returned once in-flight tasks have settled.
    pub async fn run(&self, plan: &Plan) -> Result<ExecutionReport> {
        let fs = LiveFilesystem;
        let mut ran: HashSet<usize> = HashSet::new();
        let mut failed: HashSet<usize> = HashSet::new();
        let mut report = ExecutionReport::default();
        let mut first_error: Option<FlowError> = None;

        for level in &plan.levels {
            if first_error.is_some() && !self.keep_going {
                break;
            }

            let mut to_run = Vec::new();
            for &index in &level.tasks {
                let task = &plan.instances[index];
                if task.deps.iter().any(|dep| failed.contains(dep)) {
                    // Its inputs were never produced; poison the subtree.
                    failed.insert(index);
                    continue;
                }
                let upstream_ran = task.deps.iter().any(|dep| ran.contains(dep));
                if !is_stale(task, &fs, upstream_ran) {
                    if self.verbose {
                        println!("Task '{}': outputs up-to-date, skipping", task.label());
                    }
                    report.skipped.push(task.label());
                    continue;
                }
                to_run.push(index);
            }

            let semaphore = Arc::new(Semaphore::new(self.workers));
            let mut handles = Vec::new();

            for index in to_run {
                let task = plan.instances[index].clone();
                let semaphore_clone = Arc::clone(&semaphore);
                let default_timeout = self.default_timeout.clone();
                let output_mode = self.output_mode.clone();
                let verbose = self.verbose;

                let handle = tokio::spawn(async move {
                    let _permit = semaphore_clone.acquire().await.unwrap();

                    if verbose {
                        println!("Running {}: {}", task.label(), task.command);
                    }

                    execute_single_task(&task, default_timeout, output_mode).await
                });

                handles.push((index, handle));
            }

            for (index, handle) in handles {
                let label = plan.instances[index].label();
                match handle.await {
                    Ok(Ok(())) => {
                        ran.insert(index);
                        report.executed.push(label);
                    }
                    Ok(Err(e)) => {
                        eprintln!("Task '{}' failed: {}", label, e);
                        failed.insert(index);
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(e) => {
                        eprintln!("Task '{}' panicked: {}", label, e);
                        failed.insert(index);
                        if first_error.is_none() {
                            first_error = Some(FlowError::Io(std::io::Error::other(e)));
                        }
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

async fn execute_single_task(
    task: &TaskInstance,
    default_timeout: Option<String>,
    output_mode: OutputMode,
) -> Result<()> {
    // The engine writes nothing itself; the one exception is opening the
    // stdout redirect target on the child's behalf. A failed task must not
    // leave that file behind: it would carry a fresh mtime and make the
    // next run skip the task as up-to-date.
    let stdout_file = match &task.stdout {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            Some(File::create(path)?)
        }
        None => None,
    };

    let result = run_redirected(task, default_timeout, output_mode, stdout_file).await;
    if result.is_err() {
        discard_stdout_redirect(task);
    }
    result
}

fn discard_stdout_redirect(task: &TaskInstance) {
    if let Some(path) = &task.stdout {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                eprintln!(
                    "Task '{}': could not remove partial output '{}': {}",
                    task.label(),
                    path.display(),
                    e
                );
            }
        }
    }
}

async fn run_redirected(
    task: &TaskInstance,
    default_timeout: Option<String>,
    output_mode: OutputMode,
    stdout_file: Option<File>,
) -> Result<()> {
    let timeout = parse_timeout(task.timeout.as_deref(), default_timeout.as_deref());
    let stream = matches!(output_mode, OutputMode::Stream);
    let output = run_command_with_timeout(&task.command, timeout, stdout_file, stream)
        .await
        .map_err(|e| FlowError::from_command(e, &task.label(), &task.command))?;

    if matches!(output_mode, OutputMode::Group) {
        let _guard = output_print_lock().lock().await;
        if !output.stdout.is_empty() {
            print!("{}", String::from_utf8_lossy(&output.stdout));
        }
        if !output.stderr.is_empty() {
            eprint!("{}", String::from_utf8_lossy(&output.stderr));
        }
    }

    if !output.status.success() {
        return Err(FlowError::ExternalCommandFailed {
            task: task.label(),
            command: task.command.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let missing: Vec<PathBuf> = task
        .output_paths()
        .filter(|path| !path.exists())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(FlowError::OutputNotProduced {
            task: task.label(),
            missing,
        });
    }

    Ok(())
}
