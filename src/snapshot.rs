//! Filesystem state behind a seam, so staleness is a pure function that
//! unit tests can drive with fabricated mtimes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::plan::TaskInstance;

pub trait FileState {
    fn mtime(&self, path: &Path) -> Option<SystemTime>;

    fn exists(&self, path: &Path) -> bool {
        self.mtime(path).is_some()
    }
}

pub struct LiveFilesystem;

impl FileState for LiveFilesystem {
    fn mtime(&self, path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|meta| meta.modified()).ok()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// An immutable paths-to-mtimes snapshot. A path absent from the snapshot
/// does not exist.
#[derive(Debug, Default)]
pub struct SnapshotState {
    entries: HashMap<PathBuf, SystemTime>,
}

impl SnapshotState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, mtime: SystemTime) {
        self.entries.insert(path.into(), mtime);
    }
}

impl FileState for SnapshotState {
    fn mtime(&self, path: &Path) -> Option<SystemTime> {
        self.entries.get(path).copied()
    }
}

/// A task must run when any declared output is missing, any output is older
/// than any input, or an upstream producer was re-executed in this run.
pub fn is_stale<F: FileState + ?Sized>(
    task: &TaskInstance,
    fs: &F,
    upstream_ran: bool,
) -> bool {
    if upstream_ran {
        return true;
    }

    let mut oldest_output: Option<SystemTime> = None;
    for path in task.output_paths() {
        match fs.mtime(path) {
            None => return true,
            Some(mtime) => {
                oldest_output = Some(match oldest_output {
                    Some(oldest) if oldest <= mtime => oldest,
                    _ => mtime,
                });
            }
        }
    }

    let newest_input = task.input_paths().filter_map(|path| fs.mtime(path)).max();

    match (oldest_output, newest_input) {
        (Some(output), Some(input)) => input > output,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Binding;
    use std::time::Duration;

    fn task(inputs: &[&str], outputs: &[&str]) -> TaskInstance {
        TaskInstance {
            rule: "convert".to_string(),
            binding: Binding::new(),
            inputs: vec![(
                "source".to_string(),
                inputs.iter().map(PathBuf::from).collect(),
            )],
            outputs: vec![(
                "result".to_string(),
                outputs.iter().map(PathBuf::from).collect(),
            )],
            command: "convert".to_string(),
            stdout: None,
            timeout: None,
            deps: Vec::new(),
        }
    }

    fn at(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn missing_output_is_stale_regardless_of_timestamps() {
        let mut fs = SnapshotState::new();
        fs.insert("in/a.csv", at(10));

        assert!(is_stale(&task(&["in/a.csv"], &["out/a.txt"]), &fs, false));
    }

    #[test]
    fn one_of_several_outputs_missing_is_stale() {
        let mut fs = SnapshotState::new();
        fs.insert("in/a.csv", at(10));
        fs.insert("out/a.txt", at(20));

        assert!(is_stale(
            &task(&["in/a.csv"], &["out/a.txt", "out/a.log"]),
            &fs,
            false
        ));
    }

    #[test]
    fn fresh_outputs_are_skipped() {
        let mut fs = SnapshotState::new();
        fs.insert("in/a.csv", at(10));
        fs.insert("out/a.txt", at(20));

        assert!(!is_stale(&task(&["in/a.csv"], &["out/a.txt"]), &fs, false));
    }

    #[test]
    fn output_older_than_input_is_stale() {
        let mut fs = SnapshotState::new();
        fs.insert("in/a.csv", at(30));
        fs.insert("out/a.txt", at(20));

        assert!(is_stale(&task(&["in/a.csv"], &["out/a.txt"]), &fs, false));
    }

    #[test]
    fn oldest_output_is_compared_against_newest_input() {
        let mut fs = SnapshotState::new();
        fs.insert("in/a.csv", at(10));
        fs.insert("in/b.csv", at(25));
        fs.insert("out/a.txt", at(30));
        fs.insert("out/a.log", at(20));

        assert!(is_stale(
            &task(&["in/a.csv", "in/b.csv"], &["out/a.txt", "out/a.log"]),
            &fs,
            false
        ));
    }

    #[test]
    fn upstream_rerun_forces_execution() {
        let mut fs = SnapshotState::new();
        fs.insert("in/a.csv", at(10));
        fs.insert("out/a.txt", at(20));

        assert!(is_stale(&task(&["in/a.csv"], &["out/a.txt"]), &fs, true));
    }

    #[test]
    fn inputless_task_with_outputs_present_is_fresh() {
        let mut fs = SnapshotState::new();
        fs.insert("reference/chr22.fa.gz", at(5));

        assert!(!is_stale(
            &task(&[], &["reference/chr22.fa.gz"]),
            &fs,
            false
        ));
        assert!(is_stale(&task(&[], &["reference/chr22.fa.gz"]), &SnapshotState::new(), false));
    }
}
