//! DAG construction.
//!
//! Requested artifact paths are resolved against rule output patterns,
//! recursively pulling in the task instances that produce each input. A
//! path no rule produces must already exist (a source file) or planning
//! fails with `NoProducer`. Instances are memoized per (rule, binding) so a
//! shared dependency appears once in the plan.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use crate::error::{FlowError, Result};
use crate::pattern::{self, Binding};
use crate::rule::Rule;
use crate::snapshot::FileState;

/// A rule bound to concrete wildcard values, with its command fully
/// substituted.
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub rule: String,
    pub binding: Binding,
    pub inputs: Vec<(String, Vec<PathBuf>)>,
    pub outputs: Vec<(String, Vec<PathBuf>)>,
    pub command: String,
    /// Redirect target for the child's standard output, when declared.
    pub stdout: Option<PathBuf>,
    pub timeout: Option<String>,
    /// Indices of the instances producing this instance's inputs. Always
    /// smaller than this instance's own index.
    pub deps: Vec<usize>,
}

impl TaskInstance {
    pub fn label(&self) -> String {
        if self.binding.is_empty() {
            self.rule.clone()
        } else {
            let pairs: Vec<String> = self
                .binding
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            format!("{}[{}]", self.rule, pairs.join(", "))
        }
    }

    pub fn input_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.inputs.iter().flat_map(|(_, paths)| paths.iter())
    }

    pub fn output_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.outputs.iter().flat_map(|(_, paths)| paths.iter())
    }
}

#[derive(Debug)]
pub struct ExecutionLevel {
    pub level: usize,
    pub tasks: Vec<usize>,
}

#[derive(Debug)]
pub struct Plan {
    pub instances: Vec<TaskInstance>,
    pub targets: Vec<PathBuf>,
    pub levels: Vec<ExecutionLevel>,
}

pub fn plan<F: FileState>(rules: &[Rule], targets: &[String], fs: &F) -> Result<Plan> {
    let mut planner = Planner {
        rules,
        fs,
        instances: Vec::new(),
        state: HashMap::new(),
        stack: Vec::new(),
    };

    let mut requested = Vec::with_capacity(targets.len());
    let mut seen = HashSet::new();
    for target in targets {
        if seen.insert(target.as_str()) {
            planner.resolve_artifact(target)?;
            requested.push(PathBuf::from(target));
        }
    }

    let levels = calculate_dependency_levels(&planner.instances);

    Ok(Plan {
        instances: planner.instances,
        targets: requested,
        levels,
    })
}

enum ResolveState {
    InProgress,
    Done(usize),
}

struct Planner<'a, F: FileState> {
    rules: &'a [Rule],
    fs: &'a F,
    instances: Vec<TaskInstance>,
    /// Per (rule, binding) resolution state, keyed by the instance label.
    state: HashMap<String, ResolveState>,
    /// Artifact paths currently under resolution, for cycle reporting.
    stack: Vec<String>,
}

impl<F: FileState> Planner<'_, F> {
    /// Resolves one artifact path to the index of its producing instance,
    /// or `None` for a pre-existing source file.
    fn resolve_artifact(&mut self, path: &str) -> Result<Option<usize>> {
        let mut matched: Vec<(&Rule, Binding)> = Vec::new();
        for rule in self.rules {
            // Every output pattern of a rule gets a say: two patterns may
            // legitimately agree on the binding, but disagreement means the
            // requested path has no single interpretation under this rule.
            let mut bindings: Vec<Binding> = Vec::new();
            for output in rule.outputs.iter().flat_map(|entry| entry.paths.iter()) {
                if let Some(binding) = output.matches(path) {
                    if !bindings.contains(&binding) {
                        bindings.push(binding);
                    }
                }
            }
            if bindings.len() > 1 {
                return Err(FlowError::AmbiguousBinding {
                    path: path.to_string(),
                    rule: rule.name.clone(),
                    bindings: bindings.iter().map(format_binding).collect(),
                });
            }
            if let Some(binding) = bindings.pop() {
                matched.push((rule, binding));
            }
        }

        if matched.len() > 1 {
            return Err(FlowError::AmbiguousTemplate {
                path: path.to_string(),
                rules: matched.iter().map(|(rule, _)| rule.name.clone()).collect(),
            });
        }

        let Some((rule, binding)) = matched.pop() else {
            if self.fs.exists(std::path::Path::new(path)) {
                return Ok(None);
            }
            return Err(FlowError::NoProducer(PathBuf::from(path)));
        };

        let key = instance_key(&rule.name, &binding);
        match self.state.get(&key) {
            Some(ResolveState::Done(index)) => return Ok(Some(*index)),
            Some(ResolveState::InProgress) => {
                let mut cycle = self.stack.clone();
                cycle.push(path.to_string());
                return Err(FlowError::CyclicDependency(cycle));
            }
            None => {}
        }

        self.state.insert(key.clone(), ResolveState::InProgress);
        self.stack.push(path.to_string());

        let mut instance = instantiate(rule, binding)?;

        let mut deps = Vec::new();
        let mut seen = HashSet::new();
        let input_paths: Vec<String> = instance
            .input_paths()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        for input in &input_paths {
            if let Some(producer) = self.resolve_artifact(input)? {
                if seen.insert(producer) {
                    deps.push(producer);
                }
            }
        }
        instance.deps = deps;

        let index = self.instances.len();
        self.instances.push(instance);
        self.state.insert(key, ResolveState::Done(index));
        self.stack.pop();

        Ok(Some(index))
    }
}

fn format_binding(binding: &Binding) -> String {
    let pairs: Vec<String> = binding
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    pairs.join(",")
}

fn instance_key(rule: &str, binding: &Binding) -> String {
    format!("{}({})", rule, format_binding(binding))
}

/// Binds a rule to concrete wildcard values: substitutes every input,
/// output, and param pattern and renders the command template.
fn instantiate(rule: &Rule, binding: Binding) -> Result<TaskInstance> {
    let mut values: BTreeMap<String, String> = BTreeMap::new();

    let mut outputs = Vec::with_capacity(rule.outputs.len());
    for entry in &rule.outputs {
        let mut paths = Vec::with_capacity(entry.paths.len());
        for output in &entry.paths {
            paths.push(output.substitute(&binding)?);
        }
        values.insert(entry.name.clone(), paths.join(" "));
        outputs.push((
            entry.name.clone(),
            paths.into_iter().map(PathBuf::from).collect::<Vec<PathBuf>>(),
        ));
    }

    let mut inputs = Vec::with_capacity(rule.inputs.len());
    for entry in &rule.inputs {
        let mut paths = Vec::with_capacity(entry.paths.len());
        for input in &entry.paths {
            paths.push(input.substitute(&binding)?);
        }
        values.insert(entry.name.clone(), paths.join(" "));
        inputs.push((
            entry.name.clone(),
            paths.into_iter().map(PathBuf::from).collect::<Vec<PathBuf>>(),
        ));
    }

    for (name, param) in &rule.params {
        values.insert(name.clone(), param.substitute(&binding)?);
    }

    let command = pattern::render(&rule.command, &values);

    let stdout = match &rule.stdout {
        Some(key) => outputs
            .iter()
            .find(|(name, _)| name == key)
            .and_then(|(_, paths)| paths.first().cloned()),
        None => None,
    };

    Ok(TaskInstance {
        rule: rule.name.clone(),
        binding,
        inputs,
        outputs,
        command,
        stdout,
        timeout: rule.timeout.clone(),
        deps: Vec::new(),
    })
}

/// Groups instances into dependency levels: an instance's level is one more
/// than the deepest of its producers, and instances within a level are free
/// to run in any order.
pub fn calculate_dependency_levels(instances: &[TaskInstance]) -> Vec<ExecutionLevel> {
    let mut levels = vec![0usize; instances.len()];
    for (index, instance) in instances.iter().enumerate() {
        // Producers always precede their consumers in the arena.
        levels[index] = instance
            .deps
            .iter()
            .map(|&dep| levels[dep] + 1)
            .max()
            .unwrap_or(0);
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, &level) in levels.iter().enumerate() {
        groups.entry(level).or_default().push(index);
    }

    groups
        .into_iter()
        .map(|(level, tasks)| ExecutionLevel { level, tasks })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::parse_pipeline;
    use crate::snapshot::SnapshotState;
    use std::time::SystemTime;

    fn snapshot(paths: &[&str]) -> SnapshotState {
        let mut state = SnapshotState::new();
        for path in paths {
            state.insert(*path, SystemTime::UNIX_EPOCH);
        }
        state
    }

    #[test]
    fn plans_a_single_conversion() {
        let pipeline = parse_pipeline(
            r#"
            [rule.convert]
            output = { result = "out/{n}.txt" }
            input = { source = "in/{n}.csv" }
            command = "convert {source} {result}"
            "#,
        )
        .unwrap();

        let fs = snapshot(&["in/a.csv"]);
        let plan = plan(&pipeline.rules, &["out/a.txt".to_string()], &fs).unwrap();

        assert_eq!(plan.instances.len(), 1);
        let task = &plan.instances[0];
        assert_eq!(task.rule, "convert");
        assert_eq!(task.command, "convert in/a.csv out/a.txt");
        assert_eq!(task.label(), "convert[n=a]");
        assert!(task.deps.is_empty());
    }

    #[test]
    fn missing_source_is_no_producer() {
        let pipeline = parse_pipeline(
            r#"
            [rule.convert]
            output = { result = "out/{n}.txt" }
            input = { source = "in/{n}.csv" }
            command = "convert {source} {result}"
            "#,
        )
        .unwrap();

        let fs = snapshot(&[]);
        let err = plan(&pipeline.rules, &["out/a.txt".to_string()], &fs).unwrap_err();

        match err {
            FlowError::NoProducer(path) => assert_eq!(path, PathBuf::from("in/a.csv")),
            other => panic!("expected NoProducer, got {}", other),
        }
    }

    #[test]
    fn existing_target_without_producer_is_a_source() {
        let fs = snapshot(&["data/raw.csv"]);
        let plan = plan(&[], &["data/raw.csv".to_string()], &fs).unwrap();
        assert!(plan.instances.is_empty());
        assert_eq!(plan.targets, vec![PathBuf::from("data/raw.csv")]);
    }

    #[test]
    fn shared_dependency_is_planned_once() {
        let pipeline = parse_pipeline(
            r#"
            [rule.prepare]
            output = { table = "mid/{n}.tsv" }
            input = { source = "in/{n}.csv" }
            command = "prepare {source} {table}"

            [rule.stats]
            output = { stats = "out/{n}.stats" }
            input = { table = "mid/{n}.tsv" }
            command = "stats {table} {stats}"

            [rule.render]
            output = { page = "out/{n}.html" }
            input = { table = "mid/{n}.tsv" }
            command = "render {table} {page}"
            "#,
        )
        .unwrap();

        let fs = snapshot(&["in/a.csv"]);
        let plan = plan(
            &pipeline.rules,
            &["out/a.stats".to_string(), "out/a.html".to_string()],
            &fs,
        )
        .unwrap();

        assert_eq!(plan.instances.len(), 3);
        let prepared: Vec<usize> = plan
            .instances
            .iter()
            .enumerate()
            .filter(|(_, t)| t.rule == "prepare")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(prepared.len(), 1);
        for task in plan.instances.iter().filter(|t| t.rule != "prepare") {
            assert_eq!(task.deps, prepared);
        }
    }

    #[test]
    fn cyclic_rules_are_detected() {
        let pipeline = parse_pipeline(
            r#"
            [rule.forward]
            output = { result = "x/{n}" }
            input = { source = "y/{n}" }
            command = "forward {source} {result}"

            [rule.backward]
            output = { result = "y/{n}" }
            input = { source = "x/{n}" }
            command = "backward {source} {result}"
            "#,
        )
        .unwrap();

        let fs = snapshot(&[]);
        let err = plan(&pipeline.rules, &["x/q".to_string()], &fs).unwrap_err();

        match err {
            FlowError::CyclicDependency(cycle) => {
                assert_eq!(cycle, vec!["x/q", "y/q", "x/q"]);
            }
            other => panic!("expected CyclicDependency, got {}", other),
        }
    }

    #[test]
    fn overlapping_wildcard_rules_are_ambiguous_at_plan_time() {
        let pipeline = parse_pipeline(
            r#"
            [rule.by_name]
            output = { result = "out/{n}.txt" }
            command = "by_name {result}"

            [rule.by_dir]
            output = { result = "{d}/a.txt" }
            command = "by_dir {result}"
            "#,
        )
        .unwrap();

        let fs = snapshot(&[]);
        let err = plan(&pipeline.rules, &["out/a.txt".to_string()], &fs).unwrap_err();

        match err {
            FlowError::AmbiguousTemplate { path, rules } => {
                assert_eq!(path, "out/a.txt");
                assert_eq!(rules.len(), 2);
            }
            other => panic!("expected AmbiguousTemplate, got {}", other),
        }
    }

    #[test]
    fn conflicting_bindings_within_one_rule_are_rejected() {
        // Both patterns match "out/x.a.txt", but they disagree on {n}
        // (n=x vs n=x.a), so there is no single task for the artifact.
        let pipeline = parse_pipeline(
            r#"
            [rule.split]
            output = { annotated = "out/{n}.a.txt", plain = "out/{n}.txt" }
            command = "split {annotated} {plain}"
            "#,
        )
        .unwrap();

        let fs = snapshot(&[]);
        let err = plan(&pipeline.rules, &["out/x.a.txt".to_string()], &fs).unwrap_err();

        match err {
            FlowError::AmbiguousBinding { path, rule, bindings } => {
                assert_eq!(path, "out/x.a.txt");
                assert_eq!(rule, "split");
                assert_eq!(bindings, vec!["n=x", "n=x.a"]);
            }
            other => panic!("expected AmbiguousBinding, got {}", other),
        }
    }

    #[test]
    fn levels_follow_the_dependency_chain() {
        let pipeline = parse_pipeline(
            r#"
            [rule.first]
            output = { result = "a/{n}" }
            input = { source = "raw/{n}" }
            command = "first {source} {result}"

            [rule.second]
            output = { result = "b/{n}" }
            input = { source = "a/{n}" }
            command = "second {source} {result}"

            [rule.third]
            output = { result = "c/{n}" }
            input = { source = "b/{n}" }
            command = "third {source} {result}"
            "#,
        )
        .unwrap();

        let fs = snapshot(&["raw/q"]);
        let plan = plan(&pipeline.rules, &["c/q".to_string()], &fs).unwrap();

        assert_eq!(plan.levels.len(), 3);
        for (expected, level) in plan.levels.iter().enumerate() {
            assert_eq!(level.level, expected);
            assert_eq!(level.tasks.len(), 1);
        }
        let order: Vec<&str> = plan
            .levels
            .iter()
            .flat_map(|l| l.tasks.iter().map(|&i| plan.instances[i].rule.as_str()))
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn params_substitute_but_do_not_add_edges() {
        let pipeline = parse_pipeline(
            r#"
            [rule.align]
            output = { bam = "results/{sample}.Aligned.out.bam" }
            input = { reads = "data/{sample}.fastq" }
            params = { prefix = "results/{sample}." }
            command = "align {reads} --prefix {prefix}"
            "#,
        )
        .unwrap();

        let fs = snapshot(&["data/s1.fastq"]);
        let plan = plan(
            &pipeline.rules,
            &["results/s1.Aligned.out.bam".to_string()],
            &fs,
        )
        .unwrap();

        let task = &plan.instances[0];
        assert_eq!(task.command, "align data/s1.fastq --prefix results/s1.");
        assert!(task.deps.is_empty());
    }
}
