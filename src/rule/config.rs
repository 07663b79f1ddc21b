use std::collections::{HashMap, HashSet};
use std::fs;

use serde::Deserialize;

use super::{IoEntry, Pipeline, Rule};
use crate::error::{FlowError, Result};
use crate::output::OutputMode;
use crate::pattern::{self, Binding, Pattern};

#[derive(Debug, Deserialize)]
struct PipelineToml {
    #[serde(rename = "rule")]
    rules: HashMap<String, RuleToml>,
    config: Option<ConfigSection>,
    #[serde(default)]
    lists: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ConfigSection {
    #[serde(default)]
    default: Vec<PathSpec>,
    workers: Option<usize>,
    default_timeout: Option<String>,
    output: Option<OutputMode>,
}

#[derive(Debug, Deserialize)]
struct RuleToml {
    #[serde(default)]
    input: HashMap<String, PathSpec>,
    #[serde(default)]
    output: HashMap<String, PathSpec>,
    #[serde(default)]
    params: HashMap<String, String>,
    command: String,
    stdout: Option<String>,
    timeout: Option<String>,
}

/// A path declaration: either a single pattern or a cross-product expansion
/// of a pattern over named value lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    Pattern(String),
    Expand(ExpandSpec),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpandSpec {
    pub expand: String,
    #[serde(flatten)]
    pub over: HashMap<String, ListRef>,
}

/// A value list for expansion: the name of a `[lists]` entry or an inline
/// array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ListRef {
    Inline(Vec<String>),
    Named(String),
}

pub fn load_pipeline(path: &str) -> Result<Pipeline> {
    let contents = fs::read_to_string(path)?;
    parse_pipeline(&contents)
}

pub fn parse_pipeline(contents: &str) -> Result<Pipeline> {
    let parsed: PipelineToml = toml::from_str(contents)?;
    process_pipeline(parsed)
}

fn process_pipeline(parsed: PipelineToml) -> Result<Pipeline> {
    let lists = parsed.lists;

    let default_targets = match &parsed.config {
        Some(section) => desugar_targets(&section.default, &lists)?,
        None => Vec::new(),
    };
    let workers = parsed.config.as_ref().and_then(|c| c.workers);
    let default_timeout = parsed
        .config
        .as_ref()
        .and_then(|c| c.default_timeout.clone());
    let output = parsed.config.as_ref().and_then(|c| c.output.clone());

    // HashMap iteration order is arbitrary; registration order is the sorted
    // rule name order so validation reports are deterministic.
    let mut names: Vec<String> = parsed.rules.keys().cloned().collect();
    names.sort();

    let mut rules = Vec::with_capacity(names.len());
    for name in names {
        let raw = &parsed.rules[&name];
        rules.push(Rule {
            name: name.clone(),
            inputs: build_entries(&raw.input, &lists)?,
            outputs: build_entries(&raw.output, &lists)?,
            params: build_params(&raw.params)?,
            command: raw.command.clone(),
            stdout: raw.stdout.clone(),
            timeout: raw.timeout.clone(),
        });
    }

    validate_rules(&rules)?;

    Ok(Pipeline {
        rules,
        default_targets,
        workers,
        default_timeout,
        output,
    })
}

fn desugar_targets(
    specs: &[PathSpec],
    lists: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let mut targets = Vec::new();
    for spec in specs {
        for path in desugar(spec, lists)? {
            if !Pattern::compile(&path)?.is_concrete() {
                return Err(FlowError::Config(format!(
                    "default target '{}' contains unbound wildcards",
                    path
                )));
            }
            targets.push(path);
        }
    }
    Ok(targets)
}

fn build_entries(
    specs: &HashMap<String, PathSpec>,
    lists: &HashMap<String, Vec<String>>,
) -> Result<Vec<IoEntry>> {
    let mut names: Vec<&String> = specs.keys().collect();
    names.sort();

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let raw_paths = desugar(&specs[name], lists)?;
        let mut paths = Vec::with_capacity(raw_paths.len());
        for raw in &raw_paths {
            paths.push(Pattern::compile(raw)?);
        }
        entries.push(IoEntry {
            name: name.clone(),
            paths,
        });
    }
    Ok(entries)
}

fn build_params(params: &HashMap<String, String>) -> Result<Vec<(String, Pattern)>> {
    let mut names: Vec<&String> = params.keys().collect();
    names.sort();

    let mut built = Vec::with_capacity(names.len());
    for name in names {
        built.push((name.clone(), Pattern::compile(&params[name])?));
    }
    Ok(built)
}

fn desugar(spec: &PathSpec, lists: &HashMap<String, Vec<String>>) -> Result<Vec<String>> {
    match spec {
        PathSpec::Pattern(path) => Ok(vec![path.clone()]),
        PathSpec::Expand(expand) => expand_paths(&expand.expand, &expand.over, lists),
    }
}

/// Expands a pattern over one or more value lists, yielding the ordered
/// cross-product of concrete paths. The wildcard appearing first in the
/// pattern varies fastest, so `results/{a}_{b}` over `a = [x, y]`,
/// `b = [1, 2]` yields `x_1, y_1, x_2, y_2`. Wildcards not covered by a
/// list are left in place for later binding.
pub fn expand_paths(
    pattern: &str,
    over: &HashMap<String, ListRef>,
    lists: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let compiled = Pattern::compile(pattern)?;

    let order: Vec<&str> = compiled
        .wildcards()
        .into_iter()
        .filter(|w| over.contains_key(*w))
        .collect();

    for key in over.keys() {
        if !order.contains(&key.as_str()) {
            return Err(FlowError::Config(format!(
                "expansion list '{}' does not match any wildcard in '{}'",
                key, pattern
            )));
        }
    }

    let mut values: Vec<(&str, &[String])> = Vec::with_capacity(order.len());
    for name in &order {
        let resolved: &[String] = match &over[*name] {
            ListRef::Inline(items) => items,
            ListRef::Named(list_name) => lists
                .get(list_name)
                .map(Vec::as_slice)
                .ok_or_else(|| {
                    FlowError::Config(format!(
                        "expansion references unknown list '{}'",
                        list_name
                    ))
                })?,
        };
        values.push((name, resolved));
    }

    let total: usize = values.iter().map(|(_, list)| list.len()).product();
    let mut paths = Vec::with_capacity(total);
    for i in 0..total {
        let mut remainder = i;
        let mut binding = Binding::new();
        for (name, list) in &values {
            let index = remainder % list.len();
            remainder /= list.len();
            binding.insert((*name).to_string(), list[index].clone());
        }
        paths.push(compiled.substitute_partial(&binding));
    }

    Ok(paths)
}

fn validate_rules(rules: &[Rule]) -> Result<()> {
    for rule in rules {
        validate_rule(rule)?;
    }

    // No two rules may claim the same declared output artifact. Concrete
    // outputs are checked against every other rule's patterns eagerly;
    // overlaps only reachable through wildcards surface at plan time.
    for (i, rule) in rules.iter().enumerate() {
        for entry in &rule.outputs {
            for output in &entry.paths {
                for (j, other) in rules.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    for other_entry in &other.outputs {
                        for other_output in &other_entry.paths {
                            let identical = i < j && output.raw() == other_output.raw();
                            let claimed = output.is_concrete()
                                && other_output.matches(output.raw()).is_some();
                            if identical || claimed {
                                return Err(FlowError::AmbiguousTemplate {
                                    path: output.raw().to_string(),
                                    rules: vec![rule.name.clone(), other.name.clone()],
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn validate_rule(rule: &Rule) -> Result<()> {
    let output_patterns: Vec<&Pattern> =
        rule.outputs.iter().flat_map(|e| e.paths.iter()).collect();
    if output_patterns.is_empty() {
        return Err(FlowError::Config(format!(
            "rule '{}' declares no outputs",
            rule.name
        )));
    }

    // The binding for an instance comes from whichever output matched the
    // requested path, so every output pattern must bind the same wildcards
    // and inputs/params may only use wildcards the outputs bind.
    let bound: HashSet<&str> = output_patterns[0].wildcards().into_iter().collect();
    for output in &output_patterns[1..] {
        let other: HashSet<&str> = output.wildcards().into_iter().collect();
        if other != bound {
            return Err(FlowError::Config(format!(
                "rule '{}': output patterns bind different wildcard sets",
                rule.name
            )));
        }
    }
    for entry in &rule.inputs {
        for input in &entry.paths {
            for wildcard in input.wildcards() {
                if !bound.contains(wildcard) {
                    return Err(FlowError::Config(format!(
                        "rule '{}': wildcard '{{{}}}' in input '{}' is not bound by the rule's outputs",
                        rule.name, wildcard, entry.name
                    )));
                }
            }
        }
    }
    for (name, param) in &rule.params {
        for wildcard in param.wildcards() {
            if !bound.contains(wildcard) {
                return Err(FlowError::Config(format!(
                    "rule '{}': wildcard '{{{}}}' in param '{}' is not bound by the rule's outputs",
                    rule.name, wildcard, name
                )));
            }
        }
    }

    let names: HashSet<&str> = rule
        .inputs
        .iter()
        .map(|e| e.name.as_str())
        .chain(rule.outputs.iter().map(|e| e.name.as_str()))
        .chain(rule.params.iter().map(|(n, _)| n.as_str()))
        .collect();
    for placeholder in pattern::placeholders(&rule.command) {
        if !names.contains(placeholder.as_str()) {
            return Err(FlowError::Config(format!(
                "rule '{}': command placeholder '{{{}}}' does not name an input, output, or param",
                rule.name, placeholder
            )));
        }
    }

    if let Some(key) = &rule.stdout {
        match rule.outputs.iter().find(|e| &e.name == key) {
            None => {
                return Err(FlowError::Config(format!(
                    "rule '{}': stdout target '{}' is not a declared output",
                    rule.name, key
                )));
            }
            Some(entry) if entry.paths.len() != 1 => {
                return Err(FlowError::Config(format!(
                    "rule '{}': stdout target '{}' must be a single path",
                    rule.name, key
                )));
            }
            Some(_) => {}
        }
    }

    Ok(())
}
