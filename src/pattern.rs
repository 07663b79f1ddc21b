//! Wildcard path patterns.
//!
//! A pattern is a path string with `{name}` placeholders. Matching a concrete
//! path against a pattern yields a binding from wildcard names to the matched
//! substrings; substituting a binding back into the pattern reproduces the
//! path byte-for-byte. Each wildcard matches greedily as a single opaque
//! token, so `{unit}_fastqc.html` captures a composite identifier like
//! `tumor_rep1_R1` without splitting it.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::error::{FlowError, Result};

/// Wildcard name to concrete value, ordered for deterministic display.
pub type Binding = BTreeMap<String, String>;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Wildcard(String),
}

#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
    regex: Regex,
}

impl Pattern {
    pub fn compile(raw: &str) -> Result<Pattern> {
        let segments = parse_segments(raw)?;

        let mut source = String::from("^");
        let mut group = 0usize;
        for segment in &segments {
            match segment {
                Segment::Literal(text) => source.push_str(&regex::escape(text)),
                Segment::Wildcard(_) => {
                    // Occurrences get positional group names so a wildcard
                    // repeated within one pattern stays expressible.
                    source.push_str(&format!("(?P<w{}>.+)", group));
                    group += 1;
                }
            }
        }
        source.push('$');

        let regex = Regex::new(&source)
            .map_err(|e| FlowError::Pattern(format!("pattern '{}': {}", raw, e)))?;

        Ok(Pattern {
            raw: raw.to_string(),
            segments,
            regex,
        })
    }

    /// Matches a concrete path, returning the wildcard binding on success.
    /// A wildcard repeated in the pattern must capture the same value in
    /// every position or the match is rejected.
    pub fn matches(&self, path: &str) -> Option<Binding> {
        let caps = self.regex.captures(path)?;

        let mut binding = Binding::new();
        let mut group = 0usize;
        for segment in &self.segments {
            if let Segment::Wildcard(name) = segment {
                let value = caps.name(&format!("w{}", group))?.as_str();
                group += 1;
                match binding.get(name) {
                    Some(previous) if previous != value => return None,
                    Some(_) => {}
                    None => {
                        binding.insert(name.clone(), value.to_string());
                    }
                }
            }
        }

        Some(binding)
    }

    /// Substitutes a binding into the pattern. Every wildcard must be bound.
    pub fn substitute(&self, binding: &Binding) -> Result<String> {
        let mut result = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => result.push_str(text),
                Segment::Wildcard(name) => match binding.get(name) {
                    Some(value) => result.push_str(value),
                    None => {
                        return Err(FlowError::Pattern(format!(
                            "wildcard '{{{}}}' in '{}' is unbound",
                            name, self.raw
                        )));
                    }
                },
            }
        }
        Ok(result)
    }

    /// Like [`substitute`](Self::substitute) but leaves unbound wildcards in
    /// place, used when expansions fix only some of a pattern's wildcards.
    pub fn substitute_partial(&self, binding: &Binding) -> String {
        let mut result = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => result.push_str(text),
                Segment::Wildcard(name) => match binding.get(name) {
                    Some(value) => result.push_str(value),
                    None => {
                        result.push('{');
                        result.push_str(name);
                        result.push('}');
                    }
                },
            }
        }
        result
    }

    /// Wildcard names in order of first appearance, without duplicates.
    pub fn wildcards(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Wildcard(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn is_concrete(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn parse_segments(raw: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(FlowError::Pattern(format!(
                        "unclosed '{{' in pattern '{}'",
                        raw
                    )));
                }
                if !is_valid_name(&name) {
                    return Err(FlowError::Pattern(format!(
                        "invalid wildcard name '{}' in pattern '{}'",
                        name, raw
                    )));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Wildcard(name));
            }
            '}' => {
                return Err(FlowError::Pattern(format!(
                    "unmatched '}}' in pattern '{}'",
                    raw
                )));
            }
            _ => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Placeholder names referenced by a command template, in order of
/// appearance, duplicates included.
pub fn placeholders(text: &str) -> Vec<String> {
    let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    placeholder
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Renders a command template, replacing `{name}` placeholders with their
/// values. Unknown placeholders are left untouched; registration validation
/// rejects them before a command can reach execution.
pub fn render(text: &str, values: &BTreeMap<String, String>) -> String {
    let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    placeholder
        .replace_all(text, |caps: &regex::Captures| {
            values
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string()
}
