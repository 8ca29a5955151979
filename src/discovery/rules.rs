use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Container;
use crate::tracker::parse_image;

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Rule for {domain}/{service} is already registered")]
    Duplicate { domain: String, service: String },
}

fn compile(pattern: &str) -> Result<Regex, MatchError> {
    Regex::new(pattern).map_err(|source| MatchError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSpec {
    pub repository: String,
    #[serde(default)]
    pub tag: Option<String>,
}

impl ImageSpec {
    fn matches(&self, image: &str) -> bool {
        match &self.tag {
            Some(tag) => image
                .strip_prefix(self.repository.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .is_some_and(|rest| rest == tag),
            None => image.starts_with(&self.repository),
        }
    }
}

/// A conjunction of optional predicates. Patterns are unanchored regexes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleUnion {
    /// Label key to pattern for its value.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Patterns matched against `KEY=VALUE` pairs.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchContainerRule {
    pub image: ImageSpec,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub match_all: Vec<RuleUnion>,
    #[serde(default)]
    pub match_first: Vec<RuleUnion>,
}

/// What to watch for one service: a match rule, optionally restricted to
/// image tags matching `qualify_tag`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchContainerSpec {
    #[serde(default)]
    pub qualify_tag: Option<String>,
    #[serde(flatten)]
    pub rule: MatchContainerRule,
}

#[derive(Debug)]
struct CompiledUnion {
    labels: Vec<(String, Regex)>,
    env: Vec<Regex>,
    name: Option<Regex>,
}

impl CompiledUnion {
    fn new(union: &RuleUnion) -> Result<Self, MatchError> {
        let mut labels = union
            .labels
            .iter()
            .map(|(key, pattern)| Ok((key.clone(), compile(pattern)?)))
            .collect::<Result<Vec<_>, MatchError>>()?;
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            labels,
            env: union
                .env
                .iter()
                .map(|p| compile(p))
                .collect::<Result<_, _>>()?,
            name: union.name.as_deref().map(compile).transpose()?,
        })
    }

    /// Every label predicate must hold: the number of satisfied predicates is
    /// compared with the number of predicates, independent of map order.
    fn labels_match(&self, container: &Container) -> bool {
        let matched = self
            .labels
            .iter()
            .filter(|(key, pattern)| {
                container
                    .labels
                    .get(key)
                    .is_some_and(|value| pattern.is_match(value))
            })
            .count();
        matched == self.labels.len()
    }

    /// Every predicate needs an environment entry of its own. Entries are
    /// assigned with augmenting paths so the outcome does not depend on the
    /// order of either list.
    fn env_matches(&self, container: &Container) -> bool {
        let candidates: Vec<Vec<usize>> = self
            .env
            .iter()
            .map(|pattern| {
                container
                    .env
                    .iter()
                    .enumerate()
                    .filter(|(_, pair)| pattern.is_match(pair))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();

        let mut owner: Vec<Option<usize>> = vec![None; container.env.len()];
        (0..candidates.len()).all(|predicate| {
            let mut seen = vec![false; container.env.len()];
            assign_entry(predicate, &candidates, &mut owner, &mut seen)
        })
    }

    fn name_matches(&self, container: &Container) -> bool {
        self.name
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(&container.name))
    }

    fn matches(&self, container: &Container) -> bool {
        self.labels_match(container) && self.env_matches(container) && self.name_matches(container)
    }
}

#[derive(Debug)]
pub struct CompiledRule {
    image: ImageSpec,
    port: Option<u16>,
    qualify_tag: Option<Regex>,
    match_all: Vec<CompiledUnion>,
    match_first: Vec<CompiledUnion>,
}

impl CompiledRule {
    pub fn new(spec: &WatchContainerSpec) -> Result<Self, MatchError> {
        let rule = &spec.rule;
        Ok(Self {
            image: rule.image.clone(),
            port: rule.port,
            qualify_tag: spec.qualify_tag.as_deref().map(compile).transpose()?,
            match_all: rule
                .match_all
                .iter()
                .map(CompiledUnion::new)
                .collect::<Result<_, _>>()?,
            match_first: rule
                .match_first
                .iter()
                .map(CompiledUnion::new)
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn matches(&self, container: &Container) -> bool {
        if !self.image.matches(&container.image) {
            return false;
        }
        if let Some(qualify) = &self.qualify_tag {
            let (_, tag) = parse_image(&container.image);
            if !qualify.is_match(tag) {
                return false;
            }
        }
        // Ports of a stopped container cannot be verified
        if let Some(port) = self.port {
            if container.running && !container.exposes(port) {
                return false;
            }
        }
        if self.match_all.is_empty() && self.match_first.is_empty() {
            return true;
        }
        self.match_all.iter().all(|u| u.matches(container))
            && (self.match_first.is_empty() || self.match_first.iter().any(|u| u.matches(container)))
    }
}

/// Finds an entry for `predicate`, moving earlier assignments when needed.
fn assign_entry(
    predicate: usize,
    candidates: &[Vec<usize>],
    owner: &mut [Option<usize>],
    seen: &mut [bool],
) -> bool {
    for &entry in &candidates[predicate] {
        if seen[entry] {
            continue;
        }
        seen[entry] = true;
        let free = match owner[entry] {
            None => true,
            Some(other) => assign_entry(other, candidates, owner, seen),
        };
        if free {
            owner[entry] = Some(predicate);
            return true;
        }
    }
    false
}
