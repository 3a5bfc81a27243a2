use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default policy bundled with the binary, used when `--policy` is absent.
const DEFAULT_POLICY: &str = include_str!("../assets/policy-fips-140-2-l1.yaml");

/// Errors raised while loading or compiling a policy. Fatal at startup.
#[derive(Debug, Error)]
pub(crate) enum PolicyLoadError {
    #[error("failed to read policy {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("rule '{rule_id}' has invalid regex '{pattern}': {source}")]
    InvalidRegex {
        rule_id: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Allow/deny lists for one dimension of a rule (algorithms or providers).
/// `None` and an empty list are distinct: an empty `allow` permits nothing.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MatchSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) allow: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) deny: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) allow_regex: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) deny_regex: Option<Vec<String>>,
}

impl MatchSet {
    /// Uppercase literals and make regexes case-insensitive by prefixing
    /// `(?i)`. Idempotent: an already-prefixed pattern is left alone.
    fn normalized(self) -> Self {
        Self {
            allow: self.allow.map(upper_all),
            deny: self.deny.map(upper_all),
            allow_regex: self.allow_regex.map(case_insensitive_all),
            deny_regex: self.deny_regex.map(case_insensitive_all),
        }
    }
}

fn upper_all(values: Vec<String>) -> Vec<String> {
    values.into_iter().map(|s| s.to_uppercase()).collect()
}

fn case_insensitive_all(patterns: Vec<String>) -> Vec<String> {
    patterns
        .into_iter()
        .map(|pattern| {
            if pattern.starts_with("(?i)") {
                pattern
            } else {
                format!("(?i){pattern}")
            }
        })
        .collect()
}

/// One allow/deny rule for a single API.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
    /// Fully qualified `"<class>.<method>"`, matched exactly against
    /// `Finding.api`.
    pub(crate) api: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) algorithms: Option<MatchSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) providers: Option<MatchSet>,
}

/// Declarative set of rules constraining algorithms and providers per API.
/// Rule evaluation order equals document order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Policy {
    pub(crate) policy_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<String>,
    pub(crate) rules: Vec<Rule>,
}

impl Policy {
    /// Normalize every rule's match sets. Idempotent.
    pub(crate) fn normalized(mut self) -> Self {
        for rule in &mut self.rules {
            rule.algorithms = rule.algorithms.take().map(MatchSet::normalized);
            rule.providers = rule.providers.take().map(MatchSet::normalized);
        }
        self
    }
}

/// Match set with its regex lists compiled, ready for evaluation.
#[derive(Clone, Debug)]
pub(crate) struct CompiledMatchSet {
    pub(crate) allow: Option<Vec<String>>,
    pub(crate) deny: Option<Vec<String>>,
    pub(crate) allow_regex: Option<Vec<Regex>>,
    pub(crate) deny_regex: Option<Vec<Regex>>,
}

/// Rule with compiled regexes, produced once at startup.
#[derive(Clone, Debug)]
pub(crate) struct CompiledRule {
    pub(crate) id: Option<String>,
    pub(crate) api: String,
    pub(crate) algorithms: Option<CompiledMatchSet>,
    pub(crate) providers: Option<CompiledMatchSet>,
}

impl CompiledRule {
    /// Rule id for analysis results; rules without an id report as "RULE".
    pub(crate) fn id_or_default(&self) -> &str {
        self.id.as_deref().unwrap_or("RULE")
    }
}

/// Compile every rule of a normalized policy. A malformed regex is fatal
/// and reported with the offending pattern.
pub(crate) fn compile_rules(policy: &Policy) -> Result<Vec<CompiledRule>, PolicyLoadError> {
    let mut compiled = Vec::with_capacity(policy.rules.len());
    for rule in &policy.rules {
        let rule_id = rule.id.clone().unwrap_or_else(|| "RULE".to_string());
        compiled.push(CompiledRule {
            id: rule.id.clone(),
            api: rule.api.clone(),
            algorithms: compile_match_set(rule.algorithms.as_ref(), &rule_id)?,
            providers: compile_match_set(rule.providers.as_ref(), &rule_id)?,
        });
    }
    Ok(compiled)
}

fn compile_match_set(
    set: Option<&MatchSet>,
    rule_id: &str,
) -> Result<Option<CompiledMatchSet>, PolicyLoadError> {
    let Some(set) = set else {
        return Ok(None);
    };
    Ok(Some(CompiledMatchSet {
        allow: set.allow.clone(),
        deny: set.deny.clone(),
        allow_regex: compile_patterns(set.allow_regex.as_ref(), rule_id)?,
        deny_regex: compile_patterns(set.deny_regex.as_ref(), rule_id)?,
    }))
}

fn compile_patterns(
    patterns: Option<&Vec<String>>,
    rule_id: &str,
) -> Result<Option<Vec<Regex>>, PolicyLoadError> {
    let Some(patterns) = patterns else {
        return Ok(None);
    };
    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        // Patterns must match the whole algorithm or provider name, not a
        // substring, so wrap each one in an anchored non-capturing group.
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).map_err(|source| PolicyLoadError::InvalidRegex {
            rule_id: rule_id.to_string(),
            pattern: pattern.clone(),
            source,
        })?;
        compiled.push(regex);
    }
    Ok(Some(compiled))
}

/// Load, normalize, and regex-validate a policy from a YAML file.
pub(crate) fn load_policy(path: &Path) -> Result<Policy, PolicyLoadError> {
    let text = fs::read_to_string(path).map_err(|source| PolicyLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let policy: Policy = serde_yaml::from_str(&text).map_err(|source| PolicyLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let policy = policy.normalized();
    compile_rules(&policy)?;
    Ok(policy)
}

/// Load the bundled default policy.
pub(crate) fn load_default_policy() -> Result<Policy, PolicyLoadError> {
    let policy: Policy =
        serde_yaml::from_str(DEFAULT_POLICY).map_err(|source| PolicyLoadError::Parse {
            path: PathBuf::from("policy-fips-140-2-l1.yaml"),
            source,
        })?;
    let policy = policy.normalized();
    compile_rules(&policy)?;
    Ok(policy)
}
