//! Resolves namespace selection rules against the namespace catalog.
//!
//! A namespace is a target when it satisfies at least one match rule and no
//! avoid rule. The controller's own namespace and terminating namespaces are
//! never targets, whatever the rules say.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::{
    api::core::v1::Namespace,
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
};
use kube::ResourceExt;
use regex::Regex;

use crate::{
    crds::NamespaceRule,
    error::{Error, Result},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespacePhase {
    Active,
    Terminating,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceEntry {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub phase: NamespacePhase,
}

impl NamespaceEntry {
    pub fn active(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            labels: BTreeMap::new(),
            phase: NamespacePhase::Active,
        }
    }

    pub fn with_labels<'a>(mut self, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        self.labels = labels
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        self
    }

    pub fn is_terminating(&self) -> bool {
        self.phase == NamespacePhase::Terminating
    }
}

impl From<&Namespace> for NamespaceEntry {
    fn from(ns: &Namespace) -> Self {
        let terminating = ns.metadata.deletion_timestamp.is_some()
            || ns
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|p| p == "Terminating");

        Self {
            name: ns.name_any(),
            labels: ns.labels().clone(),
            phase: if terminating {
                NamespacePhase::Terminating
            } else {
                NamespacePhase::Active
            },
        }
    }
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
    Selector(Vec<Requirement>),
}

#[derive(Debug)]
enum Requirement {
    Equals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::In(k, values) => labels.get(k).is_some_and(|v| values.contains(v)),
            // Kubernetes semantics: a missing key satisfies NotIn.
            Requirement::NotIn(k, values) => labels.get(k).is_none_or(|v| !values.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl Matcher {
    fn compile(rule: &NamespaceRule) -> Result<Self> {
        match rule {
            NamespaceRule::Exact(name) => {
                if name.is_empty() {
                    return Err(Error::InvalidRule("exact rule with empty name".to_owned()));
                }
                Ok(Matcher::Exact(name.clone()))
            }
            NamespaceRule::Glob(pattern) => {
                if pattern.is_empty() {
                    return Err(Error::InvalidRule("empty glob pattern".to_owned()));
                }
                Ok(Matcher::Pattern(glob_to_regex(pattern)?))
            }
            NamespaceRule::Regex(pattern) => {
                if pattern.is_empty() {
                    return Err(Error::InvalidRule("empty regex pattern".to_owned()));
                }
                Regex::new(&format!("^(?:{pattern})$"))
                    .map(Matcher::Pattern)
                    .map_err(|e| Error::InvalidRule(format!("regex '{pattern}': {e}")))
            }
            NamespaceRule::LabelSelector(selector) => {
                compile_selector(selector).map(Matcher::Selector)
            }
        }
    }

    fn matches(&self, ns: &NamespaceEntry) -> bool {
        match self {
            Matcher::Exact(name) => &ns.name == name,
            Matcher::Pattern(re) => re.is_match(&ns.name),
            Matcher::Selector(reqs) => reqs.iter().all(|r| r.matches(&ns.labels)),
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::InvalidRule(format!("glob '{pattern}': {e}")))
}

fn compile_selector(selector: &LabelSelector) -> Result<Vec<Requirement>> {
    let mut reqs: Vec<Requirement> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| Requirement::Equals(k.clone(), v.clone()))
        .collect();

    for expr in selector.match_expressions.iter().flatten() {
        reqs.push(compile_requirement(expr)?);
    }

    Ok(reqs)
}

fn compile_requirement(expr: &LabelSelectorRequirement) -> Result<Requirement> {
    let key = expr.key.clone();
    let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();

    match expr.operator.as_str() {
        "In" | "NotIn" if values.is_empty() => Err(Error::InvalidRule(format!(
            "operator {} on '{key}' requires values",
            expr.operator
        ))),
        "In" => Ok(Requirement::In(key, values)),
        "NotIn" => Ok(Requirement::NotIn(key, values)),
        "Exists" | "DoesNotExist" if !values.is_empty() => Err(Error::InvalidRule(format!(
            "operator {} on '{key}' takes no values",
            expr.operator
        ))),
        "Exists" => Ok(Requirement::Exists(key)),
        "DoesNotExist" => Ok(Requirement::DoesNotExist(key)),
        op => Err(Error::InvalidRule(format!(
            "unknown label selector operator '{op}'"
        ))),
    }
}

/// Match and avoid rules compiled once per reconcile.
#[derive(Debug)]
pub struct RuleSet {
    matchers: Vec<Matcher>,
    avoiders: Vec<Matcher>,
}

impl RuleSet {
    pub fn compile(match_rules: &[NamespaceRule], avoid_rules: &[NamespaceRule]) -> Result<Self> {
        if match_rules.is_empty() {
            return Err(Error::InvalidRule(
                "matchNamespaces is empty, use {glob: \"*\"} to target every namespace".to_owned(),
            ));
        }

        Ok(Self {
            matchers: match_rules.iter().map(Matcher::compile).collect::<Result<_>>()?,
            avoiders: avoid_rules.iter().map(Matcher::compile).collect::<Result<_>>()?,
        })
    }

    /// Whether `ns` is a target, ignoring the controller namespace exclusion.
    pub fn selects(&self, ns: &NamespaceEntry) -> bool {
        !ns.is_terminating()
            && self.matchers.iter().any(|m| m.matches(ns))
            && !self.avoiders.iter().any(|m| m.matches(ns))
    }

    pub fn resolve<'a>(
        &self,
        catalog: impl IntoIterator<Item = &'a NamespaceEntry>,
        controller_namespace: &str,
    ) -> BTreeSet<String> {
        catalog
            .into_iter()
            .filter(|ns| ns.name != controller_namespace && self.selects(ns))
            .map(|ns| ns.name.clone())
            .collect()
    }
}

pub fn resolve<'a>(
    match_rules: &[NamespaceRule],
    avoid_rules: &[NamespaceRule],
    catalog: impl IntoIterator<Item = &'a NamespaceEntry>,
    controller_namespace: &str,
) -> Result<BTreeSet<String>> {
    Ok(RuleSet::compile(match_rules, avoid_rules)?.resolve(catalog, controller_namespace))
}
