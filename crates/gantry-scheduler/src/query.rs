//! Parsing of the discovery query output.
//!
//! The discovery job prints the `--output jsonproto` result of
//! `cquery 'kind(job, //...)'`: one result per rule and build configuration.
//! Each `job` rule is projected into a [`TargetDescriptor`].

use std::collections::HashSet;

use gantry_core::{Command, Error, JobDefinition, Result};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
struct QueryOutput {
    #[serde(default)]
    results: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    target: QueryTarget,
}

#[derive(Debug, Default, Deserialize)]
struct QueryTarget {
    #[serde(default)]
    rule: Option<Rule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Rule {
    name: String,
    #[serde(default)]
    attribute: Vec<Attribute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attribute {
    name: String,
    #[serde(default)]
    string_value: Option<String>,
    #[serde(default)]
    boolean_value: Option<bool>,
    #[serde(default)]
    string_list_value: Vec<String>,
}

impl Rule {
    fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attribute.iter().find(|a| a.name == name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.attr(name)
            .and_then(|a| a.string_value.clone())
            .filter(|s| !s.is_empty())
    }

    fn flag(&self, name: &str) -> bool {
        self.attr(name)
            .and_then(|a| a.boolean_value)
            .unwrap_or(false)
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.attr(name)
            .map(|a| a.string_list_value.clone())
            .unwrap_or_default()
    }
}

/// A build target declared by a `job` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    /// Label of the declaring rule.
    pub name: String,
    pub package: String,
    /// Full label of the target to run.
    pub target: String,
    pub command: Command,
    pub all_revision: bool,
    pub github_status: bool,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub exclusive: bool,
    pub config_name: Option<String>,
    pub schedule: Option<String>,
}

impl TargetDescriptor {
    pub fn reconcile_key(&self) -> String {
        format!("{}/{}", self.command, self.target)
    }

    /// Overwrite the mutable attributes of a stored definition.
    pub fn apply(&self, job: &mut JobDefinition) {
        job.all_revision = self.all_revision;
        job.github_status = self.github_status;
        job.cpu_limit = self.cpu_limit.clone();
        job.memory_limit = self.memory_limit.clone();
        job.exclusive = self.exclusive;
        job.config_name = self.config_name.clone();
        job.schedule = self.schedule.clone();
    }
}

/// Parse the query log into descriptors, keeping the first descriptor of
/// every `command/target` pair.
pub fn parse_query_output(raw: &str) -> Result<Vec<TargetDescriptor>> {
    let output: QueryOutput = serde_json::from_str(raw.trim())
        .map_err(|e| Error::MalformedInput(format!("discovery output: {}", e)))?;

    let mut seen = HashSet::new();
    let mut descriptors = Vec::new();
    for rule in output.results.into_iter().filter_map(|r| r.target.rule) {
        for descriptor in project(&rule) {
            if seen.insert(descriptor.reconcile_key()) {
                descriptors.push(descriptor);
            }
        }
    }
    Ok(descriptors)
}

fn project(rule: &Rule) -> Vec<TargetDescriptor> {
    let raw_command = rule.string("command").unwrap_or_default();
    let command: Command = match raw_command.parse() {
        Ok(command) => command,
        Err(_) => {
            warn!(rule = %rule.name, command = %raw_command, "skipping job with unknown command");
            return Vec::new();
        }
    };

    let targets = match rule.string("target") {
        Some(target) => vec![target],
        None => rule.list("targets"),
    };

    targets
        .into_iter()
        .map(|target| TargetDescriptor {
            name: rule.name.clone(),
            package: target
                .split_once(':')
                .map(|(package, _)| package.to_string())
                .unwrap_or_else(|| target.clone()),
            target,
            command,
            all_revision: rule.flag("all_revision"),
            github_status: rule.flag("github_status"),
            cpu_limit: rule.string("cpu_limit"),
            memory_limit: rule.string("memory_limit"),
            exclusive: rule.flag("exclusive"),
            config_name: rule.string("config_name"),
            schedule: rule.string("schedule"),
        })
        .collect()
}
