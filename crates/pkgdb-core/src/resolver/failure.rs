//! Resolution failure reporting

use crate::types::InstallId;
use std::fmt;

/// One descriptor that did not resolve in one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorFailure {
    pub install_id: InstallId,
    pub reason: String,
}

/// One input tried for a group, and the members it could not satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub input: String,
    pub url: String,
    pub revision: Option<String>,
    pub failures: Vec<DescriptorFailure>,
}

/// A group that no input could satisfy on one system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFailure {
    pub group: String,
    pub system: String,
    pub attempts: Vec<AttemptFailure>,
}

/// Every group that failed to resolve during one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionFailure {
    groups: Vec<GroupFailure>,
}

impl ResolutionFailure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, group: GroupFailure) {
        self.groups.push(group);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[GroupFailure] {
        &self.groups
    }

    /// Whether `install_id` failed anywhere
    pub fn contains(&self, install_id: &str) -> bool {
        self.groups.iter().any(|group| {
            group.attempts.iter().any(|attempt| {
                attempt
                    .failures
                    .iter()
                    .any(|failure| failure.install_id == install_id)
            })
        })
    }

    /// Generate a human-readable failure report
    pub fn report(&self) -> String {
        let mut report = String::from("Failed to resolve the following package groups:\n");

        for group in &self.groups {
            report.push_str(&format!(
                "  group '{}' on '{}':\n",
                group.group, group.system
            ));
            if group.attempts.is_empty() {
                report.push_str("    no registry inputs could be searched\n");
            }
            for attempt in &group.attempts {
                report.push_str(&format!("    in input '{}' ({}", attempt.input, attempt.url));
                if let Some(rev) = &attempt.revision {
                    report.push_str(&format!(", revision {}", rev));
                }
                report.push_str("):\n");
                for failure in &attempt.failures {
                    report.push_str(&format!(
                        "      '{}': {}\n",
                        failure.install_id, failure.reason
                    ));
                }
            }
        }

        report
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.report().trim_end())
    }
}

impl std::error::Error for ResolutionFailure {}
