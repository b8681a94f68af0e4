use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Kinds of remediation work a hosting integration may hand to a session.
/// Reserved here so integrations and the core agree on the labels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    MergeConflicts,
    FailingChecks,
    UnresolvedComments,
    OpenIssue,
}

/// Opaque label for a code-hosting provider (github, gitlab, azure_devops,
/// ...). The core never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ProviderType(pub String);

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
