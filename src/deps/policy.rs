use std::path::Path;

use serde::Deserialize;

use crate::deps::resolver::Artifact;
use crate::deps::uri::DependencyUri;
use crate::error::Result;

/// Payload subdirectory holding system files such as the policy document.
pub const SYSTEM_DIR_NAME: &str = ".concord";
pub const POLICY_FILE_NAME: &str = "policy.json";

/// Root of the policy document found in a job's payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyRules {
    #[serde(default)]
    pub dependency: DependencyPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependencyPolicy {
    #[serde(default)]
    pub allow: Vec<DependencyRule>,
    #[serde(default)]
    pub warn: Vec<DependencyRule>,
    #[serde(default)]
    pub deny: Vec<DependencyRule>,
}

/// One dependency rule. Absent fields match anything, `*` matches
/// anything, a trailing `*` matches a prefix. A rule with no fields at all
/// matches nothing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRule {
    pub msg: Option<String>,
    pub scheme: Option<String>,
    pub group_id: Option<String>,
    pub artifact_id: Option<String>,
    pub version: Option<String>,
}

impl DependencyRule {
    fn matches(&self, artifact: &Artifact) -> bool {
        if self.scheme.is_none()
            && self.group_id.is_none()
            && self.artifact_id.is_none()
            && self.version.is_none()
        {
            return false;
        }

        if let Some(scheme) = &self.scheme {
            if !pattern_matches(scheme, artifact.uri.scheme()) {
                return false;
            }
        }

        if self.group_id.is_none() && self.artifact_id.is_none() && self.version.is_none() {
            return true;
        }

        let Some((group, artifact_id, version)) = maven_coordinates(&artifact.uri) else {
            return false;
        };
        for (pattern, value) in [
            (&self.group_id, group),
            (&self.artifact_id, artifact_id),
            (&self.version, version),
        ] {
            if let Some(pattern) = pattern {
                if !pattern_matches(pattern, value) {
                    return false;
                }
            }
        }
        true
    }
}

impl std::fmt::Display for DependencyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(msg) = &self.msg {
            return f.write_str(msg);
        }
        write!(
            f,
            "{{{}:{}:{}}}",
            self.group_id.as_deref().unwrap_or("*"),
            self.artifact_id.as_deref().unwrap_or("*"),
            self.version.as_deref().unwrap_or("*"),
        )
    }
}

/// Result of checking a set of artifacts against the rules.
#[derive(Debug, Default)]
pub struct CheckResult {
    pub warn: Vec<Violation>,
    pub deny: Vec<Violation>,
}

#[derive(Debug, Clone)]
pub struct Violation {
    pub artifact: Artifact,
    pub rule: DependencyRule,
}

impl PolicyRules {
    /// Classify each artifact: an allow match wins outright, then the first
    /// deny match, then the first warn match.
    pub fn check(&self, artifacts: &[Artifact]) -> CheckResult {
        let mut result = CheckResult::default();
        for artifact in artifacts {
            if self.dependency.allow.iter().any(|r| r.matches(artifact)) {
                continue;
            }
            if let Some(rule) = self.dependency.deny.iter().find(|r| r.matches(artifact)) {
                result.deny.push(Violation {
                    artifact: artifact.clone(),
                    rule: rule.clone(),
                });
                continue;
            }
            if let Some(rule) = self.dependency.warn.iter().find(|r| r.matches(artifact)) {
                result.warn.push(Violation {
                    artifact: artifact.clone(),
                    rule: rule.clone(),
                });
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.dependency.allow.is_empty()
            && self.dependency.warn.is_empty()
            && self.dependency.deny.is_empty()
    }
}

/// Load the payload's policy rules, if any.
pub fn load(payload_dir: &Path) -> Result<Option<PolicyRules>> {
    let path = payload_dir.join(SYSTEM_DIR_NAME).join(POLICY_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let rules: PolicyRules = serde_json::from_str(&text)?;
    Ok(Some(rules))
}

fn maven_coordinates(uri: &DependencyUri) -> Option<(&str, &str, &str)> {
    let DependencyUri::Maven(s) = uri else {
        return None;
    };
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 4 {
        return None;
    }
    Some((parts[1], parts[2], parts[parts.len() - 1]))
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern == value
}
