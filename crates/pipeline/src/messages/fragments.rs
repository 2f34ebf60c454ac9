//! Plain-data pieces shared by several messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use trawl_model::{Rule, SimpleRule};
use uuid::Uuid;

fn default_destination() -> Option<String> {
    Some("pipeline_collector".into())
}

/// Identifies the scan run a message belongs to.
///
/// Two tags are equal only if every field is; this is how aborted scans are
/// recognised.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanTag {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub scanner: Option<Scanner>,
    #[serde(default)]
    pub organisation: Option<Organisation>,
    #[serde(default = "default_destination")]
    pub destination: Option<String>,
}

impl ScanTag {
    pub fn new(time: OffsetDateTime) -> Self {
        Self { time, user: None, scanner: None, organisation: None, destination: default_destination() }
    }

    pub fn with_scanner(mut self, pk: i64, name: impl Into<String>) -> Self {
        self.scanner = Some(Scanner { pk, name: name.into(), test: false, keep_fp: false });
        self
    }

    pub fn with_organisation(mut self, name: impl Into<String>, uuid: Option<Uuid>) -> Self {
        self.organisation = Some(Organisation { name: name.into(), uuid });
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

impl std::fmt::Display for ScanTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scanner {
            Some(scanner) => write!(f, "{}#{}@{}", scanner.name, scanner.pk, self.time),
            None => write!(f, "{}", self.time),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scanner {
    pub pk: i64,
    pub name: String,
    /// Test scans don't produce reports.
    #[serde(default)]
    pub test: bool,
    /// Keep matches previously marked as false positives.
    #[serde(default)]
    pub keep_fp: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organisation {
    pub name: String,
    #[serde(default)]
    pub uuid: Option<Uuid>,
}

/// The results of evaluating one simple rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchFragment {
    pub rule: Rule,
    /// `None` when the rule didn't match.
    pub matches: Option<Vec<Value>>,
}

impl MatchFragment {
    pub fn new(rule: &SimpleRule, matches: Vec<Value>) -> Self {
        Self { rule: rule.to_rule(), matches: (!matches.is_empty()).then_some(matches) }
    }

    pub fn matched(&self) -> bool {
        self.matches.is_some()
    }
}

/// How far rule evaluation has got for one object: the rule that is left,
/// and what the rules already evaluated found.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub rule: Rule,
    #[serde(default)]
    pub matches: Vec<MatchFragment>,
}

impl Progress {
    pub fn new(rule: Rule) -> Self {
        Self { rule, matches: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn test_scan_tag_defaults() {
        let tag: ScanTag = serde_json::from_value(json!({
            "time": "2024-03-01T12:00:00+01:00",
            "scanner": {"pk": 4, "name": "CPR scan"}
        }))
        .unwrap();
        assert_eq!(tag.time, datetime!(2024-03-01 11:00 UTC));
        assert_eq!(tag.destination.as_deref(), Some("pipeline_collector"));
        let scanner = tag.scanner.as_ref().unwrap();
        assert!(!scanner.test && !scanner.keep_fp);
        assert!(tag.to_string().starts_with("CPR scan#4@2024-03-01"));
    }

    #[test]
    fn test_scan_tag_equality() {
        let a = ScanTag::new(datetime!(2024-01-01 0:00 UTC)).with_scanner(1, "a");
        let again: ScanTag = serde_json::from_value(serde_json::to_value(&a).unwrap()).unwrap();
        assert_eq!(a, again);
        assert_ne!(a, ScanTag::new(datetime!(2024-01-01 0:00 UTC)).with_scanner(2, "a"));
    }

    #[test]
    fn test_match_fragment() {
        let rule = SimpleRule::Regex { expression: "x".into() };
        assert!(!MatchFragment::new(&rule, vec![]).matched());
        let fragment = MatchFragment::new(&rule, vec![json!({"match": "x"})]);
        assert_eq!(
            serde_json::to_value(&fragment).unwrap(),
            json!({"rule": {"type": "regex", "expression": "x"}, "matches": [{"match": "x"}]})
        );
    }
}
