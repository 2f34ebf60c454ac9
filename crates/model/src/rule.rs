//! Scan rules.
//!
//! A [`Rule`] is either an already-decided boolean or a tree of logical and
//! simple rules. Rules are evaluated one simple rule at a time:
//! [`Rule::split`] yields the next simple rule to evaluate, together with the
//! rule that remains if it matches and the rule that remains if it doesn't.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The representation a simple rule needs to be evaluated against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputType {
    Text,
    LastModified,
    Links,
    EmailHeaders,
    /// The raw object, for rules that only care whether it exists
    Fallback,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputType::Text => "text",
            OutputType::LastModified => "last-modified",
            OutputType::Links => "links",
            OutputType::EmailHeaders => "email-headers",
            OutputType::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rule {
    Bool(bool),
    Node(RuleNode),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleNode {
    And {
        components: Vec<Rule>,
    },
    Or {
        components: Vec<Rule>,
    },
    Not {
        rule: Box<Rule>,
    },
    Regex {
        expression: String,
    },
    LastModified {
        #[serde(with = "time::serde::rfc3339")]
        after: OffsetDateTime,
    },
}

/// A rule that can be evaluated directly against one representation.
#[derive(Clone, Debug, PartialEq)]
pub enum SimpleRule {
    Regex { expression: String },
    LastModified { after: OffsetDateTime },
}

impl SimpleRule {
    pub fn operates_on(&self) -> OutputType {
        match self {
            SimpleRule::Regex { .. } => OutputType::Text,
            SimpleRule::LastModified { .. } => OutputType::LastModified,
        }
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            SimpleRule::Regex { .. } => "regex",
            SimpleRule::LastModified { .. } => "last-modified",
        }
    }

    pub fn to_rule(&self) -> Rule {
        Rule::Node(match self.clone() {
            SimpleRule::Regex { expression } => RuleNode::Regex { expression },
            SimpleRule::LastModified { after } => RuleNode::LastModified { after },
        })
    }
}

impl Rule {
    pub fn and(components: Vec<Rule>) -> Rule {
        Rule::Node(RuleNode::And { components })
    }

    pub fn or(components: Vec<Rule>) -> Rule {
        Rule::Node(RuleNode::Or { components })
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(rule: Rule) -> Rule {
        Rule::Node(RuleNode::Not { rule: Box::new(rule) })
    }

    pub fn regex(expression: impl Into<String>) -> Rule {
        Rule::Node(RuleNode::Regex { expression: expression.into() })
    }

    pub fn last_modified(after: OffsetDateTime) -> Rule {
        Rule::Node(RuleNode::LastModified { after })
    }

    /// Returns the boolean this rule has been reduced to, if any.
    pub fn decided(&self) -> Option<bool> {
        match self {
            Rule::Bool(b) => Some(*b),
            Rule::Node(_) => None,
        }
    }

    /// Splits off the next simple rule to evaluate.
    ///
    /// Returns `(head, positive, negative)`: `positive` is what remains to be
    /// evaluated if `head` matches, `negative` if it doesn't. Returns `None`
    /// for a rule that is already a boolean.
    pub fn split(&self) -> Option<(SimpleRule, Rule, Rule)> {
        let node = match self {
            Rule::Bool(_) => return None,
            Rule::Node(node) => node,
        };
        match node {
            RuleNode::Regex { expression } => Some((
                SimpleRule::Regex { expression: expression.clone() },
                Rule::Bool(true),
                Rule::Bool(false),
            )),
            RuleNode::LastModified { after } => {
                Some((SimpleRule::LastModified { after: *after }, Rule::Bool(true), Rule::Bool(false)))
            }
            RuleNode::Not { rule } => {
                let (head, pve, nve) = rule.split()?;
                Some((head, not_make(pve), not_make(nve)))
            }
            RuleNode::And { components } => split_compound(components, and_make),
            RuleNode::Or { components } => split_compound(components, or_make),
        }
    }

    /// The representation needed by the next simple rule, if there is one.
    pub fn operates_on(&self) -> Option<OutputType> {
        self.split().map(|(head, _, _)| head.operates_on())
    }

    /// The latest last-modified cutoff that every match of this rule must
    /// satisfy, found by looking through its conjunctive parts.
    pub fn last_modified_cutoff(&self) -> Option<OffsetDateTime> {
        match self {
            Rule::Node(RuleNode::LastModified { after }) => Some(*after),
            Rule::Node(RuleNode::And { components }) => {
                components.iter().filter_map(Rule::last_modified_cutoff).max()
            }
            _ => None,
        }
    }
}

fn split_compound(components: &[Rule], make: fn(Vec<Rule>) -> Rule) -> Option<(SimpleRule, Rule, Rule)> {
    let (first, rest) = components.split_first()?;
    if rest.is_empty() {
        return first.split();
    }
    let (head, pve, nve) = first.split()?;
    let with = |r: Rule| {
        let mut parts = Vec::with_capacity(components.len());
        parts.push(r);
        parts.extend(rest.iter().cloned());
        make(parts)
    };
    Some((head, with(pve), with(nve)))
}

/// Builds a conjunction, short-circuiting on `false` and flattening nested
/// conjunctions.
pub fn and_make(components: Vec<Rule>) -> Rule {
    if components.contains(&Rule::Bool(false)) {
        return Rule::Bool(false);
    }
    let mut parts = Vec::new();
    for c in components {
        match c {
            Rule::Bool(true) => {}
            Rule::Node(RuleNode::And { components }) => parts.extend(components),
            other => parts.push(other),
        }
    }
    match parts.len() {
        0 => Rule::Bool(true),
        1 => parts.remove(0),
        _ => Rule::and(parts),
    }
}

/// Builds a disjunction, short-circuiting on `true` and flattening nested
/// disjunctions.
pub fn or_make(components: Vec<Rule>) -> Rule {
    if components.contains(&Rule::Bool(true)) {
        return Rule::Bool(true);
    }
    let mut parts = Vec::new();
    for c in components {
        match c {
            Rule::Bool(false) => {}
            Rule::Node(RuleNode::Or { components }) => parts.extend(components),
            other => parts.push(other),
        }
    }
    match parts.len() {
        0 => Rule::Bool(false),
        1 => parts.remove(0),
        _ => Rule::or(parts),
    }
}

pub fn not_make(rule: Rule) -> Rule {
    match rule {
        Rule::Bool(b) => Rule::Bool(!b),
        Rule::Node(RuleNode::Not { rule }) => *rule,
        other => Rule::not(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    #[test]
    fn test_deserialize() {
        let rule: Rule = serde_json::from_value(serde_json::json!({
            "type": "and",
            "components": [
                {"type": "regex", "expression": "[0-9]{6}-[0-9]{4}"},
                {"type": "last-modified", "after": "2024-01-01T00:00:00Z"},
                true
            ]
        }))
        .unwrap();
        let Rule::Node(RuleNode::And { components }) = &rule else {
            panic!("expected a conjunction, got {rule:?}");
        };
        assert_eq!(components.len(), 3);
        assert_eq!(components[2], Rule::Bool(true));
        assert_eq!(rule.last_modified_cutoff(), Some(datetime!(2024-01-01 0:00 UTC)));
    }

    #[test]
    fn test_split_simple() {
        let (head, pve, nve) = Rule::regex("x").split().unwrap();
        assert_eq!(head, SimpleRule::Regex { expression: "x".into() });
        assert_eq!(pve, Rule::Bool(true));
        assert_eq!(nve, Rule::Bool(false));
        assert!(Rule::Bool(true).split().is_none());
    }

    #[test]
    fn test_split_and() {
        let rule = Rule::and(vec![Rule::regex("a"), Rule::regex("b")]);
        let (head, pve, nve) = rule.split().unwrap();
        assert_eq!(head.operates_on(), OutputType::Text);
        assert_eq!(pve, Rule::regex("b"));
        assert_eq!(nve, Rule::Bool(false));
    }

    #[test]
    fn test_split_or() {
        let rule = Rule::or(vec![Rule::regex("a"), Rule::regex("b")]);
        let (_, pve, nve) = rule.split().unwrap();
        assert_eq!(pve, Rule::Bool(true));
        assert_eq!(nve, Rule::regex("b"));
    }

    #[test]
    fn test_split_not() {
        let (_, pve, nve) = Rule::not(Rule::regex("a")).split().unwrap();
        assert_eq!(pve, Rule::Bool(false));
        assert_eq!(nve, Rule::Bool(true));
    }

    #[rstest]
    #[case(vec![Rule::Bool(true), Rule::regex("a")], Rule::regex("a"))]
    #[case(vec![Rule::Bool(false), Rule::regex("a")], Rule::Bool(false))]
    #[case(vec![Rule::Bool(true)], Rule::Bool(true))]
    #[case(
        vec![Rule::and(vec![Rule::regex("a"), Rule::regex("b")]), Rule::regex("c")],
        Rule::and(vec![Rule::regex("a"), Rule::regex("b"), Rule::regex("c")])
    )]
    fn test_and_make(#[case] input: Vec<Rule>, #[case] expected: Rule) {
        assert_eq!(and_make(input), expected);
    }

    #[test]
    fn test_cutoff_ignores_disjunctions() {
        let rule = Rule::or(vec![Rule::last_modified(datetime!(2024-01-01 0:00 UTC)), Rule::regex("a")]);
        assert_eq!(rule.last_modified_cutoff(), None);
    }

    #[test]
    fn test_output_type_serde() {
        assert_eq!(serde_json::to_value(OutputType::LastModified).unwrap(), "last-modified");
        assert_eq!(OutputType::EmailHeaders.to_string(), "email-headers");
    }
}
