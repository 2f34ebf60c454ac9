//! Evaluation of simple rules against representations.

use crate::conversions::Representation;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use regex::Regex;
use serde_json::{Value, json};
use time::format_description::well_known::Rfc3339;
use trawl_model::SimpleRule;

/// Characters of context kept on each side of a regex match.
const CONTEXT: usize = 50;

/// Runs `rule` against `representation` and returns one JSON object per
/// match. A missing or mismatched representation matches nothing.
pub fn evaluate(rule: &SimpleRule, representation: Option<&Representation>) -> Result<Vec<Value>> {
    match (rule, representation) {
        (SimpleRule::Regex { expression }, Some(Representation::Text(text))) => {
            let regex = Regex::new(expression).or_raise(|| ErrorKind::Rule(format!("bad expression `{expression}`")))?;
            Ok(regex
                .find_iter(text)
                .map(|m| {
                    let (context, context_offset) = context(text, m.start(), m.end());
                    json!({
                        "match": m.as_str(),
                        "offset": m.start(),
                        "context": context,
                        "context_offset": context_offset,
                    })
                })
                .collect())
        }
        (SimpleRule::LastModified { after }, Some(Representation::LastModified(at))) => {
            if at <= after {
                return Ok(Vec::new());
            }
            let at = at.format(&Rfc3339).or_raise(|| ErrorKind::Rule("unformattable timestamp".into()))?;
            Ok(vec![json!({"match": at})])
        }
        _ => Ok(Vec::new()),
    }
}

/// Up to [`CONTEXT`] characters either side of `text[start..end]`, and the
/// byte offset at which the context begins.
fn context(text: &str, start: usize, end: usize) -> (&str, usize) {
    let from = text[..start].char_indices().rev().nth(CONTEXT - 1).map_or(0, |(i, _)| i);
    let to = text[end..].char_indices().nth(CONTEXT).map_or(text.len(), |(i, _)| end + i);
    (&text[from..to], from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    fn regex(expression: &str) -> SimpleRule {
        SimpleRule::Regex { expression: expression.into() }
    }

    #[test]
    fn test_regex_matches() {
        let text = Representation::Text("cpr 111111-1118 and 222222-2226".into());
        let matches = evaluate(&regex(r"\d{6}-\d{4}"), Some(&text)).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0]["match"], "111111-1118");
        assert_eq!(matches[1]["offset"], 20);
        assert_eq!(matches[0]["context"], "cpr 111111-1118 and 222222-2226");
    }

    #[test]
    fn test_context_is_bounded() {
        let text = format!("{}needle{}", "a".repeat(80), "\u{e6}".repeat(80));
        let (context, offset) = context(&text, 80, 86);
        assert_eq!(offset, 30);
        assert_eq!(context, format!("{}needle{}", "a".repeat(50), "\u{e6}".repeat(50)));
    }

    #[rstest]
    #[case(datetime!(2024-06-01 0:00 UTC), 1)]
    #[case(datetime!(2024-01-01 0:00 UTC), 0)]
    #[case(datetime!(2023-06-01 0:00 UTC), 0)]
    fn test_last_modified(#[case] at: time::OffsetDateTime, #[case] expected: usize) {
        let rule = SimpleRule::LastModified { after: datetime!(2024-01-01 0:00 UTC) };
        let matches = evaluate(&rule, Some(&Representation::LastModified(at))).unwrap();
        assert_eq!(matches.len(), expected);
    }

    #[test]
    fn test_missing_representation() {
        assert!(evaluate(&regex("x"), None).unwrap().is_empty());
        assert!(evaluate(&regex("x"), Some(&Representation::Fallback)).unwrap().is_empty());
    }

    #[test]
    fn test_bad_expression() {
        let err = evaluate(&regex("("), Some(&Representation::Text("(".into()))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Rule(_)));
    }
}
