//! Comment screening and identity-field detection.
//!
//! Rules run in a fixed order. A `Reject` rule fails the whole comment with
//! an actionable message; a `Redact` rule replaces the match and moves on.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

const DEFAULT_MAX_COMMENT_CHARS: usize = 2_000;

/// Keys (normalized: lowercase, no `_`/`-`) that name a person directly.
const FORBIDDEN_FIELDS: &[&str] = &[
    "student",
    "studentid",
    "studentnumber",
    "studentno",
    "user",
    "userid",
    "username",
    "email",
    "emailaddress",
    "name",
    "fullname",
    "firstname",
    "lastname",
    "enrollment",
    "enrollmentid",
    "enrollmentref",
    "ip",
    "ipaddress",
    "phone",
    "phonenumber",
    "sessionid",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchAction {
    Reject,
    Redact,
}

struct CommentRule {
    name: &'static str,
    pattern: Regex,
    action: MatchAction,
    /// Rejection message, or the replacement text for redactions.
    text: &'static str,
}

static RULES: OnceLock<Vec<CommentRule>> = OnceLock::new();

fn rules() -> &'static [CommentRule] {
    RULES.get_or_init(|| {
        let rule = |name, pattern: &str, action, text| CommentRule {
            name,
            pattern: Regex::new(pattern).unwrap(),
            action,
            text,
        };
        vec![
            rule(
                "student-number-phrase",
                r"(?i)\bmy\s+(?:student|id)\s*(?:number|no\b|id\b|#)",
                MatchAction::Reject,
                "Please do not mention your student number in comments.",
            ),
            rule(
                "student-id",
                r"\b\d{2}-\d{4}-\d{3}\b",
                MatchAction::Reject,
                "Comments cannot contain ID numbers.",
            ),
            rule(
                "self-introduction",
                r"\b(?:(?i:i\s+am|i'm|this\s+is)\s+[A-Z][a-z]+\s+[A-Z][a-z]+|(?i:my\s+name\s+is)\s+[A-Z][a-z]+)",
                MatchAction::Reject,
                "Please do not introduce yourself by name in comments.",
            ),
            rule(
                "email",
                r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
                MatchAction::Redact,
                "[email removed]",
            ),
            rule(
                "phone",
                r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{2,4}\)|\b\d{3,4})[\s.-]?\d{3,4}[\s.-]?\d{4}\b",
                MatchAction::Redact,
                "[phone removed]",
            ),
        ]
    })
}

/// A rule that matched, and what it did about it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TriggeredRule {
    pub name: &'static str,
    pub action: MatchAction,
}

/// Outcome of screening one comment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommentVerdict {
    pub valid: bool,
    pub sanitized: Option<String>,
    pub error: Option<String>,
    /// Rules that fired, in evaluation order.
    pub triggered: Vec<TriggeredRule>,
}

impl CommentVerdict {
    fn rejected(error: impl Into<String>, triggered: Vec<TriggeredRule>) -> Self {
        Self {
            valid: false,
            sanitized: None,
            error: Some(error.into()),
            triggered,
        }
    }
}

pub fn sanitize_comment_for_anonymity(text: &str) -> CommentVerdict {
    sanitize_comment_with_limit(text, DEFAULT_MAX_COMMENT_CHARS)
}

/// Collapses whitespace, enforces `max_chars`, then applies the rules.
pub fn sanitize_comment_with_limit(text: &str, max_chars: usize) -> CommentVerdict {
    let mut cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() > max_chars {
        return CommentVerdict::rejected(
            format!("Comments must be at most {max_chars} characters."),
            Vec::new(),
        );
    }

    let mut triggered = Vec::new();
    for rule in rules() {
        if !rule.pattern.is_match(&cleaned) {
            continue;
        }
        triggered.push(TriggeredRule {
            name: rule.name,
            action: rule.action,
        });
        match rule.action {
            MatchAction::Reject => return CommentVerdict::rejected(rule.text, triggered),
            MatchAction::Redact => {
                cleaned = rule.pattern.replace_all(&cleaned, rule.text).into_owned();
            }
        }
    }

    CommentVerdict {
        valid: true,
        sanitized: Some(cleaned),
        error: None,
        triggered,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

pub fn validate_anonymous_submission(payload: &Value) -> SubmissionValidation {
    validate_anonymous_submission_with_limit(payload, DEFAULT_MAX_COMMENT_CHARS)
}

/// Rejects payloads that carry identity fields anywhere in their tree, and
/// re-screens a plaintext `comments` field against `max_comment_chars`.
pub fn validate_anonymous_submission_with_limit(
    payload: &Value,
    max_comment_chars: usize,
) -> SubmissionValidation {
    let mut errors = Vec::new();
    if !payload.is_object() {
        errors.push("submission must be a JSON object".to_owned());
    }
    for path in find_forbidden_fields(payload) {
        errors.push(format!("field `{path}` is not allowed in an anonymous submission"));
    }
    if let Some(Value::String(comments)) = payload.get("comments") {
        let verdict = sanitize_comment_with_limit(comments, max_comment_chars);
        if let Some(error) = verdict.error {
            errors.push(error);
        }
    }
    SubmissionValidation {
        is_valid: errors.is_empty(),
        errors,
    }
}

/// Dotted paths of every key that looks like a direct identifier.
pub fn find_forbidden_fields(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_forbidden(value, "", &mut found);
    found
}

fn collect_forbidden(value: &Value, prefix: &str, found: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if is_identity_field(key) {
                    found.push(path.clone());
                }
                collect_forbidden(child, &path, found);
            }
        }
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                collect_forbidden(item, &format!("{prefix}[{idx}]"), found);
            }
        }
        _ => {}
    }
}

/// True for keys such as `student_id`, `Email` or `fullName`.
pub fn is_identity_field(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    FORBIDDEN_FIELDS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn names(verdict: &CommentVerdict) -> Vec<&'static str> {
        verdict.triggered.iter().map(|rule| rule.name).collect()
    }

    #[test]
    fn ordinary_feedback_passes_unchanged() {
        let verdict = sanitize_comment_for_anonymity("Great teacher, very organized");
        assert!(verdict.valid);
        assert_eq!(verdict.sanitized.as_deref(), Some("Great teacher, very organized"));
        assert!(verdict.triggered.is_empty());
    }

    #[test]
    fn rejects_student_number_phrases() {
        let verdict = sanitize_comment_for_anonymity("my student number is 21-1234-567");
        assert!(!verdict.valid);
        assert_eq!(
            verdict.triggered,
            vec![TriggeredRule {
                name: "student-number-phrase",
                action: MatchAction::Reject,
            }]
        );
        assert!(verdict.error.unwrap().contains("student number"));
    }

    #[test]
    fn rejects_bare_id_numbers() {
        let verdict = sanitize_comment_for_anonymity("ask 21-1234-567 about it");
        assert!(!verdict.valid);
        assert_eq!(names(&verdict), vec!["student-id"]);
    }

    #[test]
    fn rejects_self_introductions() {
        for text in [
            "I am Juan Dela Cruz and I liked the class",
            "Hi, this is Maria Santos.",
            "my name is Pedro",
        ] {
            let verdict = sanitize_comment_for_anonymity(text);
            assert!(!verdict.valid, "{text}");
            assert_eq!(names(&verdict), vec!["self-introduction"]);
        }
        assert!(sanitize_comment_for_anonymity("I am very happy with this course").valid);
        assert!(sanitize_comment_for_anonymity("This is a great class").valid);
    }

    #[test]
    fn redacts_contact_details() {
        let verdict =
            sanitize_comment_for_anonymity("Write me at jdoe@student.school.edu or 0917-123-4567");
        assert!(verdict.valid);
        assert_eq!(
            verdict.sanitized.as_deref(),
            Some("Write me at [email removed] or [phone removed]")
        );
        assert_eq!(names(&verdict), vec!["email", "phone"]);
        assert!(verdict
            .triggered
            .iter()
            .all(|rule| rule.action == MatchAction::Redact));
    }

    #[test]
    fn collapses_whitespace_and_enforces_length() {
        let verdict = sanitize_comment_for_anonymity("  clear   \n\t lectures ");
        assert_eq!(verdict.sanitized.as_deref(), Some("clear lectures"));
        let long = "a".repeat(11);
        assert!(!sanitize_comment_with_limit(&long, 10).valid);
    }

    #[test]
    fn finds_nested_identity_fields() {
        let payload = json!({
            "ratings": { "teaching": { "clarity": 5 } },
            "meta": { "student_id": "21-1234-567", "items": [{ "Email": "x" }] },
            "courseId": "c-1"
        });
        assert_eq!(
            find_forbidden_fields(&payload),
            vec!["meta.items[0].Email".to_owned(), "meta.student_id".to_owned()]
        );
    }

    #[test]
    fn validation_collects_field_and_comment_errors() {
        let payload = json!({ "userId": "u1", "comments": "I am Ana Reyes" });
        let result = validate_anonymous_submission(&payload);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 2);

        let clean = json!({ "ratings": { "teaching": { "clarity": 4 } }, "comments": "Fair grading" });
        assert_eq!(
            validate_anonymous_submission(&clean),
            SubmissionValidation {
                is_valid: true,
                errors: vec![]
            }
        );
        assert!(!validate_anonymous_submission(&json!("text")).is_valid);
    }

    #[test]
    fn validation_honors_the_configured_comment_limit() {
        let payload = json!({ "comments": "good ".repeat(600) });
        assert!(!validate_anonymous_submission(&payload).is_valid);
        assert!(validate_anonymous_submission_with_limit(&payload, 5_000).is_valid);
        let result = validate_anonymous_submission_with_limit(&payload, 100);
        assert_eq!(result.errors, vec!["Comments must be at most 100 characters.".to_owned()]);
    }
}
