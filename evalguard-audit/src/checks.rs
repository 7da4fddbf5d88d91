//! The standard checklist, run in the order listed by [`standard_checks`].

use chrono::{DateTime, TimeZone, Timelike, Utc};
use evalguard_crypto::EncryptedValue;
use evalguard_privacy::{
    anonymize_ip_address, calculate_submission_delay, check_k_anonymity,
    find_forbidden_fields, generate_anonymous_token, get_safe_submission_timestamp,
    is_identity_field, sanitize_comment_with_limit, validate_anonymous_submission_with_limit,
};
use serde_json::{json, Value};

use crate::{AuditContext, AuditResults, ObservationLevel, Severity};

const SELF_TEST_PLAINTEXT: &str = "evalguard audit self-test";
const TOKEN_HEX_LEN: usize = 128;
const RECOMMENDED_K: usize = 5;
/// Keys on an enrollment marker that would point at an evaluation record.
const LINK_KEYS: &[&str] = &["anonymoustoken", "token", "evaluationid", "recordid"];
/// Write-time stamps that defeat timestamp rounding.
const PRECISE_TIME_KEYS: &[&str] = &["createdAt", "updatedAt"];

pub type CheckFn = fn(&AuditContext<'_>, &mut AuditResults);

#[derive(Clone, Copy)]
pub struct AuditCheck {
    pub id: &'static str,
    pub run: CheckFn,
}

impl std::fmt::Debug for AuditCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditCheck").field("id", &self.id).finish()
    }
}

pub fn standard_checks() -> Vec<AuditCheck> {
    vec![
        AuditCheck { id: "encryption-config", run: encryption_config },
        AuditCheck { id: "direct-identifiers", run: direct_identifiers },
        AuditCheck { id: "token-strength", run: token_strength },
        AuditCheck { id: "submission-jitter", run: submission_jitter },
        AuditCheck { id: "ip-anonymization", run: ip_anonymization },
        AuditCheck { id: "enrollment-linkage", run: enrollment_linkage },
        AuditCheck { id: "timestamp-rounding", run: timestamp_rounding },
        AuditCheck { id: "session-minimization", run: session_minimization },
        AuditCheck { id: "dp-budget", run: dp_budget },
        AuditCheck { id: "k-anonymity", run: k_anonymity },
        AuditCheck { id: "audit-log-hygiene", run: audit_log_hygiene },
        AuditCheck { id: "pre-storage-validation", run: pre_storage_validation },
        AuditCheck { id: "comment-encryption", run: comment_encryption },
        AuditCheck { id: "comment-sanitization", run: comment_sanitization },
    ]
}

fn encryption_config(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "encryption-config";
    if !ctx.cipher.is_configured() {
        results.issue(
            ID,
            Severity::Critical,
            "Field encryption is not configured",
            "No valid 256-bit master key is available, so comments cannot be encrypted.",
            "Provide a 64-character hex master key through the configured environment variable.",
        );
        return;
    }

    let round_trip = ctx
        .cipher
        .encrypt_value(SELF_TEST_PLAINTEXT)
        .and_then(|value| ctx.cipher.decrypt_value(&value));
    if !matches!(round_trip.as_deref(), Ok(SELF_TEST_PLAINTEXT)) {
        results.issue(
            ID,
            Severity::Critical,
            "Encryption self-test failed",
            "A value encrypted with the configured key did not decrypt to the original text.",
            "Check the master key and the cipher build before accepting submissions.",
        );
    }

    if !ctx.require_comment_encryption {
        results.issue(
            ID,
            Severity::Warning,
            "Comment encryption is optional",
            "Submissions are accepted with plaintext comments when the key is missing.",
            "Set require-comment-encryption = true.",
        );
    }
}

fn direct_identifiers(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "direct-identifiers";
    let mut offending = Vec::new();
    for record in ctx.evaluations {
        for path in find_forbidden_fields(record) {
            if !offending.contains(&path) {
                offending.push(path);
            }
        }
    }
    if !offending.is_empty() {
        results.issue(
            ID,
            Severity::Critical,
            "Stored evaluations contain identity fields",
            format!("Fields found: {}.", offending.join(", ")),
            "Strip identity fields before storage and purge the affected records.",
        );
    }
}

fn token_strength(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "token-strength";
    let probe = "audit-probe-enrollment";
    let first = generate_anonymous_token(probe);
    let second = generate_anonymous_token(probe);
    let well_formed = |token: &str| {
        token.len() == TOKEN_HEX_LEN && token.bytes().all(|b| b.is_ascii_hexdigit())
    };
    if first == second || !well_formed(first.as_str()) || first.contains(probe) {
        results.issue(
            ID,
            Severity::Critical,
            "Anonymous tokens are weak",
            "Tokens repeat for the same enrollment or are not 512-bit digests.",
            "Derive tokens from a hash of the enrollment, a high-resolution time and fresh randomness.",
        );
    }

    let weak = ctx
        .evaluations
        .iter()
        .filter(|record| {
            !record
                .get("anonymousToken")
                .and_then(Value::as_str)
                .is_some_and(well_formed)
        })
        .count();
    if weak > 0 {
        results.issue(
            ID,
            Severity::Warning,
            "Stored records carry short or missing tokens",
            format!("{weak} record(s) lack a 512-bit anonymous token."),
            "Regenerate tokens for legacy records.",
        );
    }
}

fn submission_jitter(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "submission-jitter";
    let (min, max) = (ctx.anonymity.delay_min_secs, ctx.anonymity.delay_max_secs);
    if max == 0 {
        results.issue(
            ID,
            Severity::Critical,
            "No submission delay",
            "Responses return immediately, so response time can be correlated with content.",
            "Configure delay-min-secs and delay-max-secs with a spread of a few seconds.",
        );
        return;
    }
    if max <= min {
        results.issue(
            ID,
            Severity::Warning,
            "Submission delay is fixed",
            format!("The delay range {min}..{max}s has no spread."),
            "Use a range so the delay is random, not constant.",
        );
    }
    let (low, high) = (min.min(max), min.max(max));
    let escaped = (0..16)
        .map(|_| calculate_submission_delay(min, max).as_millis())
        .any(|ms| ms < u128::from(low) * 1_000 || ms > u128::from(high) * 1_000);
    if escaped {
        results.issue(
            ID,
            Severity::Warning,
            "Submission delay left its range",
            "A sampled delay fell outside the configured bounds.",
            "Review the delay calculation.",
        );
    }
}

fn ip_anonymization(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "ip-anonymization";
    let ipv6_ok = anonymize_ip_address("2001:db8:1:2:3::1").as_deref() == Some("2001:db8:1::");
    let vectors_ok = anonymize_ip_address("192.168.1.55").as_deref() == Some("192.168.1.0")
        && ipv6_ok
        && anonymize_ip_address("not-an-address").is_none();
    if !vectors_ok {
        results.issue(
            ID,
            Severity::Critical,
            "IP truncation is incorrect",
            "The anonymizer did not zero the host part of known addresses.",
            "Fix IP truncation before storing any address fragment.",
        );
    }

    let raw = ctx
        .evaluations
        .iter()
        .filter_map(|record| record.get("ipFragment").and_then(Value::as_str))
        .filter(|fragment| anonymize_ip_address(fragment).as_deref() != Some(*fragment))
        .count();
    if raw > 0 {
        results.issue(
            ID,
            Severity::Critical,
            "Stored IP fragments are not truncated",
            format!("{raw} record(s) hold an address that still identifies a host."),
            "Store only the output of the IP anonymizer and purge the raw values.",
        );
    }
}

fn enrollment_linkage(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "enrollment-linkage";
    let linked_markers = ctx
        .enrollments
        .iter()
        .filter(|marker| {
            marker.as_object().is_some_and(|fields| {
                fields.keys().any(|key| LINK_KEYS.contains(&normalize(key).as_str()))
            })
        })
        .count();
    if linked_markers > 0 {
        results.issue(
            ID,
            Severity::Critical,
            "Enrollment markers reference evaluations",
            format!("{linked_markers} marker(s) hold a token or record id."),
            "Keep only hasSubmitted, submissionTokenUsed and receiptHash on the marker.",
        );
    }

    let receipts_on_records = ctx
        .evaluations
        .iter()
        .filter(|record| record.get("receiptHash").is_some())
        .count();
    if receipts_on_records > 0 {
        results.issue(
            ID,
            Severity::Critical,
            "Evaluation records carry receipt hashes",
            format!("{receipts_on_records} record(s) can be joined to an enrollment marker."),
            "Store the receipt hash on the enrollment marker only.",
        );
    }
}

fn timestamp_rounding(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "timestamp-rounding";
    let probe = Utc
        .with_ymd_and_hms(2024, 3, 14, 15, 9, 26)
        .single()
        .map(get_safe_submission_timestamp);
    if !probe.is_some_and(|ts| is_top_of_hour(ts) && ts.hour() == 15) {
        results.issue(
            ID,
            Severity::Critical,
            "Timestamp rounding is incorrect",
            "Submission times are not rounded down to the hour.",
            "Round submission timestamps before storage.",
        );
    }

    let precise = ctx
        .evaluations
        .iter()
        .filter(|record| {
            record
                .get("submittedAt")
                .and_then(Value::as_str)
                .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
                .is_some_and(|ts| !is_top_of_hour(ts))
        })
        .count();
    if precise > 0 {
        results.issue(
            ID,
            Severity::Critical,
            "Stored submission times are precise",
            format!("{precise} record(s) have a submittedAt that is not rounded."),
            "Round stored timestamps down to the hour.",
        );
    }

    let stamped = ctx
        .evaluations
        .iter()
        .filter(|record| PRECISE_TIME_KEYS.iter().any(|key| record.get(key).is_some()))
        .count();
    if stamped > 0 {
        results.issue(
            ID,
            Severity::Warning,
            "Records carry automatic write timestamps",
            format!("{stamped} record(s) include createdAt or updatedAt."),
            "Disable automatic timestamps on the evaluation collection.",
        );
    }
}

fn session_minimization(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "session-minimization";
    let identifying: Vec<&str> = ctx
        .settings
        .session_fields
        .iter()
        .map(String::as_str)
        .filter(|field| is_identity_field(field))
        .collect();
    if !identifying.is_empty() {
        results.issue(
            ID,
            Severity::Warning,
            "Sessions hold identity data",
            format!("Session fields: {}.", identifying.join(", ")),
            "Keep only an opaque account id and role in the session.",
        );
    }
}

fn dp_budget(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "dp-budget";
    let Some(tracker) = ctx.tracker else {
        results.issue(
            ID,
            Severity::Critical,
            "Differential-privacy budget is not tracked",
            "Aggregate queries can be repeated to average away noise.",
            "Route every statistical read through the budget tracker.",
        );
        return;
    };

    let config = tracker.config();
    if config.default_epsilon > config.total_budget {
        results.issue(
            ID,
            Severity::Warning,
            "Default epsilon exceeds the window budget",
            format!(
                "default-epsilon {} is larger than total-budget {}.",
                config.default_epsilon, config.total_budget
            ),
            "Lower default-epsilon or raise total-budget.",
        );
    }

    let status = tracker.get_budget_status();
    if status.budget_exhausted {
        results.observe(
            ID,
            ObservationLevel::Info,
            format!(
                "Budget for window {} is exhausted until {}.",
                status.window_id, status.window_end
            ),
        );
    }
}

fn k_anonymity(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "k-anonymity";
    let k = ctx.anonymity.min_group_size;
    if k < 2 || !check_k_anonymity(k, k) || check_k_anonymity(k - 1, k) {
        results.issue(
            ID,
            Severity::Critical,
            "k-anonymity gate is ineffective",
            format!("min-group-size {k} lets single respondents be displayed."),
            format!("Set min-group-size to at least {RECOMMENDED_K}."),
        );
        return;
    }
    if k < RECOMMENDED_K {
        results.issue(
            ID,
            Severity::Warning,
            "k-anonymity threshold is low",
            format!("min-group-size is {k}."),
            format!("Use at least {RECOMMENDED_K}."),
        );
    }
    if ctx.anonymity.min_responses < k {
        results.issue(
            ID,
            Severity::Warning,
            "Minimum response count is below k",
            format!(
                "min-responses {} is lower than min-group-size {k}.",
                ctx.anonymity.min_responses
            ),
            "Set min-responses to at least min-group-size.",
        );
    }
}

fn audit_log_hygiene(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "audit-log-hygiene";
    let identifying: Vec<&str> = ctx
        .settings
        .audit_log_fields
        .iter()
        .map(String::as_str)
        .filter(|field| is_identity_field(field))
        .collect();
    if !identifying.is_empty() {
        results.issue(
            ID,
            Severity::Warning,
            "Audit log lines name individuals",
            format!("Logged fields: {}.", identifying.join(", ")),
            "Log the actor role and action, not who performed it.",
        );
    }
}

fn pre_storage_validation(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "pre-storage-validation";
    let limit = ctx.anonymity.max_comment_chars;
    let hostile = json!({
        "ratings": { "teaching": { "clarity": 5 } },
        "studentId": "21-1234-567",
        "meta": { "email": "someone@example.edu" }
    });
    let benign = json!({
        "ratings": { "teaching": { "clarity": 5 } },
        "comments": "Clear lectures"
    });
    let hostile_result = validate_anonymous_submission_with_limit(&hostile, limit);
    if hostile_result.is_valid || hostile_result.errors.len() < 2 {
        results.issue(
            ID,
            Severity::Critical,
            "Identity fields pass validation",
            "A payload with studentId and a nested email was not rejected.",
            "Reject identity-bearing fields at any depth before storage.",
        );
    }
    if !validate_anonymous_submission_with_limit(&benign, limit).is_valid {
        results.issue(
            ID,
            Severity::Warning,
            "Validation rejects ordinary submissions",
            "A payload with only ratings and a neutral comment was refused.",
            "Narrow the identity-field list.",
        );
    }
}

fn comment_encryption(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "comment-encryption";
    let mut plaintext = 0usize;
    let mut malformed = 0usize;
    let mut undecryptable = 0usize;
    for comments in ctx
        .evaluations
        .iter()
        .filter_map(|record| record.get("comments"))
    {
        match comments {
            Value::Null => {}
            Value::String(_) => plaintext += 1,
            other => match EncryptedValue::from_json(other) {
                None => malformed += 1,
                Some(value) => {
                    if ctx.cipher.is_configured() && ctx.cipher.decrypt_value(&value).is_err() {
                        undecryptable += 1;
                    }
                }
            },
        }
    }

    if plaintext > 0 {
        results.issue(
            ID,
            Severity::Critical,
            "Comments stored in plaintext",
            format!("{plaintext} record(s) hold unencrypted comments."),
            "Encrypt comments with the envelope cipher and re-encrypt the affected records.",
        );
    }
    if malformed > 0 {
        results.issue(
            ID,
            Severity::Warning,
            "Malformed encrypted comments",
            format!("{malformed} record(s) have comments that are not valid envelopes."),
            "Inspect the affected records.",
        );
    }
    if undecryptable > 0 {
        results.observe(
            ID,
            ObservationLevel::Warning,
            format!(
                "{undecryptable} encrypted comment(s) do not open with the current master key; \
                 rewrap them if the key was rotated."
            ),
        );
    }
}

fn comment_sanitization(ctx: &AuditContext<'_>, results: &mut AuditResults) {
    const ID: &str = "comment-sanitization";
    let limit = ctx.anonymity.max_comment_chars;
    let rejects = [
        "my student number is 21-1234-567",
        "I am Juan Dela Cruz and this class helped",
    ];
    let rejected = rejects
        .iter()
        .all(|probe| !sanitize_comment_with_limit(probe, limit).valid);
    let redacted = sanitize_comment_with_limit("reach me at probe@example.edu", limit)
        .sanitized
        .is_some_and(|text| !text.contains('@'));
    let ordinary = "Great teacher, very organized";
    let untouched =
        sanitize_comment_with_limit(ordinary, limit).sanitized.as_deref() == Some(ordinary);

    if !(rejected && redacted) {
        results.issue(
            ID,
            Severity::Critical,
            "Comment sanitizer misses self-identifying text",
            "ID numbers, self-introductions or email addresses passed through.",
            "Restore the sanitizer rules before accepting comments.",
        );
    }
    if !untouched {
        results.issue(
            ID,
            Severity::Warning,
            "Comment sanitizer alters ordinary feedback",
            "Neutral feedback was changed or rejected.",
            "Tighten the sanitizer patterns.",
        );
    }
    results.observe(
        ID,
        ObservationLevel::Info,
        "Writing style can still identify a student in a small class; \
         consider showing comments only above the k-anonymity threshold.",
    );
}

fn normalize(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_top_of_hour(ts: DateTime<Utc>) -> bool {
    ts.minute() == 0 && ts.second() == 0 && ts.nanosecond() == 0
}

#[cfg(test)]
mod tests {
    use evalguard_crypto::{EnvelopeCipher, MasterKey};
    use evalguard_privacy::{AnonymityConfig, BudgetConfig, PrivacyBudgetTracker};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::AuditSettings;

    fn run(check: CheckFn, ctx: &AuditContext<'_>) -> AuditResults {
        let mut results = AuditResults::default();
        check(ctx, &mut results);
        results
    }

    #[test]
    fn check_order_is_stable() {
        let ids: Vec<_> = standard_checks().iter().map(|check| check.id).collect();
        assert_eq!(ids.len(), 14);
        assert_eq!(ids.first(), Some(&"encryption-config"));
        assert_eq!(ids.last(), Some(&"comment-sanitization"));
    }

    #[test]
    fn missing_key_is_critical() {
        let cipher = EnvelopeCipher::unconfigured();
        let anonymity = AnonymityConfig::default();
        let settings = AuditSettings::default();
        let ctx = AuditContext::new(&cipher, &anonymity, &settings);
        let results = run(encryption_config, &ctx);
        assert_eq!(results.issues.len(), 1);
        assert_eq!(results.issues[0].severity, Severity::Critical);
    }

    #[test]
    fn optional_comment_encryption_is_a_warning() {
        let cipher = EnvelopeCipher::new(MasterKey::generate());
        let anonymity = AnonymityConfig::default();
        let settings = AuditSettings::default();
        let ctx =
            AuditContext::new(&cipher, &anonymity, &settings).require_comment_encryption(false);
        let results = run(encryption_config, &ctx);
        assert_eq!(results.issues.len(), 1);
        assert_eq!(results.issues[0].severity, Severity::Warning);
    }

    #[test]
    fn flags_raw_ips_and_precise_times() {
        let cipher = EnvelopeCipher::unconfigured();
        let anonymity = AnonymityConfig::default();
        let settings = AuditSettings::default();
        let records = vec![
            json!({ "ipFragment": "10.1.2.3", "submittedAt": "2024-03-14T15:09:26Z" }),
            json!({ "ipFragment": "10.1.2.0", "submittedAt": "2024-03-14T15:00:00Z" }),
        ];
        let ctx = AuditContext::new(&cipher, &anonymity, &settings).with_records(&records, &[]);
        assert_eq!(run(ip_anonymization, &ctx).issues.len(), 1);
        assert_eq!(run(timestamp_rounding, &ctx).issues.len(), 1);
    }

    #[test]
    fn flags_marker_links_and_receipts_on_records() {
        let cipher = EnvelopeCipher::unconfigured();
        let anonymity = AnonymityConfig::default();
        let settings = AuditSettings::default();
        let records = vec![json!({ "receiptHash": "ABCDEF0123456789" })];
        let markers = vec![json!({ "hasSubmitted": true, "anonymous_token": "x" })];
        let ctx =
            AuditContext::new(&cipher, &anonymity, &settings).with_records(&records, &markers);
        let results = run(enrollment_linkage, &ctx);
        assert_eq!(results.issues.len(), 2);
        assert!(results.has_critical());
    }

    #[test]
    fn plaintext_comments_are_critical() {
        let cipher = EnvelopeCipher::new(MasterKey::generate());
        let anonymity = AnonymityConfig::default();
        let settings = AuditSettings::default();
        let sealed = cipher.encrypt_value("fine").unwrap();
        let records = vec![
            json!({ "comments": "stored as text" }),
            json!({ "comments": serde_json::to_value(&sealed).unwrap() }),
            json!({ "comments": null }),
        ];
        let ctx = AuditContext::new(&cipher, &anonymity, &settings).with_records(&records, &[]);
        let results = run(comment_encryption, &ctx);
        assert_eq!(results.issues.len(), 1);
        assert_eq!(results.issues[0].title, "Comments stored in plaintext");
    }

    #[test]
    fn missing_tracker_and_low_k() {
        let cipher = EnvelopeCipher::unconfigured();
        let anonymity = AnonymityConfig {
            min_group_size: 3,
            ..AnonymityConfig::default()
        };
        let settings = AuditSettings::default();
        let ctx = AuditContext::new(&cipher, &anonymity, &settings);
        assert!(run(dp_budget, &ctx).has_critical());
        let k = run(k_anonymity, &ctx);
        assert_eq!(k.issues.len(), 1);
        assert_eq!(k.issues[0].severity, Severity::Warning);

        let tracker = PrivacyBudgetTracker::new(BudgetConfig::default());
        let ctx = ctx.with_tracker(&tracker);
        assert!(run(dp_budget, &ctx).issues.is_empty());
    }

    #[test]
    fn identity_fields_in_sessions_and_logs() {
        let cipher = EnvelopeCipher::unconfigured();
        let anonymity = AnonymityConfig::default();
        let settings = AuditSettings {
            session_fields: vec!["accountId".into(), "studentNumber".into()],
            audit_log_fields: vec!["action".into(), "ip_address".into()],
        };
        let ctx = AuditContext::new(&cipher, &anonymity, &settings);
        assert_eq!(run(session_minimization, &ctx).issues.len(), 1);
        assert_eq!(run(audit_log_hygiene, &ctx).issues.len(), 1);
    }

    #[test]
    fn toolkit_probes_pass_and_note_stylometry() {
        let cipher = EnvelopeCipher::unconfigured();
        let anonymity = AnonymityConfig::default();
        let settings = AuditSettings::default();
        let ctx = AuditContext::new(&cipher, &anonymity, &settings);
        let probes: [CheckFn; 3] = [token_strength, submission_jitter, pre_storage_validation];
        for check in probes {
            assert!(run(check, &ctx).issues.is_empty());
        }
        let sanitization = run(comment_sanitization, &ctx);
        assert!(sanitization.issues.is_empty());
        assert_eq!(sanitization.warnings[0].level, ObservationLevel::Info);
    }
}
