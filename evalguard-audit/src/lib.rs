//! Privacy audit for the evaluation pipeline.
//!
//! The auditor runs an ordered list of independent checks. Each inspects
//! configuration, a sample of stored documents, or the live behavior of a
//! toolkit function, and records issues (something is missing or wrong) and
//! observations (worth knowing, not a failure).
//!
//! # Example
//! ```
//! use evalguard_audit::{AuditContext, AuditSettings, Conclusion, PrivacyAuditor};
//! use evalguard_crypto::EnvelopeCipher;
//! use evalguard_privacy::AnonymityConfig;
//!
//! let cipher = EnvelopeCipher::unconfigured();
//! let anonymity = AnonymityConfig::default();
//! let settings = AuditSettings::default();
//! let ctx = AuditContext::new(&cipher, &anonymity, &settings);
//! let report = PrivacyAuditor::standard().generate_report(&ctx);
//! assert_eq!(report.conclusion, Conclusion::Fail);
//! ```

pub mod checks;

use chrono::{DateTime, Utc};
use evalguard_crypto::EnvelopeCipher;
use evalguard_privacy::{AnonymityConfig, PrivacyBudgetTracker};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

pub use checks::{standard_checks, AuditCheck};

fn default_session_fields() -> Vec<String> {
    vec!["accountId".into(), "role".into()]
}

fn default_audit_log_fields() -> Vec<String> {
    vec![
        "action".into(),
        "actorRole".into(),
        "resource".into(),
        "timestamp".into(),
    ]
}

/// Deployment facts the audit inspects but cannot observe directly.
///
/// # TOML
/// ```text
/// [audit]
/// session-fields = ["accountId", "role"]
/// audit-log-fields = ["action", "actorRole", "resource", "timestamp"]
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct AuditSettings {
    #[serde(default = "default_session_fields")]
    pub session_fields: Vec<String>,
    #[serde(default = "default_audit_log_fields")]
    pub audit_log_fields: Vec<String>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            session_fields: default_session_fields(),
            audit_log_fields: default_audit_log_fields(),
        }
    }
}

/// Everything a check may look at.
pub struct AuditContext<'a> {
    pub cipher: &'a EnvelopeCipher,
    pub anonymity: &'a AnonymityConfig,
    pub settings: &'a AuditSettings,
    pub tracker: Option<&'a PrivacyBudgetTracker>,
    pub require_comment_encryption: bool,
    /// Sample of stored evaluation records.
    pub evaluations: &'a [Value],
    /// Sample of stored enrollment markers.
    pub enrollments: &'a [Value],
}

impl<'a> AuditContext<'a> {
    pub fn new(
        cipher: &'a EnvelopeCipher,
        anonymity: &'a AnonymityConfig,
        settings: &'a AuditSettings,
    ) -> Self {
        Self {
            cipher,
            anonymity,
            settings,
            tracker: None,
            require_comment_encryption: true,
            evaluations: &[],
            enrollments: &[],
        }
    }

    pub fn with_tracker(mut self, tracker: &'a PrivacyBudgetTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn require_comment_encryption(mut self, required: bool) -> Self {
        self.require_comment_encryption = required;
        self
    }

    pub fn with_records(mut self, evaluations: &'a [Value], enrollments: &'a [Value]) -> Self {
        self.evaluations = evaluations;
        self.enrollments = enrollments;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Warning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObservationLevel {
    Info,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditIssue {
    pub check: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub recommendation: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditWarning {
    pub check: String,
    pub level: ObservationLevel,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResults {
    pub issues: Vec<AuditIssue>,
    pub warnings: Vec<AuditWarning>,
    /// Checks that recorded no issue.
    pub passed: Vec<String>,
}

impl AuditResults {
    pub fn issue(
        &mut self,
        check: &str,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
        recommendation: impl Into<String>,
    ) {
        self.issues.push(AuditIssue {
            check: check.to_owned(),
            severity,
            title: title.into(),
            description: description.into(),
            recommendation: recommendation.into(),
        });
    }

    pub fn observe(&mut self, check: &str, level: ObservationLevel, message: impl Into<String>) {
        self.warnings.push(AuditWarning {
            check: check.to_owned(),
            level,
            message: message.into(),
        });
    }

    pub fn has_critical(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == Severity::Critical)
    }

    pub fn issues_for(&self, check: &str) -> impl Iterator<Item = &AuditIssue> {
        let check = check.to_owned();
        self.issues.iter().filter(move |issue| issue.check == check)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Conclusion {
    /// No issues and no warning-level observations.
    Pass,
    /// Only warning-severity findings.
    Advisory,
    /// At least one critical issue.
    Fail,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub checks_run: usize,
    pub critical: usize,
    pub warnings: usize,
    pub observations: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub conclusion: Conclusion,
    pub summary: AuditSummary,
    pub results: AuditResults,
}

pub struct PrivacyAuditor {
    checks: Vec<AuditCheck>,
}

impl PrivacyAuditor {
    pub fn new(checks: Vec<AuditCheck>) -> Self {
        Self { checks }
    }

    pub fn standard() -> Self {
        Self::new(standard_checks())
    }

    pub fn checks(&self) -> &[AuditCheck] {
        &self.checks
    }

    pub fn run_full_audit(&self, ctx: &AuditContext<'_>) -> AuditResults {
        let mut results = AuditResults::default();
        for check in &self.checks {
            let before = results.issues.len();
            (check.run)(ctx, &mut results);
            if results.issues.len() == before {
                results.passed.push(check.id.to_owned());
            }
        }
        results
    }

    pub fn generate_report(&self, ctx: &AuditContext<'_>) -> AuditReport {
        let results = self.run_full_audit(ctx);
        let report = build_report(results, self.checks.len(), Utc::now());
        info!(
            conclusion = ?report.conclusion,
            critical = report.summary.critical,
            warnings = report.summary.warnings,
            "privacy audit finished"
        );
        report
    }
}

fn build_report(results: AuditResults, checks_run: usize, now: DateTime<Utc>) -> AuditReport {
    let critical = results
        .issues
        .iter()
        .filter(|issue| issue.severity == Severity::Critical)
        .count();
    let warnings = results.issues.len() - critical;
    let warning_observations = results
        .warnings
        .iter()
        .any(|warning| warning.level == ObservationLevel::Warning);
    let conclusion = if critical > 0 {
        Conclusion::Fail
    } else if warnings > 0 || warning_observations {
        Conclusion::Advisory
    } else {
        Conclusion::Pass
    };
    AuditReport {
        generated_at: now,
        conclusion,
        summary: AuditSummary {
            checks_run,
            critical,
            warnings,
            observations: results.warnings.len(),
        },
        results,
    }
}
