//! Anonymous evaluation submission.
//!
//! Order of operations for one submission:
//! 1. the enrollment marker must exist and be unsubmitted,
//! 2. ratings and the whole payload are validated,
//! 3. a random delay is awaited (no lock held),
//! 4. the comment is sanitized and strictly encrypted,
//! 5. the marker is claimed with a guarded update,
//! 6. the record is inserted; on failure the claim is released.
//!
//! The record carries no enrollment reference and the marker carries no
//! token, so the two cannot be joined.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use evalguard_crypto::{CipherError, EnvelopeCipher, StoredField};
use evalguard_privacy::{
    anonymize_ip_address, calculate_submission_delay, generate_anonymous_token,
    generate_receipt_hash, get_mixing_pool_id, get_safe_submission_timestamp,
    sanitize_comment_with_limit, validate_anonymous_submission_with_limit, AnonymityConfig, Clock,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::{DocumentStore, Filter, StoreError, ENROLLMENTS, EVALUATIONS};

pub const MIN_RATING: i64 = 1;
pub const MAX_RATING: i64 = 5;

/// Criterion name to score, one map per category.
pub type CriterionScores = BTreeMap<String, i64>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ratings {
    #[serde(default)]
    pub teaching: CriterionScores,
    #[serde(default)]
    pub classroom_management: CriterionScores,
    #[serde(default)]
    pub student_engagement: CriterionScores,
}

impl Ratings {
    pub fn categories(&self) -> [(&'static str, &CriterionScores); 3] {
        [
            ("teaching", &self.teaching),
            ("classroomManagement", &self.classroom_management),
            ("studentEngagement", &self.student_engagement),
        ]
    }

    fn validate(&self) -> Result<(), SubmissionError> {
        for (category, scores) in self.categories() {
            if scores.is_empty() {
                return Err(SubmissionError::InvalidRatings(format!(
                    "Ratings for {category} are required."
                )));
            }
            if let Some((criterion, score)) = scores
                .iter()
                .find(|(_, score)| !(MIN_RATING..=MAX_RATING).contains(*score))
            {
                return Err(SubmissionError::InvalidRatings(format!(
                    "Rating {category}.{criterion} must be between {MIN_RATING} and {MAX_RATING}, got {score}."
                )));
            }
        }
        Ok(())
    }
}

/// What the student sends. Unknown fields are kept so that validation sees
/// them and can refuse identity-bearing extras.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSubmission {
    pub ratings: Ratings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EvaluationSubmission {
    pub fn new(ratings: Ratings) -> Self {
        Self {
            ratings,
            ..Self::default()
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousEvaluationRecord {
    pub anonymous_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    pub ratings: Ratings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<StoredField>,
    pub ip_fragment: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub mixing_pool_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("enrollment not found")]
    EnrollmentNotFound,
    #[error("already evaluated")]
    AlreadySubmitted,
    #[error("{0}")]
    InvalidRatings(String),
    #[error("{}", .0.join(" "))]
    Rejected(Vec<String>),
    #[error("comment encryption unavailable: {0}")]
    Configuration(#[from] CipherError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmissionError {
    /// Text safe to show the student.
    pub fn user_message(&self) -> String {
        match self {
            Self::EnrollmentNotFound => "Enrollment not found.".into(),
            Self::AlreadySubmitted => "You have already evaluated this course.".into(),
            Self::InvalidRatings(message) => message.clone(),
            Self::Rejected(errors) => errors.join(" "),
            Self::Configuration(_) => "Server configuration error".into(),
            Self::Store(_) => "Your evaluation could not be saved. Please try again.".into(),
        }
    }
}

pub struct SubmissionService {
    store: Arc<dyn DocumentStore>,
    cipher: EnvelopeCipher,
    anonymity: AnonymityConfig,
    require_comment_encryption: bool,
    clock: Arc<dyn Clock>,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cipher: EnvelopeCipher,
        anonymity: AnonymityConfig,
        require_comment_encryption: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cipher,
            anonymity,
            require_comment_encryption,
            clock,
        }
    }

    pub async fn submit_evaluation(
        &self,
        enrollment_ref: &str,
        submission: EvaluationSubmission,
        client_ip: Option<&str>,
    ) -> SubmissionResponse {
        match self.try_submit(enrollment_ref, submission, client_ip).await {
            Ok(receipt) => SubmissionResponse {
                success: true,
                message: "Evaluation submitted anonymously.".into(),
                receipt: Some(receipt),
            },
            Err(err) => {
                match &err {
                    SubmissionError::Configuration(_) => {
                        error!(error = %err, "submission refused by configuration")
                    }
                    SubmissionError::Store(_) => warn!(error = %err, "submission not stored"),
                    _ => debug!(error = %err, "submission rejected"),
                }
                SubmissionResponse {
                    success: false,
                    message: err.user_message(),
                    receipt: None,
                }
            }
        }
    }

    async fn try_submit(
        &self,
        enrollment_ref: &str,
        submission: EvaluationSubmission,
        client_ip: Option<&str>,
    ) -> Result<String, SubmissionError> {
        let marker = self
            .store
            .find(ENROLLMENTS, &Filter::new().eq("_id", enrollment_ref))
            .await?
            .into_iter()
            .next()
            .ok_or(SubmissionError::EnrollmentNotFound)?;
        if marker.get("hasSubmitted") == Some(&Value::Bool(true)) {
            return Err(SubmissionError::AlreadySubmitted);
        }

        submission.ratings.validate()?;
        let payload = serde_json::to_value(&submission)
            .map_err(|err| SubmissionError::Rejected(vec![err.to_string()]))?;
        let validation =
            validate_anonymous_submission_with_limit(&payload, self.anonymity.max_comment_chars);
        if !validation.is_valid {
            return Err(SubmissionError::Rejected(validation.errors));
        }

        let delay = calculate_submission_delay(
            self.anonymity.delay_min_secs,
            self.anonymity.delay_max_secs,
        );
        tokio::time::sleep(delay).await;

        let comments = self.protect_comments(submission.comments.as_deref())?;

        let now = self.clock.now();
        let anonymous_token = generate_anonymous_token(enrollment_ref);
        let receipt = generate_receipt_hash(&anonymous_token, now);
        let record = AnonymousEvaluationRecord {
            anonymous_token,
            course_id: string_field(&marker, "courseId"),
            teacher_id: string_field(&marker, "teacherId"),
            ratings: submission.ratings,
            comments,
            ip_fragment: client_ip.and_then(anonymize_ip_address),
            submitted_at: get_safe_submission_timestamp(now),
            mixing_pool_id: get_mixing_pool_id(now, self.anonymity.mixing_window_minutes),
        };
        let document = serde_json::to_value(&record).map_err(|_| StoreError::InvalidDocument)?;

        let guard = Filter::new()
            .eq("_id", enrollment_ref)
            .ne("hasSubmitted", true);
        let claim = marker_fields(true, Value::String(receipt.clone()));
        if self
            .store
            .find_one_and_update(ENROLLMENTS, &guard, claim)
            .await?
            .is_none()
        {
            return Err(SubmissionError::AlreadySubmitted);
        }

        if let Err(err) = self.store.insert_one(EVALUATIONS, document).await {
            self.release_claim(enrollment_ref).await;
            return Err(err.into());
        }

        info!(pool = %record.mixing_pool_id, "evaluation accepted");
        Ok(receipt)
    }

    /// Normalizes, screens and encrypts the comment. Never falls back to
    /// storing plaintext when encryption is required.
    fn protect_comments(&self, raw: Option<&str>) -> Result<Option<StoredField>, SubmissionError> {
        let Some(raw) = raw.filter(|text| !text.trim().is_empty()) else {
            return Ok(None);
        };
        let verdict = sanitize_comment_with_limit(raw, self.anonymity.max_comment_chars);
        let sanitized = match (verdict.valid, verdict.sanitized) {
            (true, Some(text)) => text,
            _ => {
                let reason = verdict
                    .error
                    .unwrap_or_else(|| "Comment could not be accepted.".into());
                return Err(SubmissionError::Rejected(vec![reason]));
            }
        };

        if self.cipher.is_configured() {
            return Ok(Some(StoredField::Encrypted(
                self.cipher.encrypt_value(&sanitized)?,
            )));
        }
        if self.require_comment_encryption {
            return Err(CipherError::Configuration("master key is not configured".into()).into());
        }
        warn!("storing comment without encryption; encryption is not required by config");
        Ok(Some(StoredField::Plain(sanitized)))
    }

    async fn release_claim(&self, enrollment_ref: &str) {
        let filter = Filter::new().eq("_id", enrollment_ref).eq("hasSubmitted", true);
        let release = marker_fields(false, Value::Null);
        if let Err(err) = self
            .store
            .find_one_and_update(ENROLLMENTS, &filter, release)
            .await
        {
            error!(error = %err, "failed to release enrollment claim");
        }
    }
}

fn marker_fields(submitted: bool, receipt: Value) -> Map<String, Value> {
    let fields = json!({
        "hasSubmitted": submitted,
        "submissionTokenUsed": submitted,
        "receiptHash": receipt,
    });
    match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn string_field(document: &Value, key: &str) -> Option<String> {
    document.get(key).and_then(Value::as_str).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use evalguard_crypto::MasterKey;
    use evalguard_privacy::SystemClock;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryStore;

    fn scores(pairs: &[(&str, i64)]) -> CriterionScores {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
    }

    fn ratings() -> Ratings {
        Ratings {
            teaching: scores(&[("clarity", 5), ("preparation", 4)]),
            classroom_management: scores(&[("punctuality", 4)]),
            student_engagement: scores(&[("participation", 3)]),
        }
    }

    fn instant() -> AnonymityConfig {
        AnonymityConfig {
            delay_min_secs: 0,
            delay_max_secs: 0,
            ..AnonymityConfig::default()
        }
    }

    async fn service(cipher: EnvelopeCipher, required: bool) -> (Arc<MemoryStore>, SubmissionService) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_one(
                ENROLLMENTS,
                json!({ "_id": "enr-1", "courseId": "c-1", "teacherId": "t-1", "hasSubmitted": false }),
            )
            .await
            .unwrap();
        let service = SubmissionService::new(
            store.clone(),
            cipher,
            instant(),
            required,
            Arc::new(SystemClock),
        );
        (store, service)
    }

    #[test]
    fn ratings_must_be_complete_and_in_range() {
        assert!(ratings().validate().is_ok());
        let mut missing = ratings();
        missing.student_engagement.clear();
        assert!(matches!(missing.validate(), Err(SubmissionError::InvalidRatings(_))));
        let mut high = ratings();
        high.teaching.insert("clarity".into(), 6);
        let err = high.validate().unwrap_err();
        assert!(err.user_message().contains("teaching.clarity"));
    }

    #[tokio::test]
    async fn unconfigured_key_refuses_comments_when_required() {
        let (store, service) = service(EnvelopeCipher::unconfigured(), true).await;
        let submission = EvaluationSubmission::new(ratings()).with_comments("Clear lectures");
        let response = service.submit_evaluation("enr-1", submission, None).await;
        assert_eq!(
            response,
            SubmissionResponse {
                success: false,
                message: "Server configuration error".into(),
                receipt: None,
            }
        );
        assert_eq!(store.count(EVALUATIONS), 0);
    }

    #[tokio::test]
    async fn plaintext_allowed_only_when_not_required() {
        let (store, service) = service(EnvelopeCipher::unconfigured(), false).await;
        let submission = EvaluationSubmission::new(ratings()).with_comments("  Clear \n lectures ");
        assert!(service.submit_evaluation("enr-1", submission, None).await.success);
        let stored = store.find(EVALUATIONS, &Filter::new()).await.unwrap();
        assert_eq!(stored[0]["comments"], json!("Clear lectures"));
    }

    #[tokio::test]
    async fn rejects_identity_fields_and_self_identifying_comments() {
        let (store, service) = service(EnvelopeCipher::new(MasterKey::generate()), true).await;

        let mut with_id = EvaluationSubmission::new(ratings());
        with_id.extra.insert("studentId".into(), json!("21-1234-567"));
        let response = service.submit_evaluation("enr-1", with_id, None).await;
        assert!(!response.success);
        assert!(response.message.contains("studentId"));

        let named = EvaluationSubmission::new(ratings()).with_comments("I am Ana Reyes, thanks!");
        let response = service.submit_evaluation("enr-1", named, None).await;
        assert!(!response.success);
        assert!(response.message.contains("introduce yourself"));
        assert_eq!(store.count(EVALUATIONS), 0);
    }

    #[tokio::test]
    async fn whitespace_only_comment_is_absent() {
        let (store, service) = service(EnvelopeCipher::unconfigured(), true).await;
        let submission = EvaluationSubmission::new(ratings()).with_comments(" \n\t ");
        let response = service.submit_evaluation("enr-1", submission, None).await;
        assert!(response.success, "{}", response.message);
        let stored = store.find(EVALUATIONS, &Filter::new()).await.unwrap();
        assert!(stored[0].get("comments").is_none());
    }

    #[tokio::test]
    async fn failed_insert_releases_the_claim() {
        let (store, service) = service(EnvelopeCipher::new(MasterKey::generate()), true).await;
        store.set_fail_inserts(true);
        let first = service
            .submit_evaluation("enr-1", EvaluationSubmission::new(ratings()), None)
            .await;
        assert!(!first.success);
        let marker = &store
            .find(ENROLLMENTS, &Filter::new().eq("_id", "enr-1"))
            .await
            .unwrap()[0];
        assert_eq!(marker["hasSubmitted"], json!(false));

        store.set_fail_inserts(false);
        let retry = service
            .submit_evaluation("enr-1", EvaluationSubmission::new(ratings()), None)
            .await;
        assert!(retry.success);
        assert_eq!(store.count(EVALUATIONS), 1);
    }

    #[tokio::test]
    async fn long_comments_follow_the_configured_limit() {
        let cipher = EnvelopeCipher::new(MasterKey::generate());
        let (store, _) = service(cipher.clone(), true).await;
        let service = SubmissionService::new(
            store.clone(),
            cipher.clone(),
            AnonymityConfig {
                max_comment_chars: 5_000,
                ..instant()
            },
            true,
            Arc::new(SystemClock),
        );
        let long = "good ".repeat(600);
        let submission = EvaluationSubmission::new(ratings()).with_comments(long.clone());
        let response = service.submit_evaluation("enr-1", submission, None).await;
        assert!(response.success, "{}", response.message);

        let stored = store.find(EVALUATIONS, &Filter::new()).await.unwrap();
        let sealed = evalguard_crypto::EncryptedValue::from_json(&stored[0]["comments"]).unwrap();
        assert_eq!(cipher.decrypt_value(&sealed).unwrap(), long.trim_end());
    }

    #[tokio::test]
    async fn unknown_enrollment_is_refused() {
        let (_, service) = service(EnvelopeCipher::unconfigured(), false).await;
        let response = service
            .submit_evaluation("enr-404", EvaluationSubmission::new(ratings()), None)
            .await;
        assert_eq!(response.message, "Enrollment not found.");
    }
}
