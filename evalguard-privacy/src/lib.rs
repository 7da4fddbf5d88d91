//! Privacy primitives for anonymous course evaluations: unlinkable tokens,
//! IP and timestamp coarsening, comment sanitization, the Laplace mechanism
//! with k-anonymity gates, and a windowed differential-privacy budget
//! tracker that replays cached answers instead of re-noising them.

pub mod anonymize;
pub mod budget;
pub mod clock;
pub mod config;
pub mod dp;
pub mod sanitize;

pub use anonymize::{
    anonymize_ip_address, calculate_submission_delay, generate_anonymous_token,
    generate_receipt_hash, get_mixing_pool_id, get_safe_submission_timestamp, RECEIPT_LEN,
};
pub use budget::{
    BudgetError, BudgetStatus, LedgerEntry, PrivacyBudgetTracker, QueryId, QueryOutcome,
    QueryRequest,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnonymityConfig, BudgetConfig};
pub use dp::{
    add_differential_privacy_noise, check_k_anonymity, check_statistical_safety,
    noisy_rating_mean, DpError, LaplaceMechanism, SafetyVerdict, RATING_MAX, RATING_MIN,
};
pub use sanitize::{
    find_forbidden_fields, is_identity_field, sanitize_comment_for_anonymity,
    sanitize_comment_with_limit, validate_anonymous_submission,
    validate_anonymous_submission_with_limit, CommentVerdict, MatchAction, SubmissionValidation,
    TriggeredRule,
};
