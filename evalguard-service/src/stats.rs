//! Admin-facing aggregates. Every released number passes the k-anonymity and
//! minimum-response gates first, then goes through the budget tracker.

use std::sync::Arc;

use evalguard_privacy::{
    check_k_anonymity, check_statistical_safety, AnonymityConfig, BudgetStatus, DpError,
    LaplaceMechanism, PrivacyBudgetTracker, QueryRequest, RATING_MAX, RATING_MIN,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::store::{DocumentStore, Filter, StoreResult, EVALUATIONS};
use crate::submission::AnonymousEvaluationRecord;

pub const TEACHER_SUMMARY: &str = "teacher_summary";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SummaryResponse {
    /// Too few responses to show anything; no budget spent.
    Suppressed { message: String },
    /// Budget tracker refused the query.
    Refused { message: String, budget: BudgetStatus },
    Released {
        cached: bool,
        summary: Value,
        budget: BudgetStatus,
    },
}

pub struct StatisticsService {
    store: Arc<dyn DocumentStore>,
    tracker: Arc<PrivacyBudgetTracker>,
    anonymity: AnonymityConfig,
    mechanism: Mutex<LaplaceMechanism>,
}

impl StatisticsService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        tracker: Arc<PrivacyBudgetTracker>,
        anonymity: AnonymityConfig,
    ) -> Self {
        Self::with_mechanism(store, tracker, anonymity, LaplaceMechanism::from_entropy())
    }

    pub fn with_mechanism(
        store: Arc<dyn DocumentStore>,
        tracker: Arc<PrivacyBudgetTracker>,
        anonymity: AnonymityConfig,
        mechanism: LaplaceMechanism,
    ) -> Self {
        Self {
            store,
            tracker,
            anonymity,
            mechanism: Mutex::new(mechanism),
        }
    }

    /// Noised per-category means and response count for one teacher.
    ///
    /// The query epsilon is split evenly across the released numbers.
    pub async fn teacher_summary(
        &self,
        teacher_id: &str,
        epsilon: Option<f64>,
    ) -> StoreResult<SummaryResponse> {
        let records: Vec<AnonymousEvaluationRecord> = self
            .store
            .find(EVALUATIONS, &Filter::new().eq("teacherId", teacher_id))
            .await?
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .collect();
        let responses = records.len();

        let k = self.anonymity.min_group_size;
        if !check_k_anonymity(responses, k) {
            debug!(responses, "teacher summary suppressed by k-anonymity");
            return Ok(SummaryResponse::Suppressed {
                message: format!("Results are hidden until at least {k} students respond."),
            });
        }
        let safety = check_statistical_safety(responses, self.anonymity.min_responses);
        if !safety.is_safe {
            debug!(responses, "teacher summary suppressed by response minimum");
            return Ok(SummaryResponse::Suppressed {
                message: safety.message,
            });
        }

        let means = category_means(&records);
        let mut request = QueryRequest::new(TEACHER_SUMMARY, json!({ "teacherId": teacher_id }));
        if let Some(epsilon) = epsilon {
            request = request.with_epsilon(epsilon);
        }
        let outcome = self.tracker.execute_query(&request, |eps| {
            self.noised_summary(&means, responses, eps)
        });

        Ok(match (outcome.success, outcome.result) {
            (true, Some(summary)) => SummaryResponse::Released {
                cached: outcome.cached,
                summary,
                budget: outcome.budget_status,
            },
            _ => {
                let message = outcome
                    .error
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "query refused".into());
                warn!(query_type = TEACHER_SUMMARY, "statistics query refused");
                SummaryResponse::Refused {
                    message,
                    budget: outcome.budget_status,
                }
            }
        })
    }

    fn noised_summary(
        &self,
        means: &[(&'static str, f64)],
        responses: usize,
        epsilon: f64,
    ) -> Result<Value, DpError> {
        let share = epsilon / (means.len() + 1) as f64;
        let mean_sensitivity = (RATING_MAX - RATING_MIN) / responses.max(1) as f64;
        let mut mechanism = self.mechanism.lock();

        let mut categories = Map::new();
        for (category, mean) in means {
            let noised = mechanism.noisy_rating_mean(*mean, share, mean_sensitivity)?;
            categories.insert((*category).to_owned(), json!(round2(noised)));
        }
        let count = mechanism.add_noise(responses as f64, share, 1.0)?;
        Ok(json!({
            "responses": count.round() as u64,
            "categories": categories,
        }))
    }
}

/// Mean of every criterion score within each category across records.
fn category_means(records: &[AnonymousEvaluationRecord]) -> Vec<(&'static str, f64)> {
    let mut totals = [(0i64, 0usize); 3];
    let mut names = [""; 3];
    for record in records {
        for (idx, (name, scores)) in record.ratings.categories().into_iter().enumerate() {
            names[idx] = name;
            totals[idx].0 += scores.values().sum::<i64>();
            totals[idx].1 += scores.len();
        }
    }
    names
        .into_iter()
        .zip(totals)
        .filter(|(_, (_, count))| *count > 0)
        .map(|(name, (sum, count))| (name, sum as f64 / count as f64))
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use evalguard_privacy::BudgetConfig;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryStore;
    use crate::submission::{CriterionScores, Ratings};

    fn record(teacher: &str, score: i64) -> Value {
        let scores = |name: &str| -> CriterionScores { [(name.to_owned(), score)].into() };
        serde_json::to_value(AnonymousEvaluationRecord {
            anonymous_token: "t".repeat(128),
            course_id: Some("c-1".into()),
            teacher_id: Some(teacher.into()),
            ratings: Ratings {
                teaching: scores("clarity"),
                classroom_management: scores("punctuality"),
                student_engagement: scores("participation"),
            },
            comments: None,
            ip_fragment: None,
            submitted_at: Utc::now(),
            mixing_pool_id: "pool".into(),
        })
        .unwrap()
    }

    async fn seed(store: &MemoryStore, teacher: &str, count: usize) {
        for idx in 0..count {
            store
                .insert_one(EVALUATIONS, record(teacher, 3 + (idx % 2) as i64))
                .await
                .unwrap();
        }
    }

    async fn seeded(count: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "t-1", count).await;
        store
    }

    fn service(store: Arc<MemoryStore>, total_budget: f64) -> StatisticsService {
        let tracker = Arc::new(PrivacyBudgetTracker::new(BudgetConfig {
            total_budget,
            ..BudgetConfig::default()
        }));
        StatisticsService::with_mechanism(
            store,
            tracker,
            AnonymityConfig::default(),
            LaplaceMechanism::seeded([1u8; 32]),
        )
    }

    #[tokio::test]
    async fn small_groups_are_suppressed_without_spending_budget() {
        let stats = service(seeded(4).await, 1.0);
        let response = stats.teacher_summary("t-1", None).await.unwrap();
        assert!(matches!(response, SummaryResponse::Suppressed { .. }));
        assert_eq!(stats.tracker.get_budget_status().queries_used, 0);
    }

    #[tokio::test]
    async fn released_summary_is_clamped_and_replayed() {
        let stats = service(seeded(12).await, 1.0);
        let first = stats.teacher_summary("t-1", Some(0.5)).await.unwrap();
        let SummaryResponse::Released { cached, summary, .. } = first else {
            panic!("expected a released summary");
        };
        assert!(!cached);
        for (_, mean) in summary["categories"].as_object().unwrap() {
            let mean = mean.as_f64().unwrap();
            assert!((RATING_MIN..=RATING_MAX).contains(&mean));
        }

        let again = stats.teacher_summary("t-1", Some(0.5)).await.unwrap();
        assert_eq!(
            again,
            SummaryResponse::Released {
                cached: true,
                summary,
                budget: stats.tracker.get_budget_status(),
            }
        );
    }

    #[tokio::test]
    async fn exhausted_budget_refuses() {
        let store = seeded(12).await;
        seed(&store, "t-2", 12).await;
        let stats = service(store, 0.1);
        assert!(matches!(
            stats.teacher_summary("t-1", Some(0.1)).await.unwrap(),
            SummaryResponse::Released { cached: false, .. }
        ));
        assert!(matches!(
            stats.teacher_summary("t-1", Some(0.1)).await.unwrap(),
            SummaryResponse::Released { cached: true, .. }
        ));

        let refused = stats.teacher_summary("t-2", Some(0.1)).await.unwrap();
        let SummaryResponse::Refused { message, budget } = refused else {
            panic!("expected a refusal");
        };
        assert!(message.contains("try again after"), "{message}");
        assert!(budget.budget_exhausted);
    }

    #[test]
    fn means_follow_categories() {
        let records: Vec<AnonymousEvaluationRecord> = [record("t-1", 2), record("t-1", 4)]
            .into_iter()
            .map(|doc| serde_json::from_value(doc).unwrap())
            .collect();
        assert_eq!(
            category_means(&records),
            vec![
                ("teaching", 3.0),
                ("classroomManagement", 3.0),
                ("studentEngagement", 3.0)
            ]
        );
    }
}
