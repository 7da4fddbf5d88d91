//! Wiring for one evalguard deployment.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//!
//! use evalguard_service::config::Config;
//! use evalguard_service::platform::Platform;
//! use evalguard_service::store::MemoryStore;
//!
//! let platform = Platform::new(&Config::sample(), Arc::new(MemoryStore::new())).unwrap();
//! let status = platform.budget_status();
//! assert_eq!(status.total_budget, 10.0);
//! assert_eq!(status.queries_used, 0);
//! ```

use std::fmt;
use std::sync::Arc;

use evalguard_audit::{AuditContext, AuditReport, AuditSettings, PrivacyAuditor};
use evalguard_crypto::{CipherResult, EnvelopeCipher};
use evalguard_privacy::{
    AnonymityConfig, BudgetStatus, Clock, LedgerEntry, PrivacyBudgetTracker, QueryOutcome,
    QueryRequest, SystemClock,
};
use serde_json::Value;
use tracing::info;

use crate::config::Config;
use crate::stats::StatisticsService;
use crate::store::{DocumentStore, Filter, StoreResult, ENROLLMENTS, EVALUATIONS};
use crate::submission::SubmissionService;

pub struct Platform {
    store: Arc<dyn DocumentStore>,
    cipher: EnvelopeCipher,
    anonymity: AnonymityConfig,
    audit: AuditSettings,
    require_comment_encryption: bool,
    tracker: Arc<PrivacyBudgetTracker>,
    auditor: PrivacyAuditor,
    submissions: SubmissionService,
    statistics: StatisticsService,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("cipher", &self.cipher)
            .field("require_comment_encryption", &self.require_comment_encryption)
            .finish_non_exhaustive()
    }
}

impl Platform {
    pub fn new(config: &Config, store: Arc<dyn DocumentStore>) -> CipherResult<Self> {
        let cipher = config.encryption.cipher()?;
        Ok(Self::assemble(config, store, cipher, Arc::new(SystemClock)))
    }

    /// Explicit cipher and clock, for tests and tooling.
    pub fn assemble(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        cipher: EnvelopeCipher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tracker = Arc::new(PrivacyBudgetTracker::with_clock(
            config.budget.clone(),
            Arc::clone(&clock),
        ));
        let require = config.encryption.require_comment_encryption;
        info!(
            encryption = cipher.is_configured(),
            require_comment_encryption = require,
            "evalguard platform assembled"
        );
        Self {
            submissions: SubmissionService::new(
                Arc::clone(&store),
                cipher.clone(),
                config.anonymity.clone(),
                require,
                clock,
            ),
            statistics: StatisticsService::new(
                Arc::clone(&store),
                Arc::clone(&tracker),
                config.anonymity.clone(),
            ),
            store,
            cipher,
            anonymity: config.anonymity.clone(),
            audit: config.audit.clone(),
            require_comment_encryption: require,
            tracker,
            auditor: PrivacyAuditor::standard(),
        }
    }

    pub fn submissions(&self) -> &SubmissionService {
        &self.submissions
    }

    pub fn statistics(&self) -> &StatisticsService {
        &self.statistics
    }

    pub fn cipher(&self) -> &EnvelopeCipher {
        &self.cipher
    }

    pub fn tracker(&self) -> &Arc<PrivacyBudgetTracker> {
        &self.tracker
    }

    /// Audits configuration, the live toolkit and every stored record.
    pub async fn run_privacy_audit(&self) -> StoreResult<AuditReport> {
        let evaluations = self.store.find(EVALUATIONS, &Filter::new()).await?;
        let enrollments = self.store.find(ENROLLMENTS, &Filter::new()).await?;
        let ctx = AuditContext::new(&self.cipher, &self.anonymity, &self.audit)
            .with_tracker(&self.tracker)
            .require_comment_encryption(self.require_comment_encryption)
            .with_records(&evaluations, &enrollments);
        Ok(self.auditor.generate_report(&ctx))
    }

    pub fn budget_status(&self) -> BudgetStatus {
        self.tracker.get_budget_status()
    }

    pub fn budget_ledger(&self) -> Vec<LedgerEntry> {
        self.tracker.ledger()
    }

    /// Generic entry point for aggregate reads. `compute` receives the
    /// epsilon to spend and must return an already-noised answer.
    pub fn execute_query<F, E>(&self, request: &QueryRequest, compute: F) -> QueryOutcome
    where
        F: FnOnce(f64) -> Result<Value, E>,
        E: fmt::Display,
    {
        self.tracker.execute_query(request, compute)
    }
}
