//! # Sync Orchestrator
//!
//! Drives one sync run: every account in turn, and for each account every
//! entity kind in descriptor order. Failures are contained at the smallest
//! scope that can absorb them. A kind that fails keeps its watermark so the
//! next run resumes from the same point, and an account whose refresh token
//! was rejected still drains and persists.
//!
//! Per account the phases are:
//!
//! ```text
//! RefreshingCredential -> Syncing(companies) -> Syncing(contacts) -> Syncing(meetings) -> Draining -> Done
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tracing::{Instrument, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::analytics::AnalyticsSink;
use crate::config::SyncConfig;
use crate::credentials::CredentialManager;
use crate::crm::CrmApi;
use crate::error::SyncError;
use crate::models::Account;
use crate::repositories::AccountStore;
use crate::sync::associations::{AssociationResolver, ResolvedAssociations};
use crate::sync::entities::{EntityDescriptor, EntityKind, default_descriptors};
use crate::sync::fetcher::{DEFAULT_OFFSET_CAP, DEFAULT_PAGE_SIZE, PageFetcher, RetryPolicy, SyncWindow};
use crate::sync::sink::{BatchingSink, DEFAULT_FLUSH_THRESHOLD, SinkReport};
use crate::sync::transform::transform;

/// Tunables of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub page_size: u32,
    pub offset_cap: u64,
    pub retry: RetryPolicy,
    pub flush_threshold: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            offset_cap: DEFAULT_OFFSET_CAP,
            retry: RetryPolicy::default(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            offset_cap: config.offset_cap,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: Duration::from_millis(config.backoff_base_ms),
            },
            flush_threshold: config.flush_threshold,
        }
    }
}

/// Phase of an account's sync, used as the `operation` field in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountPhase {
    RefreshingCredential,
    Syncing(EntityKind),
    Draining,
    Done,
}

impl std::fmt::Display for AccountPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountPhase::RefreshingCredential => f.write_str("refresh_credential"),
            AccountPhase::Syncing(kind) => write!(f, "sync_{kind}"),
            AccountPhase::Draining => f.write_str("drain"),
            AccountPhase::Done => f.write_str("done"),
        }
    }
}

/// Counters of one successful pass over an entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub started_at: DateTime<Utc>,
    pub pages: usize,
    pub records: usize,
    pub events: usize,
    pub suppressed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KindOutcome {
    Synced(PassStats),
    Failed { error: String },
    /// Not attempted because the account's credential was rejected.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KindReport {
    pub kind: EntityKind,
    pub outcome: KindOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountReport {
    pub hub_id: i64,
    pub credential_rejected: bool,
    pub kinds: Vec<KindReport>,
    pub sink: SinkReport,
}

impl AccountReport {
    pub fn outcome(&self, kind: EntityKind) -> Option<&KindOutcome> {
        self.kinds
            .iter()
            .find(|report| report.kind == kind)
            .map(|report| &report.outcome)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub accounts: Vec<AccountReport>,
}

impl RunSummary {
    pub fn events_flushed(&self) -> usize {
        self.accounts
            .iter()
            .map(|account| account.sink.events_submitted)
            .sum()
    }

    pub fn failed_kinds(&self) -> usize {
        self.accounts
            .iter()
            .flat_map(|account| account.kinds.iter())
            .filter(|report| matches!(report.outcome, KindOutcome::Failed { .. }))
            .count()
    }

    pub fn account(&self, hub_id: i64) -> Option<&AccountReport> {
        self.accounts.iter().find(|account| account.hub_id == hub_id)
    }
}

pub struct SyncOrchestrator {
    crm: Arc<dyn CrmApi>,
    store: Arc<dyn AccountStore>,
    analytics: Arc<dyn AnalyticsSink>,
    credentials: CredentialManager,
    resolver: AssociationResolver,
    descriptors: Vec<EntityDescriptor>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        crm: Arc<dyn CrmApi>,
        store: Arc<dyn AccountStore>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        Self {
            credentials: CredentialManager::new(crm.clone()),
            resolver: AssociationResolver::new(crm.clone()),
            crm,
            store,
            analytics,
            descriptors: default_descriptors(),
            settings: SyncSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_descriptors(mut self, descriptors: Vec<EntityDescriptor>) -> Self {
        self.descriptors = descriptors;
        self
    }

    /// Sync every account sequentially.
    ///
    /// Only a failure to list accounts is returned as an error; everything
    /// after that is logged and reported in the summary.
    pub async fn run(&self) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);

        async move {
            let started = Instant::now();
            let accounts = self.store.find_accounts().await?;
            info!(accounts = accounts.len(), "starting sync run");

            let mut reports = Vec::with_capacity(accounts.len());
            for account in accounts {
                reports.push(self.sync_account(account).await);
            }

            let summary = RunSummary {
                run_id,
                accounts: reports,
            };
            info!(
                accounts = summary.accounts.len(),
                events = summary.events_flushed(),
                failed_kinds = summary.failed_kinds(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sync run finished"
            );
            Ok::<_, SyncError>(summary)
        }
        .instrument(span)
        .await
    }

    #[instrument(skip_all, fields(hub_id = account.hub_id))]
    async fn sync_account(&self, mut account: Account) -> AccountReport {
        let hub_id = account.hub_id;
        let mut credential_rejected = false;

        let phase = AccountPhase::RefreshingCredential;
        match self.credentials.refresh(&mut account.credentials).await {
            Ok(_) => {}
            Err(err) if err.is_auth() => {
                credential_rejected = true;
                error!(hub_id, operation = %phase, error = %err, "credential rejected, skipping entity syncs");
            }
            Err(err) => {
                warn!(hub_id, operation = %phase, error = %err, "credential refresh failed, continuing");
            }
        }

        let mut sink = BatchingSink::spawn(self.analytics.clone(), self.settings.flush_threshold);
        let mut kinds = Vec::with_capacity(self.descriptors.len());

        for descriptor in &self.descriptors {
            let kind = descriptor.kind;
            if credential_rejected {
                kinds.push(KindReport {
                    kind,
                    outcome: KindOutcome::Skipped,
                });
                continue;
            }

            let phase = AccountPhase::Syncing(kind);
            let outcome = match self.sync_entity(&mut account, descriptor, &mut sink).await {
                Ok(stats) => {
                    account.advance_watermark(descriptor.watermark_key, stats.started_at);
                    self.persist(&account, phase).await;
                    KindOutcome::Synced(stats)
                }
                Err(err) => {
                    counter!("crm_sync_entity_failures_total", "entity_kind" => kind.as_str())
                        .increment(1);
                    error!(
                        hub_id,
                        operation = %phase,
                        entity_kind = %kind,
                        error = %err,
                        "entity sync failed"
                    );
                    KindOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            kinds.push(KindReport { kind, outcome });
        }

        let sink = sink.drain().await;
        self.persist(&account, AccountPhase::Draining).await;

        info!(
            hub_id,
            operation = %AccountPhase::Done,
            events = sink.events_submitted,
            failed_batches = sink.failed_batches,
            "account sync finished"
        );

        AccountReport {
            hub_id,
            credential_rejected,
            kinds,
            sink,
        }
    }

    /// One pass over `descriptor`'s kind from its watermark up to now.
    #[instrument(skip_all, fields(entity_kind = %descriptor.kind))]
    async fn sync_entity(
        &self,
        account: &mut Account,
        descriptor: &EntityDescriptor,
        sink: &mut BatchingSink,
    ) -> Result<PassStats, SyncError> {
        let kind = descriptor.kind;
        let timer = Instant::now();
        let started_at = Utc::now();
        let watermark = account.watermark(descriptor.watermark_key);

        let window = SyncWindow::new(
            kind,
            watermark.unwrap_or(DateTime::UNIX_EPOCH),
            started_at,
        );
        let mut fetcher = PageFetcher::new(self.crm.as_ref(), &self.credentials, descriptor, window)
            .with_page_size(self.settings.page_size)
            .with_offset_cap(self.settings.offset_cap)
            .with_retry(self.settings.retry);

        let mut stats = PassStats {
            started_at,
            pages: 0,
            records: 0,
            events: 0,
            suppressed: 0,
        };

        while let Some(records) = fetcher.next_batch(&mut account.credentials).await? {
            stats.pages += 1;
            stats.records += records.len();

            let associations = match descriptor.associations {
                Some(association) => {
                    let ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();
                    self.resolver
                        .resolve(association, &account.credentials.access_token, &ids)
                        .await
                        .map_err(|source| SyncError::Association { kind, source })?
                }
                None => ResolvedAssociations::None,
            };

            for record in &records {
                match transform(descriptor, record, watermark, &associations) {
                    Some(event) => {
                        sink.push(event);
                        stats.events += 1;
                    }
                    None => stats.suppressed += 1,
                }
            }
        }

        counter!("crm_sync_events_emitted_total", "entity_kind" => kind.as_str())
            .increment(stats.events as u64);
        counter!("crm_sync_events_suppressed_total", "entity_kind" => kind.as_str())
            .increment(stats.suppressed as u64);
        histogram!("crm_sync_pass_duration_seconds", "entity_kind" => kind.as_str())
            .record(timer.elapsed().as_secs_f64());

        info!(
            hub_id = account.hub_id,
            entity_kind = %kind,
            pages = stats.pages,
            records = stats.records,
            events = stats.events,
            suppressed = stats.suppressed,
            "entity pass complete"
        );
        Ok(stats)
    }

    async fn persist(&self, account: &Account, phase: AccountPhase) {
        if let Err(err) = self.store.persist(account).await {
            error!(
                hub_id = account.hub_id,
                operation = %phase,
                error = %err,
                "failed to persist account"
            );
        }
    }
}
