//! Test utilities shared by the integration tests.
//!
//! [`FakeCrm`] is an in-process CRM that honours the search filters, the
//! object id sort and the numeric `after` cursor (including the 10 000 result ceiling), serves
//! associations from fixtures and can inject failures. [`RecordingSink`]
//! captures analytics batches. [`setup_test_db`] opens an in-memory SQLite
//! database with migrations applied.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_sync::analytics::{AnalyticsSink, SinkError};
use crm_sync::crm::{
    AssociatedId, AssociationResult, CrmApi, CrmError, CrmObject, Filter, FilterOperator,
    NextPage, OBJECT_ID_PROPERTY, ObjectType, Paging, RawRecord, SearchPage, SearchRequest,
    TokenGrant,
};
use crm_sync::sync::fetcher::RetryPolicy;
use crm_sync::sync::{OutputEvent, SyncSettings};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Map, Value, json};

/// Offset past which the fake search endpoint refuses to page.
pub const SEARCH_RESULT_LIMIT: u64 = 10_000;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Sets up an in-memory SQLite database with all migrations applied and returns an Arc.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

/// Default settings with no backoff delay so retry paths run instantly.
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        },
        ..SyncSettings::default()
    }
}

/// How the fake token endpoint answers refresh requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    /// Grant a new token valid for `expires_in` seconds (may be negative).
    Grant { expires_in: i64 },
    /// Reject the refresh token (provider says `invalid_grant`).
    Reject,
    /// Transport failure.
    Fail,
}

#[derive(Default)]
struct FakeState {
    records: HashMap<ObjectType, Vec<RawRecord>>,
    contact_companies: HashMap<String, String>,
    meeting_contacts: HashMap<String, String>,
    search_failures: HashMap<ObjectType, usize>,
    failing_associations: HashSet<ObjectType>,
    search_tokens: Vec<String>,
    search_calls: HashMap<ObjectType, usize>,
    association_calls: usize,
    batch_read_calls: usize,
    refreshes: usize,
}

pub struct FakeCrm {
    state: Mutex<FakeState>,
    refresh: Mutex<RefreshBehavior>,
}

impl Default for FakeCrm {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCrm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            refresh: Mutex::new(RefreshBehavior::Grant { expires_in: 1800 }),
        }
    }

    pub fn with_records(self, object: ObjectType, records: Vec<RawRecord>) -> Self {
        self.add_records(object, records);
        self
    }

    pub fn add_records(&self, object: ObjectType, records: Vec<RawRecord>) {
        self.state
            .lock()
            .unwrap()
            .records
            .entry(object)
            .or_default()
            .extend(records);
    }

    pub fn with_contact_company(self, contact_id: &str, company_id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .contact_companies
            .insert(contact_id.to_string(), company_id.to_string());
        self
    }

    pub fn with_meeting_contact(self, meeting_id: &str, contact_id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .meeting_contacts
            .insert(meeting_id.to_string(), contact_id.to_string());
        self
    }

    /// Fail the next `times` searches of `object`; `usize::MAX` fails forever.
    pub fn with_search_failures(self, object: ObjectType, times: usize) -> Self {
        self.state
            .lock()
            .unwrap()
            .search_failures
            .insert(object, times);
        self
    }

    pub fn with_failing_associations(self, from: ObjectType) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_associations
            .insert(from);
        self
    }

    pub fn with_refresh(self, behavior: RefreshBehavior) -> Self {
        *self.refresh.lock().unwrap() = behavior;
        self
    }

    pub fn search_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().search_tokens.clone()
    }

    pub fn search_calls(&self, object: ObjectType) -> usize {
        self.state
            .lock()
            .unwrap()
            .search_calls
            .get(&object)
            .copied()
            .unwrap_or(0)
    }

    pub fn association_calls(&self) -> usize {
        self.state.lock().unwrap().association_calls
    }

    pub fn batch_read_calls(&self) -> usize {
        self.state.lock().unwrap().batch_read_calls
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().unwrap().refreshes
    }
}

/// Numeric ids compare as numbers, anything else lexically.
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn matches_filter(record: &RawRecord, filter: &Filter) -> bool {
    if filter.property_name == OBJECT_ID_PROPERTY {
        let ordering = compare_ids(&record.id, &filter.value);
        return match filter.operator {
            FilterOperator::Eq => ordering == Ordering::Equal,
            FilterOperator::Gt => ordering == Ordering::Greater,
            FilterOperator::Gte => ordering != Ordering::Less,
            FilterOperator::Lte => ordering != Ordering::Greater,
        };
    }

    let Ok(value) = filter.value.parse::<i64>() else {
        return false;
    };
    let modified = record.updated_at.timestamp_millis();
    match filter.operator {
        FilterOperator::Eq => modified == value,
        FilterOperator::Gt => modified > value,
        FilterOperator::Gte => modified >= value,
        FilterOperator::Lte => modified <= value,
    }
}

fn server_error() -> CrmError {
    CrmError::Api {
        status: 502,
        message: "bad gateway".to_string(),
    }
}

#[async_trait]
impl CrmApi for FakeCrm {
    async fn search(
        &self,
        access_token: &str,
        object: ObjectType,
        request: &SearchRequest,
    ) -> Result<SearchPage, CrmError> {
        let mut state = self.state.lock().unwrap();
        state.search_tokens.push(access_token.to_string());
        *state.search_calls.entry(object).or_default() += 1;

        if let Some(remaining) = state.search_failures.get_mut(&object)
            && *remaining > 0
        {
            if *remaining != usize::MAX {
                *remaining -= 1;
            }
            return Err(server_error());
        }

        let offset: u64 = match &request.after {
            Some(after) => after.parse().map_err(|_| CrmError::Api {
                status: 400,
                message: format!("invalid after cursor {after}"),
            })?,
            None => 0,
        };
        if offset >= SEARCH_RESULT_LIMIT {
            return Err(CrmError::Api {
                status: 400,
                message: "search results are limited to 10000".to_string(),
            });
        }

        let filters: Vec<&Filter> = request
            .filter_groups
            .iter()
            .flat_map(|group| group.filters.iter())
            .collect();
        let by_object_id = request
            .sorts
            .first()
            .is_some_and(|sort| sort.property_name == OBJECT_ID_PROPERTY);

        let mut matching: Vec<&RawRecord> = state
            .records
            .get(&object)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| filters.iter().all(|filter| matches_filter(record, filter)))
                    .collect()
            })
            .unwrap_or_default();
        if by_object_id {
            matching.sort_by(|a, b| compare_ids(&a.id, &b.id));
        } else {
            matching.sort_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| compare_ids(&a.id, &b.id))
            });
        }

        let start = offset as usize;
        let end = (start + request.limit as usize).min(matching.len());
        let results: Vec<RawRecord> = matching
            .get(start..end)
            .map(|page| page.iter().map(|record| (*record).clone()).collect())
            .unwrap_or_default();
        let paging = (end < matching.len()).then(|| Paging {
            next: Some(NextPage {
                after: end.to_string(),
            }),
        });

        Ok(SearchPage { results, paging })
    }

    async fn batch_read_associations(
        &self,
        _access_token: &str,
        from: ObjectType,
        _to: ObjectType,
        ids: &[String],
    ) -> Result<Vec<AssociationResult>, CrmError> {
        let mut state = self.state.lock().unwrap();
        state.association_calls += 1;
        if state.failing_associations.contains(&from) {
            return Err(server_error());
        }

        let links = match from {
            ObjectType::Contacts => &state.contact_companies,
            ObjectType::Meetings => &state.meeting_contacts,
            ObjectType::Companies => return Ok(Vec::new()),
        };

        Ok(ids
            .iter()
            .filter_map(|id| {
                links.get(id).map(|target| AssociationResult {
                    from: Some(AssociatedId { id: id.clone() }),
                    to: vec![AssociatedId { id: target.clone() }],
                })
            })
            .collect())
    }

    async fn batch_read(
        &self,
        _access_token: &str,
        object: ObjectType,
        ids: &[String],
        properties: &[&str],
    ) -> Result<Vec<CrmObject>, CrmError> {
        let mut state = self.state.lock().unwrap();
        state.batch_read_calls += 1;

        let records = state.records.get(&object).cloned().unwrap_or_default();
        Ok(records
            .into_iter()
            .filter(|record| ids.contains(&record.id))
            .map(|record| {
                let mut selected = Map::new();
                for property in properties {
                    if let Some(value) = record.property_value(property) {
                        selected.insert(property.to_string(), value.clone());
                    }
                }
                CrmObject {
                    id: record.id,
                    properties: selected,
                }
            })
            .collect())
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, CrmError> {
        let behavior = *self.refresh.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.refreshes += 1;

        match behavior {
            RefreshBehavior::Grant { expires_in } => Ok(TokenGrant {
                access_token: format!("{refresh_token}-access-{}", state.refreshes),
                refresh_token: None,
                expires_in,
            }),
            RefreshBehavior::Reject => Err(CrmError::Unauthorized {
                status: 400,
                message: "invalid_grant".to_string(),
            }),
            RefreshBehavior::Fail => Err(server_error()),
        }
    }
}

/// Analytics sink that keeps every submitted batch.
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<OutputEvent>>>,
    reject: bool,
}

impl RecordingSink {
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }

    pub fn batches(&self) -> Vec<Vec<OutputEvent>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl AnalyticsSink for RecordingSink {
    async fn submit(&self, events: Vec<OutputEvent>) -> Result<(), SinkError> {
        self.batches.lock().unwrap().push(events);
        if self.reject {
            return Err(SinkError::Rejected {
                status: 503,
                body: "ingest unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn record(id: &str, created_at: DateTime<Utc>, updated_at: DateTime<Utc>, properties: Value) -> RawRecord {
    RawRecord {
        id: id.to_string(),
        created_at,
        updated_at,
        properties: properties.as_object().cloned(),
    }
}

pub fn company(id: &str, domain: &str, at: DateTime<Utc>) -> RawRecord {
    record(id, at, at, json!({"name": id, "domain": domain, "industry": "SOFTWARE"}))
}

pub fn contact(id: &str, email: Option<&str>, at: DateTime<Utc>) -> RawRecord {
    record(
        id,
        at,
        at,
        json!({
            "email": email,
            "firstname": "Test",
            "lastname": id,
            "hubspotscore": "12",
        }),
    )
}

pub fn meeting(id: &str, title: &str, at: DateTime<Utc>) -> RawRecord {
    record(
        id,
        at,
        at,
        json!({
            "hs_meeting_title": title,
            "hs_meeting_start_time": "2024-06-01T09:00:00Z",
            "hs_meeting_end_time": "2024-06-01T09:30:00Z",
        }),
    )
}
