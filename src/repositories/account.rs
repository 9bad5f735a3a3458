//! # Account Repository
//!
//! Loads and saves [`Account`]s, including their credential pair and the
//! per-kind watermark map (stored as a JSON object of RFC 3339 instants).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, QueryOrder, Set};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::crm_account::{self, ActiveModel as CrmAccountActiveModel, Entity as CrmAccount};
use crate::models::{Account, Credentials, Watermarks};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("account {hub_id} has malformed watermarks: {source}")]
    InvalidWatermarks {
        hub_id: i64,
        #[source]
        source: serde_json::Error,
    },
}

/// Whether `persist` writes through or is a no-op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistenceMode {
    #[default]
    Enabled,
    /// Reads still hit the store; writes are skipped. Used for dry runs.
    Disabled,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_accounts(&self) -> Result<Vec<Account>, StoreError>;

    async fn persist(&self, account: &Account) -> Result<(), StoreError>;
}

/// SeaORM-backed account store over the `crm_accounts` table.
pub struct DbAccountStore {
    db: Arc<DatabaseConnection>,
    mode: PersistenceMode,
}

impl DbAccountStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            mode: PersistenceMode::Enabled,
        }
    }

    pub fn with_mode(mut self, mode: PersistenceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> PersistenceMode {
        self.mode
    }

    /// Insert a new account row regardless of persistence mode.
    pub async fn insert(&self, account: &Account) -> Result<(), StoreError> {
        let now = Utc::now();
        CrmAccountActiveModel {
            hub_id: Set(account.hub_id),
            access_token: Set(account.credentials.access_token.clone()),
            refresh_token: Set(account.credentials.refresh_token.clone()),
            expires_at: Set(account.credentials.expires_at.map(Into::into)),
            last_pulled_dates: Set(encode_watermarks(&account.watermarks)),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for DbAccountStore {
    async fn find_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = CrmAccount::find()
            .order_by_asc(crm_account::Column::HubId)
            .all(self.db.as_ref())
            .await?;

        rows.into_iter().map(account_from_model).collect()
    }

    async fn persist(&self, account: &Account) -> Result<(), StoreError> {
        if self.mode == PersistenceMode::Disabled {
            debug!(hub_id = account.hub_id, "persistence disabled, skipping write");
            return Ok(());
        }

        let existing = CrmAccount::find_by_id(account.hub_id)
            .one(self.db.as_ref())
            .await?;

        let Some(existing) = existing else {
            return self.insert(account).await;
        };

        let mut active: CrmAccountActiveModel = existing.into();
        active.access_token = Set(account.credentials.access_token.clone());
        active.refresh_token = Set(account.credentials.refresh_token.clone());
        active.expires_at = Set(account.credentials.expires_at.map(Into::into));
        active.last_pulled_dates = Set(encode_watermarks(&account.watermarks));
        active.updated_at = Set(Utc::now().into());
        active.update(self.db.as_ref()).await?;

        debug!(hub_id = account.hub_id, "persisted account");
        Ok(())
    }
}

fn encode_watermarks(watermarks: &Watermarks) -> serde_json::Value {
    serde_json::Value::Object(
        watermarks
            .iter()
            .map(|(key, instant)| (key.clone(), serde_json::Value::String(instant.to_rfc3339())))
            .collect(),
    )
}

fn account_from_model(model: crm_account::Model) -> Result<Account, StoreError> {
    let watermarks = if model.last_pulled_dates.is_null() {
        Watermarks::new()
    } else {
        serde_json::from_value(model.last_pulled_dates).map_err(|source| {
            StoreError::InvalidWatermarks {
                hub_id: model.hub_id,
                source,
            }
        })?
    };

    let mut credentials = Credentials::new(model.access_token, model.refresh_token);
    credentials.expires_at = model.expires_at.map(|at| at.with_timezone(&Utc));

    Ok(Account {
        hub_id: model.hub_id,
        credentials,
        watermarks,
    })
}

/// Process-local store for tests and embedding.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Mutex<Vec<Account>>,
    mode: PersistenceMode,
    writes: AtomicUsize,
}

impl InMemoryAccountStore {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: PersistenceMode) -> Self {
        self.mode = mode;
        self
    }

    pub async fn get(&self, hub_id: i64) -> Option<Account> {
        self.accounts
            .lock()
            .await
            .iter()
            .find(|account| account.hub_id == hub_id)
            .cloned()
    }

    /// Number of `persist` calls that wrote through.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.accounts.lock().await.clone())
    }

    async fn persist(&self, account: &Account) -> Result<(), StoreError> {
        if self.mode == PersistenceMode::Disabled {
            return Ok(());
        }

        let mut accounts = self.accounts.lock().await;
        match accounts.iter_mut().find(|stored| stored.hub_id == account.hub_id) {
            Some(stored) => *stored = account.clone(),
            None => accounts.push(account.clone()),
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn watermarks_round_trip_through_json_column() {
        let mut watermarks = Watermarks::new();
        watermarks.insert("contacts".to_string(), "2024-05-01T12:00:00Z".parse().unwrap());

        let encoded = encode_watermarks(&watermarks);
        assert_eq!(encoded, json!({"contacts": "2024-05-01T12:00:00+00:00"}));

        let model = crm_account::Model {
            hub_id: 7,
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: None,
            last_pulled_dates: encoded,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        };
        let account = account_from_model(model).unwrap();
        assert_eq!(account.watermarks, watermarks);
        assert_eq!(account.credentials.expires_at, None);
    }

    #[test]
    fn malformed_watermarks_are_reported() {
        let model = crm_account::Model {
            hub_id: 9,
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: None,
            last_pulled_dates: json!({"contacts": "yesterday"}),
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        };
        let err = account_from_model(model).unwrap_err();
        assert!(matches!(err, StoreError::InvalidWatermarks { hub_id: 9, .. }));
    }

    #[tokio::test]
    async fn in_memory_store_respects_disabled_mode() {
        let store = InMemoryAccountStore::new(vec![Account::new(1, Credentials::new("a", "r"))])
            .with_mode(PersistenceMode::Disabled);
        let mut account = store.get(1).await.unwrap();
        account.credentials.access_token = "changed".to_string();

        store.persist(&account).await.unwrap();
        assert_eq!(store.writes(), 0);
        assert_eq!(store.get(1).await.unwrap().credentials.access_token, "a");
    }
}
