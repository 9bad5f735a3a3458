//! # Error Handling
//!
//! Error taxonomy of the sync engine. Each variant maps onto the scope it is
//! contained at: `Auth` aborts the account's syncing states, `FetchExhausted`
//! and `Association` abort a single entity kind, `Store` and `Crm` are logged
//! by the orchestrator and never escalate past the account.

use thiserror::Error;

use crate::crm::CrmError;
use crate::repositories::account::StoreError;
use crate::sync::entities::EntityKind;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The provider rejected the refresh token.
    #[error("credential refresh rejected: {0}")]
    Auth(#[source] CrmError),

    #[error("failed to fetch {kind} after {attempts} attempts: {last_error}")]
    FetchExhausted {
        kind: EntityKind,
        attempts: u32,
        #[source]
        last_error: CrmError,
    },

    #[error("failed to resolve {kind} associations: {source}")]
    Association {
        kind: EntityKind,
        #[source]
        source: CrmError,
    },

    #[error("account store error: {0}")]
    Store(#[from] StoreError),

    /// Transport-level failure of a CRM call that is not a credential rejection.
    #[error("CRM {operation} failed: {source}")]
    Crm {
        operation: &'static str,
        #[source]
        source: CrmError,
    },
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}
