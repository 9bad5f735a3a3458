//! Credential Manager
//!
//! Exchanges an account's refresh token for a fresh access token. Called once
//! per account before syncing and again from the fetch retry loop whenever a
//! request failed after the stored expiry.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::{info, instrument, warn};

use crate::crm::{CrmApi, CrmError};
use crate::error::SyncError;
use crate::models::Credentials;

/// Refreshes per-account OAuth credentials through the CRM's token endpoint.
#[derive(Clone)]
pub struct CredentialManager {
    crm: Arc<dyn CrmApi>,
}

impl CredentialManager {
    pub fn new(crm: Arc<dyn CrmApi>) -> Self {
        Self { crm }
    }

    /// Exchange the stored refresh token and replace the access token and
    /// expiry in place. Safe to call before expiry.
    ///
    /// A rejected refresh token yields [`SyncError::Auth`]; it is never retried.
    #[instrument(skip_all)]
    pub async fn refresh(&self, credentials: &mut Credentials) -> Result<String, SyncError> {
        counter!("crm_sync_credential_refresh_attempts_total").increment(1);

        match self
            .crm
            .refresh_access_token(&credentials.refresh_token)
            .await
        {
            Ok(grant) => {
                let Some(expires_at) = Duration::try_seconds(grant.expires_in)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                else {
                    counter!("crm_sync_credential_refresh_failure_total").increment(1);
                    return Err(SyncError::Crm {
                        operation: "refresh_access_token",
                        source: CrmError::InvalidGrant {
                            expires_in: grant.expires_in,
                        },
                    });
                };
                credentials.access_token = grant.access_token;
                if let Some(refresh_token) = grant.refresh_token {
                    credentials.refresh_token = refresh_token;
                }
                credentials.expires_at = Some(expires_at);

                counter!("crm_sync_credential_refresh_success_total").increment(1);
                info!(expires_at = %expires_at, "refreshed access token");
                Ok(credentials.access_token.clone())
            }
            Err(err) if err.is_auth_rejection() => {
                counter!("crm_sync_credential_refresh_rejected_total").increment(1);
                warn!(error = %err, "refresh token rejected by provider");
                Err(SyncError::Auth(err))
            }
            Err(err) => {
                counter!("crm_sync_credential_refresh_failure_total").increment(1);
                Err(SyncError::Crm {
                    operation: "refresh_access_token",
                    source: err,
                })
            }
        }
    }

    /// Whether `credentials` should be refreshed before the next request.
    pub fn needs_refresh(credentials: &Credentials, now: DateTime<Utc>) -> bool {
        credentials.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{
        AssociationResult, CrmError, CrmObject, ObjectType, SearchPage, SearchRequest, TokenGrant,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct TokenEndpoint {
        responses: Mutex<Vec<Result<TokenGrant, CrmError>>>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CrmApi for TokenEndpoint {
        async fn search(
            &self,
            _access_token: &str,
            _object: ObjectType,
            _request: &SearchRequest,
        ) -> Result<SearchPage, CrmError> {
            unreachable!("search is not used by credential tests")
        }

        async fn batch_read_associations(
            &self,
            _access_token: &str,
            _from: ObjectType,
            _to: ObjectType,
            _ids: &[String],
        ) -> Result<Vec<AssociationResult>, CrmError> {
            unreachable!("associations are not used by credential tests")
        }

        async fn batch_read(
            &self,
            _access_token: &str,
            _object: ObjectType,
            _ids: &[String],
            _properties: &[&str],
        ) -> Result<Vec<CrmObject>, CrmError> {
            unreachable!("batch reads are not used by credential tests")
        }

        async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, CrmError> {
            self.seen.lock().unwrap().push(refresh_token.to_string());
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn manager(responses: Vec<Result<TokenGrant, CrmError>>) -> (CredentialManager, Arc<TokenEndpoint>) {
        let endpoint = Arc::new(TokenEndpoint {
            responses: Mutex::new(responses),
            seen: Mutex::new(Vec::new()),
        });
        (CredentialManager::new(endpoint.clone()), endpoint)
    }

    #[tokio::test]
    async fn refresh_replaces_access_token_and_expiry() {
        let (manager, endpoint) = manager(vec![Ok(TokenGrant {
            access_token: "fresh".to_string(),
            refresh_token: None,
            expires_in: 1800,
        })]);
        let mut credentials = Credentials::new("stale", "refresh-1");

        let before = Utc::now();
        let token = manager.refresh(&mut credentials).await.expect("refresh");

        assert_eq!(token, "fresh");
        assert_eq!(credentials.access_token, "fresh");
        assert_eq!(credentials.refresh_token, "refresh-1");
        let expires_at = credentials.expires_at.expect("expiry set");
        assert!(expires_at >= before + Duration::seconds(1800));
        assert!(!CredentialManager::needs_refresh(&credentials, Utc::now()));
        assert_eq!(endpoint.seen.lock().unwrap().as_slice(), ["refresh-1"]);
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_stored() {
        let (manager, _) = manager(vec![Ok(TokenGrant {
            access_token: "fresh".to_string(),
            refresh_token: Some("refresh-2".to_string()),
            expires_in: 60,
        })]);
        let mut credentials = Credentials::new("stale", "refresh-1");

        manager.refresh(&mut credentials).await.expect("refresh");
        assert_eq!(credentials.refresh_token, "refresh-2");
    }

    #[tokio::test]
    async fn rejection_surfaces_auth_error_and_keeps_credentials() {
        let (manager, _) = manager(vec![Err(CrmError::Unauthorized {
            status: 400,
            message: "BAD_REFRESH_TOKEN".to_string(),
        })]);
        let mut credentials = Credentials::new("stale", "revoked");

        let err = manager.refresh(&mut credentials).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(credentials.access_token, "stale");
    }

    #[tokio::test]
    async fn transport_failure_is_not_an_auth_error() {
        let (manager, _) = manager(vec![Err(CrmError::Api {
            status: 503,
            message: "unavailable".to_string(),
        })]);
        let mut credentials = Credentials::new("stale", "refresh-1");

        let err = manager.refresh(&mut credentials).await.unwrap_err();
        assert!(matches!(err, SyncError::Crm { operation: "refresh_access_token", .. }));
    }

    #[tokio::test]
    async fn out_of_range_expiry_is_an_error() {
        let (manager, _) = manager(vec![
            Ok(TokenGrant {
                access_token: "fresh".to_string(),
                refresh_token: None,
                expires_in: i64::MAX,
            }),
            Ok(TokenGrant {
                access_token: "fresh".to_string(),
                refresh_token: None,
                expires_in: i64::MAX / 1_000,
            }),
        ]);
        let mut credentials = Credentials::new("stale", "refresh-1");

        for _ in 0..2 {
            let err = manager.refresh(&mut credentials).await.unwrap_err();
            assert!(!err.is_auth());
            assert!(matches!(
                err,
                SyncError::Crm {
                    source: CrmError::InvalidGrant { .. },
                    ..
                }
            ));
        }
        assert_eq!(credentials.access_token, "stale");
        assert_eq!(credentials.expires_at, None);
    }
}
