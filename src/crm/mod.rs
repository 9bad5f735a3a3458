//! CRM API surface
//!
//! Defines the [`CrmApi`] trait the sync engine drives, together with the
//! request/response shapes of the CRM v3 search, association and batch-read
//! endpoints. The concrete HTTP client lives in [`hubspot`].

pub mod hubspot;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use hubspot::{HubSpotClient, HubSpotConfig};

/// CRM object types touched by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Companies,
    Contacts,
    Meetings,
}

impl ObjectType {
    /// Path segment used by the CRM v3 object endpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Companies => "companies",
            ObjectType::Contacts => "contacts",
            ObjectType::Meetings => "meetings",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a CRM API implementation.
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("CRM rejected credentials with status {status}: {message}")]
    Unauthorized { status: u16, message: String },

    #[error("CRM request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("rate limited by CRM (retry after: {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("malformed CRM response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("token grant expiry of {expires_in}s is out of range")]
    InvalidGrant { expires_in: i64 },
}

impl CrmError {
    /// True when the provider refused the presented credential.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, CrmError::Unauthorized { .. })
    }
}

/// Comparison operators supported in search filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterOperator {
    Eq,
    Gt,
    Gte,
    Lte,
}

/// Unique numeric id property every CRM object carries.
pub const OBJECT_ID_PROPERTY: &str = "hs_object_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub property_name: String,
    pub operator: FilterOperator,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sort {
    pub property_name: String,
    pub direction: SortDirection,
}

/// Body of a `POST /crm/v3/objects/{type}/search` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub filter_groups: Vec<FilterGroup>,
    pub sorts: Vec<Sort>,
    pub properties: Vec<String>,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl SearchRequest {
    /// Build a search over records whose `property` lies in `[lower, upper]`,
    /// sorted ascending by the same property.
    pub fn modified_between(
        property: &str,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
        properties: &[&str],
        limit: u32,
        after: Option<u64>,
    ) -> Self {
        Self {
            filter_groups: vec![FilterGroup {
                filters: vec![
                    Filter {
                        property_name: property.to_string(),
                        operator: FilterOperator::Gte,
                        value: lower.timestamp_millis().to_string(),
                    },
                    Filter {
                        property_name: property.to_string(),
                        operator: FilterOperator::Lte,
                        value: upper.timestamp_millis().to_string(),
                    },
                ],
            }],
            sorts: vec![Sort {
                property_name: property.to_string(),
                direction: SortDirection::Ascending,
            }],
            properties: properties.iter().map(|p| p.to_string()).collect(),
            limit,
            after: after.map(|offset| offset.to_string()),
        }
    }

    /// Build a search over records whose `property` equals `at` exactly,
    /// sorted ascending by object id and restricted to ids above `after_id`.
    ///
    /// Used to page through more records sharing one instant than the offset
    /// cap allows.
    pub fn tied_at(
        property: &str,
        at: DateTime<Utc>,
        after_id: Option<&str>,
        properties: &[&str],
        limit: u32,
        after: Option<u64>,
    ) -> Self {
        let mut filters = vec![Filter {
            property_name: property.to_string(),
            operator: FilterOperator::Eq,
            value: at.timestamp_millis().to_string(),
        }];
        if let Some(id) = after_id {
            filters.push(Filter {
                property_name: OBJECT_ID_PROPERTY.to_string(),
                operator: FilterOperator::Gt,
                value: id.to_string(),
            });
        }

        Self {
            filter_groups: vec![FilterGroup { filters }],
            sorts: vec![Sort {
                property_name: OBJECT_ID_PROPERTY.to_string(),
                direction: SortDirection::Ascending,
            }],
            properties: properties.iter().map(|p| p.to_string()).collect(),
            limit,
            after: after.map(|offset| offset.to_string()),
        }
    }

    /// Millisecond bound carried by the filter with the given operator, if any.
    pub fn bound(&self, operator: FilterOperator) -> Option<i64> {
        self.filter_groups
            .iter()
            .flat_map(|group| group.filters.iter())
            .find(|filter| filter.operator == operator)
            .and_then(|filter| filter.value.parse().ok())
    }
}

/// A CRM object as returned by the search endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

impl RawRecord {
    /// Non-null property value.
    pub fn property_value(&self, name: &str) -> Option<&Value> {
        self.properties
            .as_ref()?
            .get(name)
            .filter(|value| !value.is_null())
    }

    /// Non-empty string property value.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.property_value(name)?
            .as_str()
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextPage {
    pub after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub next: Option<NextPage>,
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub results: Vec<RawRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paging: Option<Paging>,
}

impl SearchPage {
    /// The opaque `after` cursor for the next page, if the provider returned one.
    pub fn next_after(&self) -> Option<&str> {
        self.paging
            .as_ref()?
            .next
            .as_ref()
            .map(|next| next.after.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedId {
    pub id: String,
}

/// One row of a batch association read. `from` is absent for inputs the
/// provider could not resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationResult {
    #[serde(default)]
    pub from: Option<AssociatedId>,
    #[serde(default)]
    pub to: Vec<AssociatedId>,
}

/// A CRM object returned by a batch read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmObject {
    pub id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Result of an OAuth refresh-token exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenGrant {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(alias = "expiresIn")]
    pub expires_in: i64,
}

/// Operations the sync engine needs from the CRM.
///
/// Every call takes the access token explicitly so credentials stay scoped to
/// the account being synced.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Run one page of a search over `object`.
    async fn search(
        &self,
        access_token: &str,
        object: ObjectType,
        request: &SearchRequest,
    ) -> Result<SearchPage, CrmError>;

    /// Read the associations from `from` objects to `to` objects for `ids`.
    async fn batch_read_associations(
        &self,
        access_token: &str,
        from: ObjectType,
        to: ObjectType,
        ids: &[String],
    ) -> Result<Vec<AssociationResult>, CrmError>;

    /// Read `properties` of the `object` records identified by `ids`.
    async fn batch_read(
        &self,
        access_token: &str,
        object: ObjectType,
        ids: &[String],
        properties: &[&str],
    ) -> Result<Vec<CrmObject>, CrmError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, CrmError>;
}
