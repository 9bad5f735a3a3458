//! CRM account entity model
//!
//! SeaORM entity for the `crm_accounts` table, which stores one connected
//! CRM portal per row together with its credentials and sync watermarks.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "crm_accounts")]
pub struct Model {
    /// Portal (hub) identifier assigned by the CRM
    #[sea_orm(primary_key, auto_increment = false)]
    pub hub_id: i64,

    /// Current OAuth access token
    pub access_token: String,

    /// OAuth refresh token
    pub refresh_token: String,

    /// Instant the access token stops being valid
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Map of entity kind to last successful sync instant (RFC 3339)
    #[sea_orm(column_type = "JsonBinary")]
    pub last_pulled_dates: JsonValue,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
