//! Migration to create the crm_accounts table.
//!
//! Each row holds one connected CRM portal: its OAuth credential pair, the
//! access token expiry and the per-entity-kind sync watermarks.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CrmAccounts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CrmAccounts::HubId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CrmAccounts::AccessToken).text().not_null())
                    .col(ColumnDef::new(CrmAccounts::RefreshToken).text().not_null())
                    .col(
                        ColumnDef::new(CrmAccounts::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CrmAccounts::LastPulledDates)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CrmAccounts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CrmAccounts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CrmAccounts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CrmAccounts {
    Table,
    HubId,
    AccessToken,
    RefreshToken,
    ExpiresAt,
    LastPulledDates,
    CreatedAt,
    UpdatedAt,
}
