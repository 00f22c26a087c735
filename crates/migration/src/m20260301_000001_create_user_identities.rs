//! Migration creating the `user_identity` table.
//!
//! One row per external credential bound to a local account: OAuth
//! identities (github/casdoor/google) and WebAuthn passkeys. The
//! `(provider, provider_user_id)` pair is globally unique.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserIdentity::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserIdentity::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(UserIdentity::UserId).string().not_null())
                    .col(ColumnDef::new(UserIdentity::Provider).string().not_null())
                    .col(
                        ColumnDef::new(UserIdentity::ProviderUserId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserIdentity::ProviderUsername)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserIdentity::Counter)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(UserIdentity::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_identity_user")
                            .from(UserIdentity::Table, UserIdentity::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_identity_provider_subject")
                    .table(UserIdentity::Table)
                    .col(UserIdentity::Provider)
                    .col(UserIdentity::ProviderUserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_identity_user")
                    .table(UserIdentity::Table)
                    .col(UserIdentity::UserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserIdentity::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum UserIdentity {
    #[sea_orm(iden = "user_identity")]
    Table,
    Id,
    UserId,
    Provider,
    ProviderUserId,
    ProviderUsername,
    Counter,
    CreatedAt,
}

#[derive(DeriveIden)]
enum User {
    #[sea_orm(iden = "user")]
    Table,
    Id,
}
