//! Identity store: CRUD over the (provider, provider_user_id) -> user
//! mapping.
//!
//! Two properties the login flows lean on:
//! - `create` treats a unique-constraint violation as idempotent success,
//!   so a double-submitted bind never surfaces as an error.
//! - `bump_counter` is an atomic conditional write (`counter < new`), never
//!   a read-then-write pair, so two concurrent WebAuthn authentications
//!   from a cloned credential cannot both pass the replay check.

use crate::entity::user_identity;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    SqlErr,
};
use std::sync::Arc;
use time::OffsetDateTime;

/// Outcome of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A fresh row was inserted.
    Created(String),
    /// The (provider, provider_user_id) pair already existed.
    AlreadyExists,
}

pub struct IdentityStore {
    db: Arc<DatabaseConnection>,
}

impl IdentityStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Look up an identity by its external subject.
    #[tracing::instrument(skip(self))]
    pub async fn find_by_subject(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<user_identity::Model>, sea_orm::DbErr> {
        user_identity::Entity::find()
            .filter(user_identity::Column::Provider.eq(provider))
            .filter(user_identity::Column::ProviderUserId.eq(provider_user_id))
            .one(self.db.as_ref())
            .await
    }

    /// All identities bound to a user, optionally narrowed to one provider.
    #[tracing::instrument(skip(self))]
    pub async fn list_for_user(
        &self,
        user_id: &str,
        provider: Option<&str>,
    ) -> Result<Vec<user_identity::Model>, sea_orm::DbErr> {
        let mut query =
            user_identity::Entity::find().filter(user_identity::Column::UserId.eq(user_id));
        if let Some(provider) = provider {
            query = query.filter(user_identity::Column::Provider.eq(provider));
        }
        query.all(self.db.as_ref()).await
    }

    /// Insert a new identity row. A concurrent duplicate insert is reported
    /// as `AlreadyExists`, which callers treat as success.
    #[tracing::instrument(skip(self, provider_username))]
    pub async fn create(
        &self,
        user_id: &str,
        provider: &str,
        provider_user_id: &str,
        provider_username: &str,
    ) -> Result<CreateOutcome, sea_orm::DbErr> {
        let id = uuid::Uuid::new_v4().to_string();
        let identity = user_identity::ActiveModel {
            id: Set(id.clone()),
            user_id: Set(user_id.to_string()),
            provider: Set(provider.to_string()),
            provider_user_id: Set(provider_user_id.to_string()),
            provider_username: Set(provider_username.to_string()),
            counter: Set(0),
            created_at: Set(OffsetDateTime::now_utc()),
        };

        match identity.insert(self.db.as_ref()).await {
            Ok(_) => Ok(CreateOutcome::Created(id)),
            Err(e) => match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => {
                    tracing::debug!(
                        provider = provider,
                        "duplicate identity insert tolerated"
                    );
                    Ok(CreateOutcome::AlreadyExists)
                }
                _ => Err(e),
            },
        }
    }

    /// Advance the WebAuthn signature counter. Returns false when the
    /// stored counter was already >= `new_counter`, in which case nothing
    /// was written and the caller must treat the assertion as replayed.
    #[tracing::instrument(skip(self))]
    pub async fn bump_counter(
        &self,
        provider: &str,
        provider_user_id: &str,
        new_counter: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let result = user_identity::Entity::update_many()
            .col_expr(user_identity::Column::Counter, Expr::value(new_counter))
            .filter(user_identity::Column::Provider.eq(provider))
            .filter(user_identity::Column::ProviderUserId.eq(provider_user_id))
            .filter(user_identity::Column::Counter.lt(new_counter))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Replace the opaque provider payload (passkey blob or display name).
    #[tracing::instrument(skip(self, provider_username))]
    pub async fn update_payload(
        &self,
        provider: &str,
        provider_user_id: &str,
        provider_username: &str,
    ) -> Result<(), sea_orm::DbErr> {
        user_identity::Entity::update_many()
            .col_expr(
                user_identity::Column::ProviderUsername,
                Expr::value(provider_username),
            )
            .filter(user_identity::Column::Provider.eq(provider))
            .filter(user_identity::Column::ProviderUserId.eq(provider_user_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }
}
