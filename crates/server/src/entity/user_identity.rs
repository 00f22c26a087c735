//! User identity entity - links local accounts to external credentials.
//!
//! One row per bound credential: an OAuth identity (github/casdoor/google)
//! or a WebAuthn passkey. `(provider, provider_user_id)` is globally unique;
//! a row is created once at bind/registration time and mutated only to
//! advance the WebAuthn signature counter or rename a passkey label.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Provider name used for WebAuthn passkey identities.
pub const PROVIDER_WEBAUTHN: &str = "webauthn";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user_identity")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Reference to user.id
    pub user_id: String,
    /// "github" | "casdoor" | "google" | "webauthn"
    pub provider: String,
    /// External subject: the provider's user id, or the base64url WebAuthn
    /// credential id.
    pub provider_user_id: String,
    /// Opaque per-provider payload: the display name for OAuth identities,
    /// a JSON passkey blob for WebAuthn.
    pub provider_username: String,
    /// WebAuthn signature counter; 0 and never touched for OAuth rows.
    pub counter: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
