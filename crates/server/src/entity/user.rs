//! User entity - local accounts with password credentials.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Account status. A withdrawn account keeps its row but can no longer
/// authenticate through any method.
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_WITHDRAWN: &str = "withdrawn";

/// Second-factor mode stored on the account.
pub const TWO_FACTOR_NONE: &str = "none";
pub const TWO_FACTOR_TOTP: &str = "totp";
pub const TWO_FACTOR_EMAIL: &str = "email";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub username: String,
    /// Argon2id PHC string. None for accounts created through an external
    /// identity that never set a local password.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub role: String,
    pub status: String,
    pub password_changed_at: Option<OffsetDateTime>,
    pub email: Option<String>,
    pub email_verified: bool,
    /// "none" | "totp" | "email"
    pub two_factor: String,
    #[serde(skip_serializing)]
    pub totp_secret: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
}

impl Model {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }

    pub fn two_factor_enabled(&self) -> bool {
        self.two_factor != TWO_FACTOR_NONE
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user_identity::Entity")]
    Identities,
}

impl Related<super::user_identity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Identities.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
