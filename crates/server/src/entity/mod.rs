//! Database entities for the auth core.

pub mod user;
pub mod user_identity;
