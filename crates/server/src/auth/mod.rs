//! Authentication core: token codecs, credential verification, lockout
//! tracking and the ephemeral stores backing the login flows.
//!
//! HTTP handlers live under `crate::api`; everything here is plain logic
//! that can be exercised without a server.

pub mod cookies;
pub mod guard;
pub mod identity;
pub mod password;
pub mod providers;
pub mod state;
pub mod tokens;
pub mod two_factor;
pub mod webauthn;

pub use password::{hash_password, verify_password};
