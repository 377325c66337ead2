// ============================
// crates/backend-lib/src/auth/mod.rs
// ============================
//! Authentication: session tokens and meeting password hashing.
pub mod password;
pub mod token;

pub use password::{hash_password, verify_password};
pub use token::{spawn_revocation_purge, Claims, TokenService};
