//! Decoding and interpretation of the bearer credential issued at login.
//!
//! The credential is an opaque three-segment signed token. Only the middle
//! (payload) segment is consumed here; the signature is never verified on the
//! client, which trusts transport-layer security instead. The issuing service
//! has shipped several claim shapes over time, so every accessor works off a
//! generic claim map with a documented fallback order rather than a fixed
//! struct.

mod claims;
mod role;

pub use claims::{decode, is_valid, should_refresh, Claims};
pub use role::{resolve_role, RoleIdTable, RoleKind};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed credential: {0}")]
    Malformed(String),
}
