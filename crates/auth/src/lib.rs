//! `folio-auth`: session token lifecycle rules.
//!
//! This crate is intentionally decoupled from HTTP, signing and storage: it
//! decides *what* a token looks like after issue/renew/revoke at a given
//! instant, and leaves persistence to the infrastructure layer.

pub mod session;

pub use session::{SessionToken, TokenError, TokenPolicy};
