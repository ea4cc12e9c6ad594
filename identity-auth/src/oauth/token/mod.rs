//! Token endpoint interaction and the token types it produces.

mod client;
mod tokens;

pub use client::{AuthResult, TokenClient};
pub use tokens::{RevocationOutcome, TokenSet, TokenSummary, TokenTypeHint};
