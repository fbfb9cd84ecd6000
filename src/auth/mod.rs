//! Credential storage and refresh.

mod credential;
mod refresh;

pub use credential::{AuthUser, Credential, CredentialStore};
pub use refresh::{
  is_expiring_soon, token_expiry, HttpTokenExchange, RefreshManager, RefreshResponse,
  TokenExchange,
};
