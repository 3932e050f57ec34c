//! OAuth token lifecycle
//!
//! Persisted credentials ([`TokenStore`]), refresh against the accounts
//! server ([`ZohoOAuthRefresher`]) and single-flight access for clients
//! ([`TokenProvider`]).

pub mod provider;
pub mod refresh;
pub mod store;

pub use provider::TokenProvider;
pub use refresh::{RefreshedToken, TokenRefresher, ZohoOAuthRefresher};
pub use store::{
    TokenRecord, TokenStore, TokenStoreBackend, DEFAULT_SAFETY_MARGIN, OAUTH_TOKEN_TYPE,
};
