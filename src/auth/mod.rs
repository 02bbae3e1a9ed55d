//! Proxy user authorization.
//!
//! # Data Flow
//! ```text
//! auth table (.csv file or command output)
//!     → loader.rs (parse records)
//!     → checker.rs (LoadingAuthUserChecker, periodic reload)
//!     → gate.rs (per-request check + allow_proxy requirement)
//!     → 401 challenge or continue forwarding
//! ```
//!
//! # Design Decisions
//! - The forwarding engine only sees `AuthUserChecker`
//! - Identity alone is not enough: `allow_proxy` must be "1"
//! - Reload cadence and storage format are the loader's concern

pub mod checker;
pub mod gate;
pub mod loader;

use std::collections::HashMap;

use thiserror::Error;

use crate::context::AuthUserInfo;

pub use checker::LoadingAuthUserChecker;
pub use gate::authorize;
pub use loader::{AuthTableLoader, AuthUserLoader, CommandAuthUserLoader, CsvAuthUserLoader};

/// Reasons a user is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing proxy credentials")]
    MissingCredentials,

    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("wrong password for user {0:?}")]
    WrongPassword(String),

    #[error("proxy is not allowed for user {0:?}")]
    ProxyNotAllowed(String),

    #[error("auth table load failed: {0}")]
    Load(String),
}

/// One row of an auth table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthUserRecord {
    pub username: String,
    pub password: String,
    pub attrs: HashMap<String, String>,
}

/// Checks one username/credential pair and fills in attributes on success.
pub trait AuthUserChecker: Send + Sync {
    fn check_auth_user(&self, user: &mut AuthUserInfo) -> Result<(), AuthError>;
}
