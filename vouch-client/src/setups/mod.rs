//! This abstracts the engine's side-effects into "setups".
//!
//! This module defines the traits, submodules define test & production
//! collections of implementations.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{future::Future, time::Duration};
use vouch_core::common::AccountRecord;

pub mod prod;
#[cfg(any(test, feature = "test_utils"))]
pub mod test;

/// This trait groups type parameters to the [`Engine`](crate::engine::Engine) struct.
///
/// It captures the setup of the engine, distinguishing between e.g.
/// unit testing & production setups.
pub trait EngineSetup: Clone + Send + Sync + 'static {
    /// Which implementation to use for talking to the authority's data API
    type Authority: Authority;
    /// Which implementation to use for persisting session state
    type SessionStore: SessionStore;
    /// Where the current time comes from
    type Clock: Clock;
}

/// The authority's data API.
///
/// Responses for the email flow are returned as raw JSON, since their
/// shape isn't stable. See [`vouch_core::extract`].
#[async_trait]
pub trait Authority: Clone + Send + Sync + 'static {
    /// Ask the authority to email a fresh login code
    async fn issue_email_code(&self, user_id: &str, email: &str) -> Result<Value>;

    /// Fetch the user record associated with an email address
    async fn fetch_user_record(&self, email: &str) -> Result<Value>;

    /// List the social accounts a user has linked
    async fn fetch_accounts_for_user(&self, user_id: &str) -> Result<Vec<AccountRecord>>;

    /// Register the code the user is going to put on their profile
    async fn submit_verification_request(&self, account_id: &str, code: &str) -> Result<()>;

    /// Whether the registered code is currently visible on the account's profile
    async fn check_ownership(&self, account_id: &str) -> Result<bool>;
}

/// A key-value store surviving process restarts.
pub trait SessionStore: Clone + Send + Sync + 'static {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Apply a batch of writes. Either all of them become visible or none do.
    fn apply(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// Write a single value
    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.apply(vec![StoreOp::set(key, value)])
    }
}

/// Source of the current time
pub trait Clock: Clone + Send + Sync + 'static {
    /// The current time
    fn now(&self) -> DateTime<Utc>;
}

/// Run an external call, failing it if it doesn't settle within `limit`.
pub(crate) async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| anyhow!("No response within {limit:?}"))?
}

/// A single write in a [`SessionStore::apply`] batch
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Insert or overwrite a key
    Set(String, Value),
    /// Remove a key, if present
    Remove(String),
}

impl StoreOp {
    /// Shorthand for [`StoreOp::Set`]
    pub fn set(key: &str, value: Value) -> Self {
        Self::Set(key.to_string(), value)
    }

    /// Shorthand for [`StoreOp::Remove`]
    pub fn remove(key: &str) -> Self {
        Self::Remove(key.to_string())
    }

    /// Apply this operation to an in-memory map
    pub fn apply_to(self, map: &mut serde_json::Map<String, Value>) {
        match self {
            StoreOp::Set(key, value) => {
                map.insert(key, value);
            }
            StoreOp::Remove(key) => {
                map.remove(&key);
            }
        }
    }
}

/// Keys used in the session store
pub mod keys {
    /// Whether the email login completed
    pub const AUTHENTICATED: &str = "authenticated";
    /// The verified email address
    pub const EMAIL: &str = "email";
    /// The email address a login code was requested for
    pub const PENDING_EMAIL: &str = "pending_email";
    /// The authority's id for the user logging in
    pub const USER_ID: &str = "user_id";
    /// Set while a login is in progress
    pub const REGISTERING: &str = "registering";
    /// The last full response of the authority to an email code request
    pub const LAST_AUTHORITY_RESPONSE: &str = "last_authority_response";
    /// All outstanding verification challenges
    pub const CHALLENGES: &str = "challenges";

    /// Everything that's scoped to a login session
    pub const SESSION_SCOPED: &[&str] = &[
        AUTHENTICATED,
        EMAIL,
        PENDING_EMAIL,
        USER_ID,
        REGISTERING,
        LAST_AUTHORITY_RESPONSE,
    ];
}
