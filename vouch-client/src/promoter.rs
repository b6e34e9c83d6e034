//! Turning successful verifications into lasting state

use crate::{
    accounts::AccountBook,
    challenge::ChallengeStore,
    models::{Account, Session, Subject},
    setups::{keys, EngineSetup, SessionStore, StoreOp},
};
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;

/// Promotes matched challenges into an authenticated session or a
/// verified account
pub struct SessionPromoter<S: EngineSetup> {
    session: S::SessionStore,
    challenges: Arc<ChallengeStore<S>>,
    book: Arc<AccountBook>,
    idle: Arc<Notify>,
}

impl<S: EngineSetup> std::fmt::Debug for SessionPromoter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPromoter").finish_non_exhaustive()
    }
}

impl<S: EngineSetup> SessionPromoter<S> {
    /// Create a promoter. `idle` is notified whenever the last pending
    /// account challenge goes away.
    pub fn new(
        session: S::SessionStore,
        challenges: Arc<ChallengeStore<S>>,
        book: Arc<AccountBook>,
        idle: Arc<Notify>,
    ) -> Self {
        Self {
            session,
            challenges,
            book,
            idle,
        }
    }

    /// Mark the session authenticated for `email` and drop the transient
    /// login state, in one write.
    pub fn promote_email(&self, email: &str) -> Result<Session> {
        self.session
            .apply(vec![
                StoreOp::set(keys::AUTHENTICATED, Value::Bool(true)),
                StoreOp::set(keys::EMAIL, Value::String(email.to_string())),
                StoreOp::remove(keys::REGISTERING),
                StoreOp::remove(keys::PENDING_EMAIL),
            ])
            .context("Persisting the authenticated session")?;

        tracing::info!(email, "Session authenticated");
        Ok(Session {
            email: Some(email.to_string()),
            authenticated: true,
        })
    }

    /// Mark an account verified and discard its challenge.
    ///
    /// Returns `None` if the account was verified already, which makes a
    /// late second promotion a no-op.
    pub fn promote_account(&self, account_id: &str) -> Result<Option<Account>> {
        self.challenges.clear(&Subject::account(account_id))?;
        let promoted = self.book.mark_verified(account_id);

        if promoted.is_some() {
            tracing::info!(account_id, "Account ownership verified");
        }
        if self.challenges.pending_accounts().is_empty() {
            tracing::debug!("No pending account challenges left");
            self.idle.notify_one();
        }
        Ok(promoted)
    }

    /// The current login state
    pub fn session(&self) -> Result<Session> {
        let authenticated = self
            .session
            .get(keys::AUTHENTICATED)?
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        let email = self
            .session
            .get(keys::EMAIL)?
            .and_then(|value| value.as_str().map(str::to_string));
        Ok(Session {
            email,
            authenticated,
        })
    }

    /// Drop everything scoped to the login session in one write:
    /// the session flags, the cached authority response and all challenges.
    pub fn logout(&self) -> Result<()> {
        let ops = keys::SESSION_SCOPED
            .iter()
            .map(|key| StoreOp::remove(key))
            .collect();
        self.challenges
            .clear_where(|_| true, ops)
            .context("Clearing the session")?;
        self.book.clear();
        self.idle.notify_one();

        tracing::info!("Logged out");
        Ok(())
    }
}
