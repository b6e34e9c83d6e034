//! The verification engine: email login and account ownership proofs.
//!
//! Every exit point returns an [`Outcome`]. Failures of collaborators are
//! converted into a [`FlowError`] and classified once, here: for the email
//! flow authority and store failures end the flow, for the account flow
//! everything is recoverable.

use crate::{
    accounts::AccountBook,
    challenge::ChallengeStore,
    error::{FlowError, Outcome},
    governor::{self, AttemptGovernor},
    matcher::{CodeMatcher, MatchResult},
    models::{Account, AccountView, EmailLogin, Notice, Session, Subject, VerificationChallenge},
    poller::{OwnershipPoller, PollTiming},
    promoter::SessionPromoter,
    settings,
    setups::{bounded, keys, Authority, EngineSetup, SessionStore, StoreOp},
};
use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use futures::Stream;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use validator::Validate;
use vouch_core::{
    code::{VerificationCode, EMAIL_CODE_DIGITS},
    common::{AccountRecord, EmailLoginRequest},
    extract::{extract_code, extract_user_id},
};


const NOTICE_CAPACITY: usize = 64;

/// The verification engine
pub struct Engine<S: EngineSetup> {
    settings: Arc<settings::Verification>,
    authority: S::Authority,
    session: S::SessionStore,
    challenges: Arc<ChallengeStore<S>>,
    matcher: CodeMatcher<S>,
    governor: AttemptGovernor<S>,
    promoter: Arc<SessionPromoter<S>>,
    book: Arc<AccountBook>,
    poller: OwnershipPoller<S>,
    notices: broadcast::Sender<Notice>,
}

impl<S: EngineSetup> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .field("challenges", &self.challenges)
            .field("book", &self.book)
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder<S: EngineSetup> {
    settings: Option<settings::Verification>,
    authority: Option<S::Authority>,
    session: Option<S::SessionStore>,
    clock: Option<S::Clock>,
}

impl<S: EngineSetup> std::fmt::Debug for EngineBuilder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("settings", &self.settings)
            .field("authority", &self.authority.is_some())
            .field("session", &self.session.is_some())
            .field("clock", &self.clock.is_some())
            .finish()
    }
}

impl<S: EngineSetup> Default for EngineBuilder<S> {
    fn default() -> Self {
        Self {
            settings: None,
            authority: None,
            session: None,
            clock: None,
        }
    }
}

impl<S: EngineSetup> EngineBuilder<S> {
    /// Finalize the builder and return the [`Engine`]
    pub fn finalize(self) -> Result<Engine<S>> {
        let settings = Arc::new(self.settings.unwrap_or_default());

        let authority = self
            .authority
            .ok_or_else(|| anyhow!("authority is required"))?;

        let session = self
            .session
            .ok_or_else(|| anyhow!("session store is required"))?;

        let clock = self.clock.ok_or_else(|| anyhow!("clock is required"))?;

        let challenges = Arc::new(ChallengeStore::open(session.clone(), clock)?);
        let book = Arc::new(AccountBook::default());
        let idle = Arc::new(Notify::new());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let promoter = Arc::new(SessionPromoter::new(
            session.clone(),
            Arc::clone(&challenges),
            Arc::clone(&book),
            Arc::clone(&idle),
        ));

        let governor = AttemptGovernor::new(
            Arc::clone(&challenges),
            authority.clone(),
            settings.manual_cooldown(),
            settings.max_manual_attempts,
            settings.challenge_ttl(),
            settings.external_call_timeout(),
        );

        let poller = OwnershipPoller::new(
            authority.clone(),
            Arc::clone(&challenges),
            Arc::clone(&promoter),
            Arc::clone(&book),
            notices.clone(),
            idle,
            PollTiming {
                interval: settings.poll_interval(),
                challenge_ttl: settings.challenge_ttl(),
                call_timeout: settings.external_call_timeout(),
            },
        );

        Ok(Engine {
            matcher: CodeMatcher::new(Arc::clone(&challenges)),
            settings,
            authority,
            session,
            challenges,
            governor,
            promoter,
            book,
            poller,
            notices,
        })
    }

    /// Set the verification settings. Defaults apply otherwise.
    pub fn with_settings(mut self, settings: settings::Verification) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set the authority
    pub fn with_authority(mut self, authority: S::Authority) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Set the session store
    pub fn with_session_store(mut self, session: S::SessionStore) -> Self {
        self.session = Some(session);
        self
    }

    /// Set the clock
    pub fn with_clock(mut self, clock: S::Clock) -> Self {
        self.clock = Some(clock);
        self
    }
}

impl<S: EngineSetup> Engine<S> {
    // Email login

    /// Ask the authority to email a login code to `email`.
    pub async fn request_email_login(&self, email: &str) -> Outcome<EmailLogin> {
        self.email_outcome(self.try_request_email_login(email).await)
    }

    async fn try_request_email_login(&self, email: &str) -> Result<EmailLogin, FlowError> {
        let request = EmailLoginRequest {
            email: email.trim().to_lowercase(),
        };
        request.validate().map_err(|_| FlowError::InvalidEmail)?;
        let email = request.email;

        let record = self
            .call(self.authority.fetch_user_record(&email))
            .await
            .map_err(FlowError::Authority)?;
        let user_id = extract_user_id(&record)
            .ok_or(FlowError::MalformedResponse("the user record has no user id"))?
            .value;

        self.session
            .apply(vec![
                StoreOp::set(keys::USER_ID, Value::String(user_id.clone())),
                StoreOp::set(keys::PENDING_EMAIL, Value::String(email.clone())),
                StoreOp::set(keys::REGISTERING, Value::Bool(true)),
            ])
            .map_err(FlowError::Store)?;

        let response = self.issue_email_code(&user_id, &email).await?;
        let code = email_code_from(&response).ok_or(FlowError::NoChallenge)?;

        let challenge = self
            .challenges
            .issue_with_code(Subject::email(&email), code)
            .map_err(FlowError::Store)?;

        tracing::info!(email, "Requested email login code");
        Ok(EmailLogin {
            email,
            issued_at: challenge.issued_at,
        })
    }

    /// Submit the code the user entered for the pending email login.
    pub async fn submit_email_code(&self, candidate: &str) -> Outcome<Session> {
        self.email_outcome(self.try_submit_email_code(candidate))
    }

    fn try_submit_email_code(&self, candidate: &str) -> Result<Session, FlowError> {
        let code = VerificationCode::parse_email(candidate)?;
        let email = self.pending_email()?.ok_or(FlowError::NoChallenge)?;

        match self
            .matcher
            .submit(&Subject::email(&email), code.as_str())
            .map_err(FlowError::Store)?
        {
            MatchResult::Matched(_) => self.promoter.promote_email(&email).map_err(FlowError::Store),
            MatchResult::Mismatched => Err(FlowError::Mismatch),
            MatchResult::NoChallenge => Err(FlowError::NoChallenge),
        }
    }

    /// Have the authority send a fresh code for the pending email login.
    ///
    /// After re-issuing, waits a fixed propagation delay before re-reading
    /// the user record, so a stale code isn't picked up.
    pub async fn resend_email_code(&self) -> Outcome<EmailLogin> {
        self.email_outcome(self.try_resend_email_code().await)
    }

    async fn try_resend_email_code(&self) -> Result<EmailLogin, FlowError> {
        let email = self.pending_email()?.ok_or(FlowError::NoChallenge)?;
        let user_id = self.user_id()?.ok_or(FlowError::NoChallenge)?;

        let response = self.issue_email_code(&user_id, &email).await?;

        tokio::time::sleep(self.settings.resend_propagation()).await;

        let code = match self.call(self.authority.fetch_user_record(&email)).await {
            Ok(record) => email_code_from(&record),
            Err(e) => {
                tracing::warn!(?e, "Couldn't re-read the user record after resending");
                None
            }
        };
        let code = code
            .or_else(|| email_code_from(&response))
            .ok_or(FlowError::NoChallenge)?;

        let challenge = self
            .challenges
            .issue_with_code(Subject::email(&email), code)
            .map_err(FlowError::Store)?;

        tracing::info!(email, "Resent email login code");
        Ok(EmailLogin {
            email,
            issued_at: challenge.issued_at,
        })
    }

    /// Request a code from the authority, caching the full response.
    /// If the request fails, a cached response for the same email stands in.
    async fn issue_email_code(&self, user_id: &str, email: &str) -> Result<Value, FlowError> {
        match self.call(self.authority.issue_email_code(user_id, email)).await {
            Ok(response) => {
                self.session
                    .set(
                        keys::LAST_AUTHORITY_RESPONSE,
                        json!({ "email": email, "response": response }),
                    )
                    .map_err(FlowError::Store)?;
                Ok(response)
            }
            Err(e) => match self.cached_response(email)? {
                Some(cached) => {
                    tracing::warn!(?e, email, "Code request failed, using the cached authority response");
                    Ok(cached)
                }
                None => Err(FlowError::Authority(e)),
            },
        }
    }

    fn cached_response(&self, email: &str) -> Result<Option<Value>, FlowError> {
        let Some(mut cached) = self
            .session
            .get(keys::LAST_AUTHORITY_RESPONSE)
            .map_err(FlowError::Store)?
        else {
            return Ok(None);
        };
        if cached.get("email").and_then(Value::as_str) != Some(email) {
            return Ok(None);
        }
        Ok(cached.get_mut("response").map(Value::take))
    }

    // Account ownership

    /// Reload the user's accounts from the authority and merge them with the
    /// local challenges.
    pub async fn refresh_accounts(&self) -> Outcome<Vec<AccountView>> {
        Self::account_outcome(self.try_refresh_accounts().await)
    }

    async fn try_refresh_accounts(&self) -> Result<Vec<AccountView>, FlowError> {
        let accounts = self.load_accounts().await?;
        self.poller.ensure_running();
        Ok(accounts.iter().map(|account| self.view(account)).collect())
    }

    /// Issue a code for the user to put on the account's profile, and start
    /// watching for it. Asking again while a code is out returns that code.
    pub async fn request_account_verification(&self, account_id: &str) -> Outcome<AccountView> {
        Self::account_outcome(self.try_request_account_verification(account_id).await)
    }

    async fn try_request_account_verification(
        &self,
        account_id: &str,
    ) -> Result<AccountView, FlowError> {
        let account = self.resolve_account(Some(account_id)).await?;
        if account.verified {
            return Err(FlowError::AlreadyVerified);
        }

        let pending = match self
            .challenges
            .get(&Subject::account(&account.id))
            .filter(|challenge| challenge.is_pending())
        {
            Some(challenge) if self.governor.is_expired(&challenge) => {
                self.discard_expired(&account, &challenge)?;
                None
            }
            pending => pending,
        };
        if pending.is_none() {
            self.governor.challenge_account(&account).await?;
            tracing::info!(account_id = %account.id, "Requested account verification");
        }

        self.poller.ensure_running();
        Ok(self.view(&account))
    }

    /// Check right now whether the code is on the account's profile.
    ///
    /// Subject to the cooldown and the attempt limit. A check that ends up
    /// racing a successful background check reports the verified account.
    pub async fn manual_account_check(&self, account_id: &str) -> Outcome<AccountView> {
        Self::account_outcome(self.try_manual_account_check(account_id).await)
    }

    async fn try_manual_account_check(&self, account_id: &str) -> Result<AccountView, FlowError> {
        let account = self.resolve_account(Some(account_id)).await?;
        if account.verified {
            return Ok(self.view(&account));
        }

        let subject = Subject::account(&account.id);
        let challenge = self
            .challenges
            .get(&subject)
            .filter(|challenge| challenge.is_pending())
            .ok_or(FlowError::NoChallenge)?;

        if self.governor.is_expired(&challenge) {
            self.discard_expired(&account, &challenge)?;
            return Err(FlowError::Expired);
        }

        let admitted = self.governor.admit(&account.id)?;
        let check = self.call(self.authority.check_ownership(&account.id)).await;

        // The background poller may have promoted the account meanwhile
        if let Some(current) = self.book.get(&account.id).filter(|a| a.verified) {
            tracing::debug!(account_id = %account.id, "Account verified while checking");
            return Ok(self.view(&current));
        }

        match check {
            Ok(true) => {
                if let Some(promoted) = self
                    .promoter
                    .promote_account(&account.id)
                    .map_err(FlowError::Store)?
                {
                    let _ = self.notices.send(Notice::AccountVerified {
                        account_id: promoted.id.clone(),
                        handle: Some(promoted.handle.clone()),
                    });
                }
                let current = self.book.get(&account.id).unwrap_or(account);
                Ok(self.view(&current))
            }
            Ok(false) => {
                let attempts = self
                    .governor
                    .record_miss(&admitted)?
                    .unwrap_or(admitted.attempt_count);
                Err(FlowError::NotFoundOnProfile {
                    attempts,
                    max_attempts: self.governor.max_attempts(),
                })
            }
            Err(e) => {
                tracing::warn!(account_id = %account.id, ?e, "Manual ownership check failed");
                Err(FlowError::Authority(e))
            }
        }
    }

    /// Discard the account's challenge and issue a brand-new one.
    ///
    /// This is the only way forward once the attempt limit is reached.
    pub async fn reset_account_verification(&self, account_id: Option<&str>) -> Outcome<AccountView> {
        Self::account_outcome(self.try_reset_account_verification(account_id).await)
    }

    async fn try_reset_account_verification(
        &self,
        account_id: Option<&str>,
    ) -> Result<AccountView, FlowError> {
        let account = self.resolve_account(account_id).await?;
        self.governor.reset(&account).await?;
        self.poller.ensure_running();
        Ok(self.view(&account))
    }

    // Session

    /// Log out, dropping all session-scoped state at once
    pub async fn logout(&self) -> Outcome<()> {
        self.poller.stop().await;
        Self::account_outcome(self.promoter.logout().map_err(FlowError::Store))
    }

    /// The current login state
    pub fn session(&self) -> Result<Session> {
        self.promoter.session()
    }

    // Observation

    /// The account's current state, if it's known
    pub fn account_status(&self, account_id: &str) -> Option<AccountView> {
        self.book.get(account_id).map(|account| self.view(&account))
    }

    /// All known accounts, ordered by handle
    pub fn accounts(&self) -> Vec<AccountView> {
        self.book
            .list()
            .iter()
            .map(|account| self.view(account))
            .collect()
    }

    /// Seconds until the next manual check of the account is permitted,
    /// ticking once per second. Yields a single 0 if no cooldown is running.
    pub fn countdown(&self, account_id: &str) -> impl Stream<Item = u64> {
        let remaining = self
            .challenges
            .get(&Subject::account(account_id))
            .and_then(|challenge| {
                self.governor
                    .remaining_cooldown(&challenge, self.challenges.now())
            })
            .unwrap_or_default();
        governor::countdown(remaining)
    }

    /// Subscribe to confirmations and timeouts from the background poller
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// The background poller
    pub fn poller(&self) -> &OwnershipPoller<S> {
        &self.poller
    }

    // Internals

    fn email_outcome<T>(&self, result: Result<T, FlowError>) -> Outcome<T> {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(error) if error.is_fatal_to_email_flow() => {
                tracing::warn!(%error, "Email login failed, restarting the flow");
                Outcome::Fatal {
                    error,
                    redirect_after: self.settings.fatal_redirect(),
                }
            }
            Err(error) => Outcome::Recoverable(error),
        }
    }

    fn account_outcome<T>(result: Result<T, FlowError>) -> Outcome<T> {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(error) => Outcome::Recoverable(error),
        }
    }

    async fn call<T>(&self, call: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        bounded(self.settings.external_call_timeout(), call).await
    }

    fn pending_email(&self) -> Result<Option<String>, FlowError> {
        self.string_value(keys::PENDING_EMAIL)
    }

    fn user_id(&self) -> Result<Option<String>, FlowError> {
        self.string_value(keys::USER_ID)
    }

    fn string_value(&self, key: &str) -> Result<Option<String>, FlowError> {
        Ok(self
            .session
            .get(key)
            .map_err(FlowError::Store)?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    /// Look up an account, refreshing the list once if it's unknown.
    async fn resolve_account(&self, account_id: Option<&str>) -> Result<Account, FlowError> {
        let account_id = account_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(FlowError::MissingAccountId)?;

        if let Some(account) = self.book.get(account_id) {
            return Ok(account);
        }

        self.load_accounts().await?;
        self.book
            .get(account_id)
            .ok_or_else(|| FlowError::UnknownAccount(account_id.to_string()))
    }

    async fn load_accounts(&self) -> Result<Vec<Account>, FlowError> {
        if !self.session().map_err(FlowError::Store)?.authenticated {
            return Err(FlowError::NotAuthenticated);
        }
        let user_id = self.user_id()?.ok_or(FlowError::NotAuthenticated)?;

        let records = self
            .call(self.authority.fetch_accounts_for_user(&user_id))
            .await
            .map_err(FlowError::Authority)?;

        for record in &records {
            self.merge_challenge(record)?;
        }
        Ok(self.book.replace(&user_id, &records))
    }

    /// Reconcile the authority's view of an account with the local challenge.
    fn merge_challenge(&self, record: &AccountRecord) -> Result<(), FlowError> {
        let subject = Subject::account(&record.id);

        if record.verified {
            self.challenges.clear(&subject).map_err(FlowError::Store)?;
            return Ok(());
        }

        let Some(request) = &record.verified_request else {
            return Ok(());
        };
        let Ok(code) = request.code.parse::<VerificationCode>() else {
            tracing::warn!(account_id = %record.id, "Ignoring unreadable pending verification request");
            return Ok(());
        };
        let issued_at = Utc
            .timestamp_millis_opt(request.requested_at)
            .single()
            .unwrap_or_else(|| self.challenges.now());

        let adopted = self
            .challenges
            .insert_if_absent(VerificationChallenge::new(subject, code, issued_at))
            .map_err(FlowError::Store)?;
        if adopted {
            tracing::debug!(account_id = %record.id, "Adopted pending verification request from the authority");
        }
        Ok(())
    }

    /// Drop a challenge that timed out, unless it was superseded meanwhile.
    fn discard_expired(
        &self,
        account: &Account,
        challenge: &VerificationChallenge,
    ) -> Result<(), FlowError> {
        let discarded = self
            .challenges
            .clear_if(&challenge.subject, |live| live.code == challenge.code)
            .map_err(FlowError::Store)?;
        if discarded.is_some() {
            tracing::info!(account_id = %account.id, "Account challenge expired");
            let _ = self.notices.send(Notice::ChallengeExpired {
                account_id: account.id.clone(),
                handle: Some(account.handle.clone()),
            });
        }
        Ok(())
    }

    fn view(&self, account: &Account) -> AccountView {
        let challenge = self.challenges.get(&Subject::account(&account.id));
        AccountView {
            affordance: self.governor.affordance(account, challenge.as_ref()),
            account: account.clone(),
            challenge,
        }
    }
}

fn email_code_from(response: &Value) -> Option<VerificationCode> {
    let found = extract_code(response, EMAIL_CODE_DIGITS)?;
    VerificationCode::parse_email(&found.value).ok()
}
