//! Cooldowns and attempt limits for manual ownership checks.
//!
//! Both are tracked locally on the account's challenge: `last_attempt_at`
//! drives the cooldown, `attempt_count` the escalation to a forced reset.
//! Background poll misses touch neither.

use crate::{
    challenge::ChallengeStore,
    error::{whole_seconds, FlowError},
    models::{Account, Affordance, Subject, VerificationChallenge},
    setups::{bounded, Authority, EngineSetup},
};
use chrono::{DateTime, Utc};
use futures::{stream, Stream};
use std::{sync::Arc, time::Duration};
use vouch_core::code::{VerificationCode, ACCOUNT_CODE_DIGITS};

/// Gatekeeper for manual checks and resets
pub struct AttemptGovernor<S: EngineSetup> {
    challenges: Arc<ChallengeStore<S>>,
    authority: S::Authority,
    cooldown: Duration,
    max_attempts: u32,
    challenge_ttl: Duration,
    call_timeout: Duration,
}

impl<S: EngineSetup> std::fmt::Debug for AttemptGovernor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptGovernor")
            .field("cooldown", &self.cooldown)
            .field("max_attempts", &self.max_attempts)
            .field("challenge_ttl", &self.challenge_ttl)
            .finish_non_exhaustive()
    }
}

impl<S: EngineSetup> AttemptGovernor<S> {
    /// Create a governor
    pub fn new(
        challenges: Arc<ChallengeStore<S>>,
        authority: S::Authority,
        cooldown: Duration,
        max_attempts: u32,
        challenge_ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            challenges,
            authority,
            cooldown,
            max_attempts,
            challenge_ttl,
            call_timeout,
        }
    }

    /// Failed manual checks permitted before a reset is required
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether the challenge has outlived its time to live
    pub fn is_expired(&self, challenge: &VerificationChallenge) -> bool {
        challenge.is_expired(self.challenges.now(), self.challenge_ttl)
    }

    /// Time left until the next manual check is permitted, if any
    pub fn remaining_cooldown(
        &self,
        challenge: &VerificationChallenge,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let last_attempt = challenge.last_attempt_at?;
        let elapsed = (now - last_attempt).to_std().unwrap_or_default();
        self.cooldown
            .checked_sub(elapsed)
            .filter(|remaining| !remaining.is_zero())
    }

    /// What the user can do next with `account`.
    /// An expired challenge offers a fresh start, like no challenge at all.
    pub fn affordance(
        &self,
        account: &Account,
        challenge: Option<&VerificationChallenge>,
    ) -> Affordance {
        if account.verified {
            return Affordance::Verified;
        }

        let Some(challenge) = challenge
            .filter(|challenge| challenge.is_pending() && !self.is_expired(challenge))
        else {
            return Affordance::Verify;
        };

        if challenge.attempt_count >= self.max_attempts {
            Affordance::MustReset
        } else if let Some(remaining) = self.remaining_cooldown(challenge, self.challenges.now())
        {
            Affordance::Wait { remaining }
        } else if challenge.attempt_count > 0 {
            Affordance::Retry {
                attempts_left: self.max_attempts - challenge.attempt_count,
            }
        } else {
            Affordance::Check
        }
    }

    /// Admit a manual check, starting the cooldown.
    ///
    /// Checking the limits and stamping the attempt happen as one update, so
    /// two racing checks can't both be admitted. A rejected check changes
    /// nothing.
    pub fn admit(&self, account_id: &str) -> Result<VerificationChallenge, FlowError> {
        let now = self.challenges.now();
        self.challenges
            .update(&Subject::account(account_id), |challenge| {
                if challenge.attempt_count >= self.max_attempts {
                    return Err(FlowError::ResetRequired);
                }
                if let Some(remaining) = self.remaining_cooldown(challenge, now) {
                    return Err(FlowError::RateLimited { remaining });
                }
                challenge.last_attempt_at = Some(now);
                Ok(challenge.clone())
            })
            .map_err(FlowError::Store)?
            .ok_or(FlowError::NoChallenge)?
    }

    /// Count a manual check that didn't find the code.
    ///
    /// Returns the new attempt count, or `None` if the admitted challenge was
    /// superseded while the check was running.
    pub fn record_miss(&self, admitted: &VerificationChallenge) -> Result<Option<u32>, FlowError> {
        let attempts = self
            .challenges
            .update(&admitted.subject, |challenge| {
                if challenge.code != admitted.code {
                    return None;
                }
                challenge.attempt_count += 1;
                Some(challenge.attempt_count)
            })
            .map_err(FlowError::Store)?
            .flatten();

        if let Some(attempts) = attempts {
            tracing::info!(
                subject = %admitted.subject,
                attempts,
                max_attempts = self.max_attempts,
                "Manual check missed"
            );
        }
        Ok(attempts)
    }

    /// Give the account a brand-new challenge.
    ///
    /// The fresh code differs from the superseded one and starts out with no
    /// attempts and no cooldown. The authority learns about the code first,
    /// so a failed request leaves the old challenge in place.
    pub async fn reset(&self, account: &Account) -> Result<VerificationChallenge, FlowError> {
        if account.verified {
            return Err(FlowError::AlreadyVerified);
        }
        let challenge = self.challenge_account(account).await?;
        tracing::info!(account_id = %account.id, "Reset account verification");
        Ok(challenge)
    }

    /// Register a fresh code with the authority and make it the account's
    /// live challenge.
    pub(crate) async fn challenge_account(
        &self,
        account: &Account,
    ) -> Result<VerificationChallenge, FlowError> {
        let subject = Subject::account(&account.id);
        let previous = self.challenges.get(&subject).map(|challenge| challenge.code);
        let code = VerificationCode::generate_excluding(
            ACCOUNT_CODE_DIGITS,
            previous.as_ref().map(VerificationCode::as_str),
        );

        bounded(
            self.call_timeout,
            self.authority
                .submit_verification_request(&account.id, code.as_str()),
        )
        .await
        .map_err(FlowError::Authority)?;

        self.challenges
            .issue_with_code(subject, code)
            .map_err(FlowError::Store)
    }
}

/// Seconds left in a cooldown, once per second, down to and including 0.
pub fn countdown(remaining: Duration) -> impl Stream<Item = u64> {
    let start = whole_seconds(remaining);
    stream::unfold((start, true), |(secs, first)| async move {
        if first {
            return Some((secs, (secs, false)));
        }
        if secs == 0 {
            return None;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        Some((secs - 1, (secs - 1, false)))
    })
}
