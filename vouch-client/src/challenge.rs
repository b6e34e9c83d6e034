//! The single source of truth for which code is valid for which subject.
//!
//! Challenges live in memory behind one lock and are mirrored into the
//! session store under [`keys::CHALLENGES`]. Every mutation builds the
//! next map, persists it, and only then swaps it in, all while holding
//! the lock. Readers therefore never see a code paired with another
//! challenge's timestamp, and a failed write leaves the old state intact.
//!
//! The write is synchronous, even when called from async exit points or
//! the poll task. The session is one small JSON file and the lock is never
//! held across an `.await`.

use crate::{
    models::{Subject, VerificationChallenge},
    setups::{keys, Clock, EngineSetup, SessionStore, StoreOp},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use vouch_core::code::VerificationCode;

type Challenges = HashMap<Subject, VerificationChallenge>;

/// Outstanding verification challenges, one per subject
pub struct ChallengeStore<S: EngineSetup> {
    session: S::SessionStore,
    clock: S::Clock,
    live: Mutex<Challenges>,
}

impl<S: EngineSetup> std::fmt::Debug for ChallengeStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeStore")
            .field("live", &self.live.lock().len())
            .finish_non_exhaustive()
    }
}

impl<S: EngineSetup> ChallengeStore<S> {
    /// Load persisted challenges.
    ///
    /// Unreadable persisted state is discarded with a warning. Losing a
    /// challenge only means the user has to request a new code.
    pub fn open(session: S::SessionStore, clock: S::Clock) -> Result<Self> {
        let persisted = session
            .get(keys::CHALLENGES)
            .context("Reading persisted challenges")?;

        let live = match persisted {
            None => Challenges::new(),
            Some(value) => match serde_json::from_value::<Vec<VerificationChallenge>>(value) {
                Ok(challenges) => challenges
                    .into_iter()
                    .map(|challenge| (challenge.subject.clone(), challenge))
                    .collect(),
                Err(e) => {
                    tracing::warn!(%e, "Discarding unreadable persisted challenges");
                    Challenges::new()
                }
            },
        };

        tracing::debug!(count = live.len(), "Loaded challenges");

        Ok(Self {
            session,
            clock,
            live: Mutex::new(live),
        })
    }

    /// The current time according to the store's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Issue a client-generated code with `digits` digits, superseding any
    /// prior challenge for the subject. The new code always differs from the
    /// superseded one.
    pub fn issue(&self, subject: Subject, digits: usize) -> Result<VerificationChallenge> {
        let previous = self.get(&subject).map(|challenge| challenge.code);
        let code =
            VerificationCode::generate_excluding(digits, previous.as_ref().map(|c| c.as_str()));
        self.issue_with_code(subject, code)
    }

    /// Issue a challenge for a code that came from elsewhere, superseding
    /// any prior challenge for the subject.
    pub fn issue_with_code(
        &self,
        subject: Subject,
        code: VerificationCode,
    ) -> Result<VerificationChallenge> {
        let challenge = VerificationChallenge::new(subject.clone(), code, self.clock.now());

        self.mutate(|live| {
            live.insert(subject, challenge.clone());
            true
        })?;

        tracing::debug!(subject = %challenge.subject, issued_at = %challenge.issued_at, "Issued challenge");
        Ok(challenge)
    }

    /// Adopt a challenge unless the subject already has one.
    /// Returns whether it was adopted.
    pub fn insert_if_absent(&self, challenge: VerificationChallenge) -> Result<bool> {
        self.mutate(|live| {
            if live.contains_key(&challenge.subject) {
                return false;
            }
            live.insert(challenge.subject.clone(), challenge);
            true
        })
    }

    /// The live challenge for a subject
    pub fn get(&self, subject: &Subject) -> Option<VerificationChallenge> {
        self.live.lock().get(subject).cloned()
    }

    /// Discard the subject's challenge
    pub fn clear(&self, subject: &Subject) -> Result<Option<VerificationChallenge>> {
        self.clear_if(subject, |_| true)
    }

    /// Discard the subject's challenge, but only if `predicate` holds for it.
    /// Returns the discarded challenge.
    pub fn clear_if(
        &self,
        subject: &Subject,
        predicate: impl FnOnce(&VerificationChallenge) -> bool,
    ) -> Result<Option<VerificationChallenge>> {
        let mut removed = None;
        self.mutate(|live| {
            if live.get(subject).map_or(false, predicate) {
                removed = live.remove(subject);
            }
            removed.is_some()
        })?;

        if let Some(challenge) = &removed {
            tracing::debug!(subject = %challenge.subject, "Cleared challenge");
        }
        Ok(removed)
    }

    /// Discard all challenges whose subject matches, and apply `extra`
    /// session writes in the same batch.
    pub fn clear_where(&self, predicate: impl Fn(&Subject) -> bool, extra: Vec<StoreOp>) -> Result<()> {
        let mut live = self.live.lock();
        let mut next = live.clone();
        next.retain(|subject, _| !predicate(subject));
        self.persist(&next, extra)?;
        *live = next;
        Ok(())
    }

    /// Mutate the subject's challenge in place.
    ///
    /// Returns `None` if there's no challenge. Nothing is written if `f`
    /// leaves the challenge unchanged.
    pub fn update<R>(
        &self,
        subject: &Subject,
        f: impl FnOnce(&mut VerificationChallenge) -> R,
    ) -> Result<Option<R>> {
        let mut live = self.live.lock();
        let Some(current) = live.get(subject) else {
            return Ok(None);
        };

        let mut updated = current.clone();
        let result = f(&mut updated);
        if &updated == current {
            return Ok(Some(result));
        }

        let mut next = live.clone();
        next.insert(subject.clone(), updated);
        self.persist(&next, Vec::new())?;
        *live = next;
        Ok(Some(result))
    }

    /// All pending account challenges, oldest first
    pub fn pending_accounts(&self) -> Vec<VerificationChallenge> {
        let mut pending: Vec<_> = self
            .live
            .lock()
            .values()
            .filter(|challenge| challenge.subject.is_account() && challenge.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        pending
    }

    fn mutate(&self, f: impl FnOnce(&mut Challenges) -> bool) -> Result<bool> {
        let mut live = self.live.lock();
        let mut next = live.clone();
        if !f(&mut next) {
            return Ok(false);
        }
        self.persist(&next, Vec::new())?;
        *live = next;
        Ok(true)
    }

    fn persist(&self, next: &Challenges, mut extra: Vec<StoreOp>) -> Result<()> {
        let mut challenges: Vec<_> = next.values().collect();
        challenges.sort_by(|a, b| a.subject.cmp(&b.subject));
        extra.push(StoreOp::set(
            keys::CHALLENGES,
            serde_json::to_value(challenges)?,
        ));
        self.session
            .apply(extra)
            .context("Persisting challenges")
    }
}
