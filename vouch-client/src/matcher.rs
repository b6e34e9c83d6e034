//! Comparing entered codes against the live challenge

use crate::{
    challenge::ChallengeStore,
    models::{Subject, VerificationChallenge},
    setups::EngineSetup,
};
use anyhow::Result;
use std::sync::Arc;

/// What a submitted code amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// The code was right. The challenge has been discarded.
    Matched(VerificationChallenge),
    /// The code was wrong. The challenge is untouched.
    Mismatched,
    /// There's no challenge to compare against
    NoChallenge,
}

/// Exact comparison of entered codes
pub struct CodeMatcher<S: EngineSetup> {
    challenges: Arc<ChallengeStore<S>>,
}

impl<S: EngineSetup> std::fmt::Debug for CodeMatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeMatcher").finish_non_exhaustive()
    }
}

impl<S: EngineSetup> CodeMatcher<S> {
    /// Match against the challenges in `challenges`
    pub fn new(challenges: Arc<ChallengeStore<S>>) -> Self {
        Self { challenges }
    }

    /// Compare `candidate` to the subject's live code.
    ///
    /// Surrounding whitespace is ignored, everything else has to be equal.
    /// A mismatch never mutates state, so wrong submissions can repeat
    /// freely.
    pub fn submit(&self, subject: &Subject, candidate: &str) -> Result<MatchResult> {
        let Some(challenge) = self.challenges.get(subject) else {
            tracing::debug!(%subject, "Code submitted without a challenge");
            return Ok(MatchResult::NoChallenge);
        };

        if challenge.code.as_str() != candidate.trim() {
            tracing::debug!(%subject, "Code mismatch");
            return Ok(MatchResult::Mismatched);
        }

        // Only consume the challenge we compared against. If it was superseded
        // in the meantime, the candidate belongs to a dead code.
        match self
            .challenges
            .clear_if(subject, |live| live.code == challenge.code)?
        {
            Some(consumed) => {
                tracing::info!(%subject, "Code matched");
                Ok(MatchResult::Matched(consumed))
            }
            None => Ok(MatchResult::Mismatched),
        }
    }
}
