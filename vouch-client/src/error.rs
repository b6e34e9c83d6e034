//! Error taxonomy of the verification flows, and the tri-state result
//! returned by every exit point of the [`Engine`](crate::engine::Engine).

use std::time::Duration;
use vouch_core::code::CodeError;

/// Everything that can go wrong in a verification flow
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// The email address doesn't validate
    #[error("That doesn't look like a valid email address")]
    InvalidEmail,

    /// The entered code isn't a complete code
    #[error("Please enter the complete code: {0}")]
    IncompleteCode(#[from] CodeError),

    /// An account operation was invoked without an account id
    #[error("An account id is required")]
    MissingAccountId,

    /// The account id doesn't belong to the logged-in user
    #[error("Couldn't find an account with id {0}")]
    UnknownAccount(String),

    /// The operation requires a completed email login
    #[error("Please log in first")]
    NotAuthenticated,

    /// The entered code is wrong
    #[error("That code doesn't match, please try again")]
    Mismatch,

    /// There's no code to compare against
    #[error("No verification code is available, please start over")]
    NoChallenge,

    /// The code wasn't on the profile during a manual check
    #[error("The code isn't on the profile yet (attempt {attempts} of {max_attempts})")]
    NotFoundOnProfile {
        /// Failed manual checks so far
        attempts: u32,
        /// Failed manual checks permitted before a reset is required
        max_attempts: u32,
    },

    /// Out of manual checks
    #[error("Too many failed checks, please reset the verification to get a new code")]
    ResetRequired,

    /// A manual check came too soon after the last one
    #[error("Please wait {} seconds before checking again", whole_seconds(*.remaining))]
    RateLimited {
        /// Until the next manual check is permitted
        remaining: Duration,
    },

    /// Nothing to do, ownership is proven already
    #[error("This account is already verified")]
    AlreadyVerified,

    /// The challenge outlived its time to live and was discarded
    #[error("The verification request expired, please request a new code")]
    Expired,

    /// A call to the authority failed or timed out
    #[error("The request to the authority failed: {0}")]
    Authority(#[source] anyhow::Error),

    /// The authority answered, but not with anything usable
    #[error("Unexpected response from the authority: {0}")]
    MalformedResponse(&'static str),

    /// Reading or writing the session store failed
    #[error("Couldn't access the session store: {0}")]
    Store(#[source] anyhow::Error),
}

impl FlowError {
    /// Whether this error ends an email login, sending the user back to the
    /// entry step. Account flow errors are always recoverable.
    pub fn is_fatal_to_email_flow(&self) -> bool {
        matches!(
            self,
            FlowError::NoChallenge
                | FlowError::Authority(_)
                | FlowError::MalformedResponse(_)
                | FlowError::Store(_)
        )
    }
}

/// The result of an exit point
#[derive(Debug)]
pub enum Outcome<T> {
    /// It worked
    Success(T),
    /// It didn't work, but the user can fix it in place
    Recoverable(FlowError),
    /// The flow is over, the user has to start over after `redirect_after`
    Fatal {
        /// What went wrong
        error: FlowError,
        /// How long to show the error before going back to the entry step
        redirect_after: Duration,
    },
}

impl<T> Outcome<T> {
    /// Whether this is [`Outcome::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Whether this is [`Outcome::Fatal`]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Fatal { .. })
    }

    /// The error, unless successful
    pub fn error(&self) -> Option<&FlowError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Recoverable(error) | Outcome::Fatal { error, .. } => Some(error),
        }
    }

    /// Drop the recoverable/fatal distinction
    pub fn into_result(self) -> Result<T, FlowError> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Recoverable(error) | Outcome::Fatal { error, .. } => Err(error),
        }
    }

    /// Map the success value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Recoverable(error) => Outcome::Recoverable(error),
            Outcome::Fatal {
                error,
                redirect_after,
            } => Outcome::Fatal {
                error,
                redirect_after,
            },
        }
    }
}

/// Seconds in `duration`, rounded up, so a countdown never shows 0 early.
pub fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_rate_limit_message_rounds_up() {
        let error = FlowError::RateLimited {
            remaining: Duration::from_millis(19_200),
        };
        assert_eq!(
            error.to_string(),
            "Please wait 20 seconds before checking again"
        );
    }

    #[test]
    fn test_email_flow_classification() {
        assert!(FlowError::NoChallenge.is_fatal_to_email_flow());
        assert!(FlowError::Authority(anyhow!("502")).is_fatal_to_email_flow());
        assert!(!FlowError::Mismatch.is_fatal_to_email_flow());
        assert!(!FlowError::InvalidEmail.is_fatal_to_email_flow());
    }
}
