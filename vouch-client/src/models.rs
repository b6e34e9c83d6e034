//! The engine's data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use vouch_core::{code::VerificationCode, handle::Handle};

/// Who a challenge is for
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subject {
    /// An email address going through login
    Email(String),
    /// A social account going through ownership verification
    Account(String),
}

impl Subject {
    /// The subject for an email address. Addresses are compared lowercased.
    pub fn email(email: &str) -> Self {
        Self::Email(email.trim().to_lowercase())
    }

    /// The subject for an account id
    pub fn account(account_id: &str) -> Self {
        Self::Account(account_id.to_string())
    }

    /// The email address or account id
    pub fn id(&self) -> &str {
        match self {
            Subject::Email(id) | Subject::Account(id) => id,
        }
    }

    /// Whether this is an account subject
    pub fn is_account(&self) -> bool {
        matches!(self, Subject::Account(_))
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Email(email) => write!(f, "email {email}"),
            Subject::Account(id) => write!(f, "account {id}"),
        }
    }
}

/// Where a subject is in its verification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    /// No verification requested, or the last one timed out
    Unverified,
    /// A code was issued and is waiting to be observed
    Pending,
    /// Proven
    Verified,
}

/// The code currently valid for a subject, and since when
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationChallenge {
    /// Who the code is for
    pub subject: Subject,
    /// The code
    pub code: VerificationCode,
    /// When the code was issued
    pub issued_at: DateTime<Utc>,
    /// Failed manual checks since the code was issued
    pub attempt_count: u32,
    /// Where the subject is in its verification
    pub status: ChallengeStatus,
    /// When the last manual check was admitted
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl VerificationChallenge {
    /// A fresh pending challenge
    pub fn new(subject: Subject, code: VerificationCode, issued_at: DateTime<Utc>) -> Self {
        Self {
            subject,
            code,
            issued_at,
            attempt_count: 0,
            status: ChallengeStatus::Pending,
            last_attempt_at: None,
        }
    }

    /// Whether the challenge is older than `ttl` at `now`
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        (now - self.issued_at)
            .to_std()
            .map_or(false, |age| age > ttl)
    }

    /// Whether the challenge is still waiting for the code to be observed
    pub fn is_pending(&self) -> bool {
        self.status == ChallengeStatus::Pending
    }
}

/// A social account whose ownership can be proven
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// The authority's identifier
    pub id: String,
    /// The public handle
    pub handle: Handle,
    /// The user the account is linked to
    pub owner_user_id: String,
    /// Whether ownership is proven
    pub verified: bool,
}

/// What the user can do next with an account
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affordance {
    /// Request a verification code
    Verify,
    /// A code is out, check whether it's on the profile
    Check,
    /// The last check missed, try again
    Retry {
        /// Manual checks left before a reset is required
        attempts_left: u32,
    },
    /// Cooling down after the last manual check
    Wait {
        /// Until the next manual check is permitted
        remaining: Duration,
    },
    /// Out of manual checks, only a full reset is permitted
    MustReset,
    /// Nothing left to do
    Verified,
}

/// An account together with its live challenge and what can be done next
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountView {
    /// The account
    pub account: Account,
    /// The outstanding challenge, if any
    pub challenge: Option<VerificationChallenge>,
    /// What the user can do next
    pub affordance: Affordance,
}

impl AccountView {
    /// The account's verification status
    pub fn status(&self) -> ChallengeStatus {
        if self.account.verified {
            ChallengeStatus::Verified
        } else {
            self.challenge
                .as_ref()
                .map_or(ChallengeStatus::Unverified, |challenge| challenge.status)
        }
    }
}

/// The login state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    /// The verified email address
    pub email: Option<String>,
    /// Whether the email login completed
    pub authenticated: bool,
}

/// An email login waiting for its code
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailLogin {
    /// Where the code was sent
    pub email: String,
    /// When the code was issued
    pub issued_at: DateTime<Utc>,
}

/// Something the user should be told about, even if they didn't ask
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// The code was found on the profile
    AccountVerified {
        /// The account's id
        account_id: String,
        /// The account's handle, if known
        handle: Option<Handle>,
    },
    /// The code wasn't found in time and was discarded
    ChallengeExpired {
        /// The account's id
        account_id: String,
        /// The account's handle, if known
        handle: Option<Handle>,
    },
}
