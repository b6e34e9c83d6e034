//! Request and response data types that are shared between the verification engine and the authority API

use crate::handle::Handle;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Email login request struct
#[derive(Deserialize, Serialize, Validate, Clone, Debug)]
pub struct EmailLoginRequest {
    /// The email address of the user logging in
    #[validate(email)]
    pub email: String,
}

/// Body of the request asking the authority to email a fresh login code
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct IssueEmailCodeRequest {
    /// The authority's identifier for the user
    pub user_id: String,
    /// Where the code should be delivered
    pub email: String,
}

/// A pending ownership request as the authority remembers it
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct VerifiedRequest {
    /// The code the user was asked to place in their profile
    pub code: String,
    /// When the code was submitted, in unix milliseconds
    pub requested_at: i64,
}

/// A social account as listed by the authority
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct AccountRecord {
    /// The authority's identifier for the account
    pub id: String,
    /// The public handle on the social platform
    pub handle: Handle,
    /// Whether ownership was already proven
    #[serde(default)]
    pub verified: bool,
    /// An outstanding ownership request, if any
    #[serde(default)]
    pub verified_request: Option<VerifiedRequest>,
}

/// Body of the request registering an ownership code with the authority
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct VerificationRequestBody {
    /// The code the user is going to place in their profile
    pub code: String,
}

/// Answer to "is the code currently visible on the account's profile?"
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnershipResponse {
    /// Whether the code was observed
    pub verified: bool,
}
