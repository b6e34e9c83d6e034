//! Verification codes

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Number of digits in a login code emailed by the authority.
pub const EMAIL_CODE_DIGITS: usize = 6;

/// Number of digits in a code the user places on their social profile.
pub const ACCOUNT_CODE_DIGITS: usize = 8;

/// Reasons a candidate string isn't a usable code
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// Fewer or more digits than expected
    #[error("expected {expected} digits, got {actual}")]
    WrongLength {
        /// Required number of digits
        expected: usize,
        /// Number of characters after trimming
        actual: usize,
    },
    /// Something other than `0-9` in the code
    #[error("codes may only contain the digits 0-9")]
    NonDigit,
    /// Nothing but whitespace
    #[error("no code entered")]
    Empty,
}

/// A string of ASCII digits.
///
/// Construction trims surrounding whitespace. No other normalization
/// happens, so equality is exact string equality.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct VerificationCode(String);

impl VerificationCode {
    /// Parse a code that must have exactly `digits` digits
    pub fn parse_exact(candidate: &str, digits: usize) -> Result<Self, CodeError> {
        let code: Self = match candidate.parse() {
            Err(CodeError::Empty) => {
                return Err(CodeError::WrongLength {
                    expected: digits,
                    actual: 0,
                })
            }
            other => other?,
        };
        if code.len() != digits {
            return Err(CodeError::WrongLength {
                expected: digits,
                actual: code.len(),
            });
        }
        Ok(code)
    }

    /// Parse a six digit email login code
    pub fn parse_email(candidate: &str) -> Result<Self, CodeError> {
        Self::parse_exact(candidate, EMAIL_CODE_DIGITS)
    }

    /// Generate a random code with `digits` digits, zero padded.
    pub fn generate(digits: usize) -> Self {
        let mut rng = rand::thread_rng();
        Self(
            (0..digits)
                .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                .collect(),
        )
    }

    /// Generate a random code guaranteed to differ from `previous`.
    pub fn generate_excluding(digits: usize, previous: Option<&str>) -> Self {
        loop {
            let code = Self::generate(digits);
            if Some(code.as_str()) != previous {
                return code;
            }
        }
    }

    /// The digits as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of digits
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the code has no digits. Never true for a parsed code.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for VerificationCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, CodeError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CodeError::Empty);
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodeError::NonDigit);
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for VerificationCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, CodeError> {
        value.parse()
    }
}

impl From<VerificationCode> for String {
    fn from(code: VerificationCode) -> Self {
        code.0
    }
}

impl AsRef<str> for VerificationCode {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for VerificationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for VerificationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VerificationCode").field(&self.0).finish()
    }
}

/// Slot-based digit entry for a code.
///
/// Filling the last empty slot yields the complete code exactly once.
/// Further edits while all slots stay filled yield nothing until the
/// entry becomes incomplete again (via [`CodeEntry::backspace`] or
/// [`CodeEntry::clear`]).
#[derive(Debug, Clone)]
pub struct CodeEntry {
    slots: Vec<Option<char>>,
    fired: bool,
}

impl CodeEntry {
    /// An empty entry with `digits` slots
    pub fn new(digits: usize) -> Self {
        Self {
            slots: vec![None; digits],
            fired: false,
        }
    }

    /// An empty entry sized for email login codes
    pub fn email() -> Self {
        Self::new(EMAIL_CODE_DIGITS)
    }

    /// Set the digit at `index`. Non-digits and out-of-range indices are ignored.
    pub fn set(&mut self, index: usize, digit: char) -> Option<VerificationCode> {
        if !digit.is_ascii_digit() {
            return None;
        }
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(digit);
        }
        self.poll_complete()
    }

    /// Fill the first empty slot.
    pub fn push(&mut self, digit: char) -> Option<VerificationCode> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.set(index, digit)
    }

    /// Fill slots from pasted text, skipping whitespace and separators.
    pub fn paste(&mut self, text: &str) -> Option<VerificationCode> {
        let mut completed = None;
        for digit in text.chars().filter(char::is_ascii_digit) {
            if let Some(code) = self.push(digit) {
                completed = Some(code);
            }
        }
        completed
    }

    /// Empty the last filled slot.
    pub fn backspace(&mut self) {
        if let Some(slot) = self.slots.iter_mut().rev().find(|slot| slot.is_some()) {
            *slot = None;
        }
        self.fired = false;
    }

    /// Empty all slots, e.g. after a mismatch.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.fired = false;
    }

    /// Whether every slot holds a digit
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn poll_complete(&mut self) -> Option<VerificationCode> {
        if !self.is_complete() {
            self.fired = false;
            return None;
        }
        if self.fired {
            return None;
        }
        self.fired = true;
        Some(VerificationCode(self.slots.iter().flatten().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_trims_whitespace() {
        let code = VerificationCode::parse_email(" 482913\n").unwrap();
        assert_eq!(code.as_str(), "482913");
    }

    #[test]
    fn test_parse_rejects_incomplete_and_non_digits() {
        assert_matches!(
            VerificationCode::parse_email("4829"),
            Err(CodeError::WrongLength {
                expected: 6,
                actual: 4
            })
        );
        assert_matches!(
            VerificationCode::parse_email("48a913"),
            Err(CodeError::NonDigit)
        );
        assert_matches!(
            VerificationCode::parse_email("   "),
            Err(CodeError::WrongLength { actual: 0, .. })
        );
    }

    #[test]
    fn test_generated_codes_are_zero_padded_digits() {
        for _ in 0..100 {
            let code = VerificationCode::generate(ACCOUNT_CODE_DIGITS);
            assert_eq!(code.len(), ACCOUNT_CODE_DIGITS);
            assert!(code.as_str().bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_generate_excluding_never_repeats() {
        // With a single digit the collision chance per draw is 1/10
        for _ in 0..100 {
            let code = VerificationCode::generate_excluding(1, Some("7"));
            assert_ne!(code.as_str(), "7");
        }
    }

    #[test]
    fn test_entry_fires_once_on_sixth_digit() {
        let mut entry = CodeEntry::email();
        for digit in "48291".chars() {
            assert_eq!(entry.push(digit), None);
        }
        let code = entry.push('3').expect("sixth digit completes the code");
        assert_eq!(code.as_str(), "482913");

        // Editing a filled slot doesn't re-submit
        assert_eq!(entry.set(0, '5'), None);
        assert_eq!(entry.push('1'), None);
    }

    #[test]
    fn test_entry_rearms_after_clear() {
        let mut entry = CodeEntry::email();
        assert!(entry.paste("111 111").is_some());
        entry.clear();
        assert!(!entry.is_complete());
        let code = entry.paste("222-222").expect("refilled entry fires again");
        assert_eq!(code.as_str(), "222222");
    }

    #[test]
    fn test_entry_rearms_after_backspace() {
        let mut entry = CodeEntry::email();
        assert!(entry.paste("123456").is_some());
        entry.backspace();
        let code = entry.push('9').expect("completing again fires");
        assert_eq!(code.as_str(), "123459");
    }

    #[test]
    fn test_entry_ignores_non_digits() {
        let mut entry = CodeEntry::new(2);
        assert_eq!(entry.push('x'), None);
        assert_eq!(entry.set(5, '1'), None);
        assert!(!entry.is_complete());
    }
}
