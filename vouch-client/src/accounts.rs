//! The logged-in user's social accounts

use crate::models::Account;
use dashmap::DashMap;
use vouch_core::common::AccountRecord;

/// In-memory registry of the accounts the authority listed for the user
#[derive(Debug, Default)]
pub struct AccountBook {
    accounts: DashMap<String, Account>,
}

impl AccountBook {
    /// Replace the registry with the authority's latest listing.
    ///
    /// An account we promoted locally stays verified even if the listing
    /// lags behind.
    pub fn replace(&self, owner_user_id: &str, records: &[AccountRecord]) -> Vec<Account> {
        let accounts: Vec<Account> = records
            .iter()
            .map(|record| Account {
                id: record.id.clone(),
                handle: record.handle.clone(),
                owner_user_id: owner_user_id.to_string(),
                verified: record.verified
                    || self
                        .accounts
                        .get(&record.id)
                        .map_or(false, |known| known.verified),
            })
            .collect();

        self.accounts.clear();
        for account in &accounts {
            self.accounts.insert(account.id.clone(), account.clone());
        }

        tracing::debug!(count = accounts.len(), owner_user_id, "Refreshed accounts");
        accounts
    }

    /// Look up an account by id
    pub fn get(&self, account_id: &str) -> Option<Account> {
        self.accounts.get(account_id).map(|entry| entry.value().clone())
    }

    /// All accounts, ordered by handle
    pub fn list(&self) -> Vec<Account> {
        let mut accounts: Vec<_> = self
            .accounts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        accounts.sort_by(|a, b| a.handle.cmp(&b.handle));
        accounts
    }

    /// Mark an account verified. Returns the account if this changed anything.
    pub fn mark_verified(&self, account_id: &str) -> Option<Account> {
        let mut entry = self.accounts.get_mut(account_id)?;
        if entry.verified {
            return None;
        }
        entry.verified = true;
        Some(entry.value().clone())
    }

    /// Forget all accounts
    pub fn clear(&self) {
        self.accounts.clear();
    }
}
