//! Test engine setup code

use crate::setups::{Authority, Clock, EngineSetup, SessionStore, StoreOp};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use vouch_core::{code::VerificationCode, common::AccountRecord};

/// The unit testing setup: scripted authority, in-memory session, manual clock
#[derive(Clone, Debug, Default)]
pub struct TestSetup;

impl EngineSetup for TestSetup {
    type Authority = TestAuthority;
    type SessionStore = MemorySessionStore;
    type Clock = ManualClock;
}

/// The authority calls, for scripting failures and counting calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    /// [`Authority::issue_email_code`]
    IssueEmailCode,
    /// [`Authority::fetch_user_record`]
    FetchUserRecord,
    /// [`Authority::fetch_accounts_for_user`]
    FetchAccounts,
    /// [`Authority::submit_verification_request`]
    SubmitVerification,
    /// [`Authority::check_ownership`]
    CheckOwnership,
}

/// An in-memory authority whose answers are scripted by the test
#[derive(Debug, Default, Clone)]
pub struct TestAuthority {
    inner: Arc<State>,
}

#[derive(Debug, Default)]
struct State {
    users: DashMap<String, String>,
    latest_email_codes: DashMap<String, String>,
    next_email_codes: Mutex<VecDeque<String>>,
    issue_responses: Mutex<VecDeque<Value>>,
    accounts: DashMap<String, Vec<AccountRecord>>,
    submitted: DashMap<String, String>,
    ownership: DashMap<String, bool>,
    failing: DashSet<Call>,
    hanging: DashSet<Call>,
    calls: DashMap<Call, usize>,
}

impl TestAuthority {
    /// Register a user
    pub fn add_user(&self, email: &str, user_id: &str) {
        self.inner
            .users
            .insert(email.to_lowercase(), user_id.to_string());
    }

    /// The code the next email code request hands out
    pub fn queue_email_code(&self, code: &str) {
        self.inner.next_email_codes.lock().push_back(code.to_string());
    }

    /// Answer the next email code request with this raw body instead
    pub fn queue_issue_response(&self, response: Value) {
        self.inner.issue_responses.lock().push_back(response);
    }

    /// The accounts listed for a user
    pub fn set_accounts(&self, user_id: &str, accounts: Vec<AccountRecord>) {
        self.inner.accounts.insert(user_id.to_string(), accounts);
    }

    /// Whether the code is visible on the account's profile
    pub fn set_ownership(&self, account_id: &str, visible: bool) {
        self.inner.ownership.insert(account_id.to_string(), visible);
    }

    /// Make every future `call` fail
    pub fn fail(&self, call: Call) {
        self.inner.failing.insert(call);
    }

    /// Make every future `call` never resolve
    pub fn hang(&self, call: Call) {
        self.inner.hanging.insert(call);
    }

    /// Undo [`TestAuthority::fail`] and [`TestAuthority::hang`]
    pub fn recover(&self, call: Call) {
        self.inner.failing.remove(&call);
        self.inner.hanging.remove(&call);
    }

    /// How often `call` was invoked
    pub fn calls(&self, call: Call) -> usize {
        self.inner.calls.get(&call).map_or(0, |count| *count)
    }

    /// The last code registered for an account
    pub fn submitted_code(&self, account_id: &str) -> Option<String> {
        self.inner
            .submitted
            .get(account_id)
            .map(|code| code.value().clone())
    }

    /// The last login code handed out for an email address
    pub fn latest_email_code(&self, email: &str) -> Option<String> {
        self.inner
            .latest_email_codes
            .get(&email.to_lowercase())
            .map(|code| code.value().clone())
    }

    async fn enter(&self, call: Call) -> Result<()> {
        *self.inner.calls.entry(call).or_default() += 1;
        if self.inner.hanging.contains(&call) {
            std::future::pending::<()>().await;
        }
        if self.inner.failing.contains(&call) {
            bail!("{call:?} failed (scripted)");
        }
        Ok(())
    }
}

#[async_trait]
impl Authority for TestAuthority {
    async fn issue_email_code(&self, _user_id: &str, email: &str) -> Result<Value> {
        self.enter(Call::IssueEmailCode).await?;

        let code = self
            .inner
            .next_email_codes
            .lock()
            .pop_front()
            .unwrap_or_else(|| VerificationCode::generate(6).to_string());
        self.inner
            .latest_email_codes
            .insert(email.to_lowercase(), code.clone());

        let scripted = self.inner.issue_responses.lock().pop_front();
        Ok(scripted.unwrap_or_else(|| json!({ "status": "sent", "code": code })))
    }

    async fn fetch_user_record(&self, email: &str) -> Result<Value> {
        self.enter(Call::FetchUserRecord).await?;

        let email = email.to_lowercase();
        let user_id = self
            .inner
            .users
            .get(&email)
            .map(|id| id.value().clone())
            .ok_or_else(|| anyhow!("No user with email {email}"))?;

        let mut record = json!({ "id": user_id, "email": email });
        if let Some(code) = self.latest_email_code(&email) {
            record["verification_code"] = Value::String(code);
        }
        Ok(record)
    }

    async fn fetch_accounts_for_user(&self, user_id: &str) -> Result<Vec<AccountRecord>> {
        self.enter(Call::FetchAccounts).await?;
        Ok(self
            .inner
            .accounts
            .get(user_id)
            .map(|accounts| accounts.value().clone())
            .unwrap_or_default())
    }

    async fn submit_verification_request(&self, account_id: &str, code: &str) -> Result<()> {
        self.enter(Call::SubmitVerification).await?;
        self.inner
            .submitted
            .insert(account_id.to_string(), code.to_string());
        Ok(())
    }

    async fn check_ownership(&self, account_id: &str) -> Result<bool> {
        self.enter(Call::CheckOwnership).await?;
        Ok(self
            .inner
            .ownership
            .get(account_id)
            .map_or(false, |visible| *visible))
    }
}

/// A session store that lives as long as its clones
#[derive(Debug, Default, Clone)]
pub struct MemorySessionStore {
    map: Arc<Mutex<Map<String, Value>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemorySessionStore {
    /// Make all writes fail, to exercise error paths
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// A copy of everything stored
    pub fn snapshot(&self) -> Map<String, Value> {
        self.map.lock().clone()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn apply(&self, ops: Vec<StoreOp>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("Session store writes are failing (scripted)");
        }
        let mut map = self.map.lock();
        for op in ops {
            op.apply_to(&mut map);
        }
        Ok(())
    }
}

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        let start = DateTime::parse_from_rfc3339("2024-01-01T09:00:00Z")
            .expect("valid hardcoded timestamp")
            .with_timezone(&Utc);
        Self::new(start)
    }
}

impl ManualClock {
    /// A clock standing at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).expect("duration in range");
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
