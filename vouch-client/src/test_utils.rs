//! Helpers for running an engine against a scripted authority
use crate::{
    engine::{Engine, EngineBuilder},
    models::Session,
    setups::test::{ManualClock, MemorySessionStore, TestAuthority, TestSetup},
};
use anyhow::{anyhow, Result};
use vouch_core::common::{AccountRecord, VerifiedRequest};

/// An engine wired to in-memory collaborators that tests can script and inspect
#[derive(Debug)]
pub struct TestContext {
    engine: Engine<TestSetup>,
    authority: TestAuthority,
    session: MemorySessionStore,
    clock: ManualClock,
}

impl TestContext {
    /// Create a new test context with default settings
    pub fn new() -> Result<Self> {
        Self::new_with(|builder| builder)
    }

    /// Create a new test context, customizing the engine before it's built
    pub fn new_with<F>(f: F) -> Result<Self>
    where
        F: FnOnce(EngineBuilder<TestSetup>) -> EngineBuilder<TestSetup>,
    {
        Self::new_with_session(MemorySessionStore::default(), f)
    }

    /// Create a new test context on top of existing session state,
    /// as if the process restarted
    pub fn new_with_session<F>(session: MemorySessionStore, f: F) -> Result<Self>
    where
        F: FnOnce(EngineBuilder<TestSetup>) -> EngineBuilder<TestSetup>,
    {
        let authority = TestAuthority::default();
        let clock = ManualClock::default();

        let builder = EngineBuilder::default()
            .with_authority(authority.clone())
            .with_session_store(session.clone())
            .with_clock(clock.clone());

        let engine = f(builder).finalize()?;

        Ok(Self {
            engine,
            authority,
            session,
            clock,
        })
    }

    /// The engine under test
    pub fn engine(&self) -> &Engine<TestSetup> {
        &self.engine
    }

    /// The scripted authority
    pub fn authority(&self) -> &TestAuthority {
        &self.authority
    }

    /// The session store
    pub fn session(&self) -> &MemorySessionStore {
        &self.session
    }

    /// The clock the engine reads
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Register `email` with the authority and run a complete email login
    pub async fn login(&self, email: &str, user_id: &str) -> Result<Session> {
        self.authority.add_user(email, user_id);
        self.engine.request_email_login(email).await.into_result()?;

        let code = self
            .authority
            .latest_email_code(email)
            .ok_or_else(|| anyhow!("No code was issued for {email}"))?;

        Ok(self.engine.submit_email_code(&code).await.into_result()?)
    }
}

/// An account as the authority lists it, without any verification state
pub fn account_record(id: &str, handle: &str) -> Result<AccountRecord> {
    Ok(AccountRecord {
        id: id.to_string(),
        handle: handle.parse()?,
        verified: false,
        verified_request: None,
    })
}

/// An account the authority already has a pending verification request for
pub fn pending_account_record(
    id: &str,
    handle: &str,
    code: &str,
    requested_at_ms: i64,
) -> Result<AccountRecord> {
    Ok(AccountRecord {
        verified_request: Some(VerifiedRequest {
            code: code.to_string(),
            requested_at: requested_at_ms,
        }),
        ..account_record(id, handle)?
    })
}
