//! Production engine setup code

use crate::{
    logging::LogAndHandleErrorMiddleware,
    settings,
    setups::{Authority, Clock, EngineSetup, SessionStore, StoreOp},
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use serde_json::{Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use url::Url;
use vouch_core::common::{
    AccountRecord, IssueEmailCodeRequest, OwnershipResponse, VerificationRequestBody,
};

/// Production implementation of `EngineSetup`.
/// Actually calls out to the authority configured in the settings.
#[derive(Clone, Debug, Default)]
pub struct ProdSetup;

impl EngineSetup for ProdSetup {
    type Authority = HttpAuthority;
    type SessionStore = FileSessionStore;
    type Clock = SystemClock;
}

/// The authority's data API over HTTP
#[derive(Clone, Debug)]
pub struct HttpAuthority {
    client: ClientWithMiddleware,
    api_endpoint: Url,
}

impl HttpAuthority {
    /// Connect to the authority configured in `settings`.
    /// Requests are logged, time out, and fail on non-2xx responses.
    pub fn new(settings: &settings::Authority) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("Building the HTTP client")?;

        Ok(Self::new_with(
            ClientBuilder::new(client)
                .with(LogAndHandleErrorMiddleware)
                .build(),
            settings.api_endpoint.clone(),
        ))
    }

    /// Use the given client for talking to the authority at `api_endpoint`
    pub fn new_with(client: ClientWithMiddleware, api_endpoint: Url) -> Self {
        Self {
            client,
            api_endpoint,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Not a usable API endpoint: {}", self.api_endpoint))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn get(&self, segments: &[&str]) -> Result<RequestBuilder> {
        Ok(self.client.get(self.url(segments)?))
    }

    fn post(&self, segments: &[&str]) -> Result<RequestBuilder> {
        Ok(self.client.post(self.url(segments)?))
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn issue_email_code(&self, user_id: &str, email: &str) -> Result<Value> {
        Ok(self
            .post(&["api", "auth", "email-code"])?
            .json(&IssueEmailCodeRequest {
                user_id: user_id.to_string(),
                email: email.to_string(),
            })
            .send()
            .await?
            .json()
            .await?)
    }

    async fn fetch_user_record(&self, email: &str) -> Result<Value> {
        let response: Value = self
            .get(&["api", "users"])?
            .query(&[("email", email)])
            .send()
            .await?
            .json()
            .await?;

        // Row-based backends answer lookups with a list of matches
        match response {
            Value::Array(rows) => rows
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("No user record for {email}")),
            record => Ok(record),
        }
    }

    async fn fetch_accounts_for_user(&self, user_id: &str) -> Result<Vec<AccountRecord>> {
        Ok(self
            .get(&["api", "users", user_id, "accounts"])?
            .send()
            .await?
            .json()
            .await?)
    }

    async fn submit_verification_request(&self, account_id: &str, code: &str) -> Result<()> {
        self.post(&["api", "accounts", account_id, "verification"])?
            .json(&VerificationRequestBody {
                code: code.to_string(),
            })
            .send()
            .await?;
        Ok(())
    }

    async fn check_ownership(&self, account_id: &str) -> Result<bool> {
        let response: OwnershipResponse = self
            .get(&["api", "accounts", account_id, "ownership"])?
            .send()
            .await?
            .json()
            .await?;
        Ok(response.verified)
    }
}

/// A session store backed by a JSON file.
///
/// A batch is written to a temporary file that then replaces the session
/// file, so a crash mid-write never leaves half a batch behind. Writing
/// uses blocking `std::fs` calls on the caller's thread. A session is a few
/// hundred bytes, which doesn't warrant `spawn_blocking`.
#[derive(Clone, Debug)]
pub struct FileSessionStore {
    path: Arc<PathBuf>,
    state: Arc<Mutex<Map<String, Value>>>,
}

impl FileSessionStore {
    /// Open the session file, or start empty if it doesn't exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Parsing session file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No session file yet");
                Map::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Reading session file {}", path.display()))
            }
        };

        Ok(Self {
            path: Arc::new(path),
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// The session file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.state.lock().get(key).cloned())
    }

    fn apply(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        for op in ops {
            op.apply_to(&mut next);
        }
        write_atomically(&self.path, &next)?;
        *state = next;
        Ok(())
    }
}

fn write_atomically(path: &Path, state: &Map<String, Value>) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(state)?)
        .with_context(|| format!("Writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Replacing {}", path.display()))?;
    Ok(())
}

/// The system's wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
