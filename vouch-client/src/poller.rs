//! Background re-checking of pending account challenges.
//!
//! The platforms don't notify anyone when a profile changes, so pending
//! challenges are re-checked on a fixed interval. The loop is a single
//! cooperative task: a cycle checks accounts one after another and the
//! next tick isn't awaited until the cycle settled. The task ends by itself
//! once no challenge is pending, and can be cancelled at any point between
//! cycles.

use crate::{
    accounts::AccountBook,
    challenge::ChallengeStore,
    models::{Notice, Subject},
    promoter::SessionPromoter,
    setups::{bounded, Authority, EngineSetup},
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

/// Timing of the poll loop
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    /// Time between cycles
    pub interval: Duration,
    /// Age after which a pending challenge is discarded
    pub challenge_ttl: Duration,
    /// Upper bound for a single ownership check
    pub call_timeout: Duration,
}

/// What a single cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Set if another cycle was still running, in which case nothing happened
    pub skipped: bool,
    /// Accounts whose ownership was checked
    pub checked: usize,
    /// Accounts that were promoted
    pub verified: Vec<String>,
    /// Accounts whose challenge timed out
    pub expired: Vec<String>,
    /// Accounts whose check failed or timed out
    pub failed: Vec<String>,
}

/// The ownership poll loop
pub struct OwnershipPoller<S: EngineSetup> {
    inner: Arc<PollerInner<S>>,
    task: Mutex<Option<PollTask>>,
}

struct PollerInner<S: EngineSetup> {
    authority: S::Authority,
    challenges: Arc<ChallengeStore<S>>,
    promoter: Arc<SessionPromoter<S>>,
    book: Arc<AccountBook>,
    notices: broadcast::Sender<Notice>,
    idle: Arc<Notify>,
    in_cycle: AtomicBool,
    timing: PollTiming,
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl<S: EngineSetup> std::fmt::Debug for OwnershipPoller<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipPoller")
            .field("timing", &self.inner.timing)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<S: EngineSetup> OwnershipPoller<S> {
    /// Create a poller. Nothing runs until [`OwnershipPoller::ensure_running`].
    pub fn new(
        authority: S::Authority,
        challenges: Arc<ChallengeStore<S>>,
        promoter: Arc<SessionPromoter<S>>,
        book: Arc<AccountBook>,
        notices: broadcast::Sender<Notice>,
        idle: Arc<Notify>,
        timing: PollTiming,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                authority,
                challenges,
                promoter,
                book,
                notices,
                idle,
                in_cycle: AtomicBool::new(false),
                timing,
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the loop unless it's running already or there's nothing pending.
    /// Returns whether a new loop was started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure_running(&self) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().map_or(false, |task| !task.handle.is_finished()) {
            return false;
        }
        if self.inner.challenges.pending_accounts().is_empty() {
            tracing::debug!("Nothing pending, not starting the ownership poller");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.inner).run(cancel.clone()));
        *task = Some(PollTask { cancel, handle });

        tracing::info!(interval = ?self.inner.timing.interval, "Started the ownership poller");
        true
    }

    /// Stop the loop and wait for it to wind down.
    /// A cycle that's in progress is allowed to finish.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(PollTask { cancel, handle }) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(%e, "Ownership poller task ended abnormally");
            }
        }
    }

    /// Whether the loop is currently scheduled
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.handle.is_finished())
    }

    /// Run one cycle right now, outside the schedule.
    /// Skipped if a cycle is already in progress.
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.run_cycle().await
    }
}

impl<S: EngineSetup> PollerInner<S> {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.timing.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Ownership poller cancelled");
                    break;
                }
                _ = self.idle.notified() => {
                    if self.challenges.pending_accounts().is_empty() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    tracing::debug!(?report, "Ownership poll cycle done");
                    if self.challenges.pending_accounts().is_empty() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Ownership poller stopped");
    }

    async fn run_cycle(&self) -> CycleReport {
        if self
            .in_cycle
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Previous poll cycle still running, skipping");
            return CycleReport {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = CycleGuard(&self.in_cycle);

        let mut report = CycleReport::default();
        let now = self.challenges.now();

        for challenge in self.challenges.pending_accounts() {
            let Subject::Account(account_id) = &challenge.subject else {
                continue;
            };
            let handle = self.book.get(account_id).map(|account| account.handle);

            if challenge.is_expired(now, self.timing.challenge_ttl) {
                match self
                    .challenges
                    .clear_if(&challenge.subject, |live| live.code == challenge.code)
                {
                    Ok(Some(_)) => {
                        tracing::info!(account_id, "Account challenge timed out, discarded it");
                        report.expired.push(account_id.clone());
                        let _ = self.notices.send(Notice::ChallengeExpired {
                            account_id: account_id.clone(),
                            handle,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(account_id, ?e, "Couldn't discard timed out challenge")
                    }
                }
                continue;
            }

            report.checked += 1;
            let check = bounded(
                self.timing.call_timeout,
                self.authority.check_ownership(account_id),
            )
            .await;

            match check {
                Ok(true) => match self.promoter.promote_account(account_id) {
                    Ok(Some(_)) => {
                        report.verified.push(account_id.clone());
                        let _ = self.notices.send(Notice::AccountVerified {
                            account_id: account_id.clone(),
                            handle,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(account_id, ?e, "Couldn't promote verified account"),
                },
                Ok(false) => {
                    tracing::debug!(account_id, "Code not on the profile yet");
                }
                Err(e) => {
                    tracing::warn!(account_id, ?e, "Ownership check failed, retrying next cycle");
                    report.failed.push(account_id.clone());
                }
            }
        }

        report
    }
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setups::test::{Call, ManualClock, MemorySessionStore, TestAuthority, TestSetup};
    use testresult::TestResult;
    use vouch_core::common::AccountRecord;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    struct Fixture {
        poller: OwnershipPoller<TestSetup>,
        challenges: Arc<ChallengeStore<TestSetup>>,
        book: Arc<AccountBook>,
        authority: TestAuthority,
        clock: ManualClock,
        notices: broadcast::Receiver<Notice>,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let session = MemorySessionStore::default();
        let clock = ManualClock::default();
        let authority = TestAuthority::default();
        let challenges = Arc::new(ChallengeStore::open(session.clone(), clock.clone())?);
        let book = Arc::new(AccountBook::default());
        book.replace(
            "u-1",
            &["acc-1", "acc-2"].map(|id| AccountRecord {
                id: id.to_string(),
                handle: format!("handle_{}", &id[4..]).parse().unwrap(),
                verified: false,
                verified_request: None,
            }),
        );
        let idle = Arc::new(Notify::new());
        let promoter = Arc::new(SessionPromoter::new(
            session,
            Arc::clone(&challenges),
            Arc::clone(&book),
            Arc::clone(&idle),
        ));
        let (sender, notices) = broadcast::channel(16);
        let poller = OwnershipPoller::new(
            authority.clone(),
            Arc::clone(&challenges),
            promoter,
            Arc::clone(&book),
            sender,
            idle,
            PollTiming {
                interval: Duration::from_secs(30),
                challenge_ttl: 24 * HOUR,
                call_timeout: Duration::from_secs(10),
            },
        );
        Ok(Fixture {
            poller,
            challenges,
            book,
            authority,
            clock,
            notices,
        })
    }

    #[test_log::test(tokio::test)]
    async fn test_cycle_promotes_observed_accounts() -> TestResult {
        let mut f = fixture()?;
        f.challenges
            .issue_with_code(Subject::account("acc-1"), "11111111".parse()?)?;
        f.challenges
            .issue_with_code(Subject::account("acc-2"), "22222222".parse()?)?;
        f.authority.set_ownership("acc-1", true);

        let report = f.poller.run_cycle().await;

        assert_eq!(report.checked, 2);
        assert_eq!(report.verified, vec!["acc-1".to_string()]);
        assert!(f.book.get("acc-1").map_or(false, |a| a.verified));
        assert_eq!(f.challenges.get(&Subject::account("acc-1")), None);
        assert!(f.challenges.get(&Subject::account("acc-2")).is_some());
        assert!(matches!(
            f.notices.try_recv()?,
            Notice::AccountVerified { account_id, .. } if account_id == "acc-1"
        ));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_background_misses_dont_count_as_attempts() -> TestResult {
        let f = fixture()?;
        f.challenges
            .issue_with_code(Subject::account("acc-1"), "11111111".parse()?)?;

        for _ in 0..5 {
            f.poller.run_cycle().await;
        }

        let challenge = f.challenges.get(&Subject::account("acc-1"));
        assert_eq!(challenge.map(|c| (c.attempt_count, c.last_attempt_at)), Some((0, None)));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_expired_challenges_are_silently_reset() -> TestResult {
        let mut f = fixture()?;
        f.challenges
            .issue_with_code(Subject::account("acc-1"), "11111111".parse()?)?;
        f.challenges.update(&Subject::account("acc-1"), |c| c.attempt_count = 2)?;
        f.authority.set_ownership("acc-1", true);

        f.clock.advance(24 * HOUR + Duration::from_secs(60));
        let report = f.poller.run_cycle().await;

        assert_eq!(report.expired, vec!["acc-1".to_string()]);
        assert_eq!(report.checked, 0);
        assert_eq!(f.authority.calls(Call::CheckOwnership), 0);
        assert_eq!(f.challenges.get(&Subject::account("acc-1")), None);
        assert!(!f.book.get("acc-1").map_or(true, |a| a.verified));
        assert!(matches!(
            f.notices.try_recv()?,
            Notice::ChallengeExpired { account_id, .. } if account_id == "acc-1"
        ));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failures_are_swallowed_per_account() -> TestResult {
        let f = fixture()?;
        f.challenges
            .issue_with_code(Subject::account("acc-1"), "11111111".parse()?)?;
        f.authority.fail(Call::CheckOwnership);

        let report = f.poller.run_cycle().await;

        assert_eq!(report.failed, vec!["acc-1".to_string()]);
        assert!(f.challenges.get(&Subject::account("acc-1")).is_some());
        Ok(())
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_hanging_check_doesnt_wedge_the_cycle() -> TestResult {
        let f = fixture()?;
        f.challenges
            .issue_with_code(Subject::account("acc-1"), "11111111".parse()?)?;
        f.challenges
            .issue_with_code(Subject::account("acc-2"), "22222222".parse()?)?;
        f.authority.hang(Call::CheckOwnership);

        let report = f.poller.run_cycle().await;

        assert_eq!(report.failed.len(), 2);
        Ok(())
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_overlapping_cycle_is_skipped() -> TestResult {
        let f = fixture()?;
        f.challenges
            .issue_with_code(Subject::account("acc-1"), "11111111".parse()?)?;
        f.authority.hang(Call::CheckOwnership);

        let (first, second) = tokio::join!(f.poller.run_cycle(), async {
            tokio::task::yield_now().await;
            f.poller.run_cycle().await
        });

        assert!(!first.skipped);
        assert!(second.skipped);
        assert!(!f.poller.run_cycle().await.skipped);
        Ok(())
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_loop_runs_on_interval_and_stops_when_nothing_is_pending() -> TestResult {
        let f = fixture()?;
        f.challenges
            .issue_with_code(Subject::account("acc-1"), "11111111".parse()?)?;

        assert!(f.poller.ensure_running());
        assert!(!f.poller.ensure_running());

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(f.authority.calls(Call::CheckOwnership), 2);
        assert!(f.poller.is_running());

        f.authority.set_ownership("acc-1", true);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(f.authority.calls(Call::CheckOwnership), 3);
        assert!(!f.poller.is_running());
        Ok(())
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_loop_stops_when_last_challenge_is_promoted_elsewhere() -> TestResult {
        let f = fixture()?;
        f.challenges
            .issue_with_code(Subject::account("acc-1"), "11111111".parse()?)?;
        assert!(f.poller.ensure_running());

        f.poller.inner.promoter.promote_account("acc-1")?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!f.poller.is_running());
        assert_eq!(f.authority.calls(Call::CheckOwnership), 0);
        Ok(())
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_stop_cancels_the_loop() -> TestResult {
        let f = fixture()?;
        f.challenges
            .issue_with_code(Subject::account("acc-1"), "11111111".parse()?)?;
        assert!(f.poller.ensure_running());

        f.poller.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(!f.poller.is_running());
        assert_eq!(f.authority.calls(Call::CheckOwnership), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_nothing_pending_doesnt_start() {
        let f = fixture().unwrap();
        assert!(!f.poller.ensure_running());
        assert!(!f.poller.is_running());
    }
}
