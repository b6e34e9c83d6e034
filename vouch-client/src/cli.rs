//! Main vouch command line entry points
use crate::{
    engine::{Engine, EngineBuilder},
    error::{FlowError, Outcome},
    logging::setup_tracing,
    models::{AccountView, Affordance, Notice, Session},
    paths::config_file,
    settings::Settings,
    setups::prod::{FileSessionStore, HttpAuthority, ProdSetup, SystemClock},
};
use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use inquire::ui::RenderConfig;
use std::{io::Write, path::PathBuf};
use tokio::sync::broadcast::error::RecvError;
use vouch_core::code::{CodeEntry, EMAIL_CODE_DIGITS};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "vouch")]
#[command(about = "Log in with an emailed code and prove you own your social accounts")]
pub struct Cli {
    #[arg(long, help = "Path to the JSON file holding the session")]
    session_file: Option<PathBuf>,
    #[arg(long, help = "Whether to turn off ansi terminal colors")]
    no_colors: bool,
    #[command(subcommand)]
    command: Commands,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Log in via a code sent to your email address
    Login(LoginCommand),
    /// Ask for a new code for the login in progress
    Resend,
    /// Forget the session, including all pending verifications
    Logout,
    /// Show who's logged in and the state of your accounts
    Status,
    /// Prove ownership of your linked social accounts
    Accounts(AccountCmds),
    /// Print file paths used by the application (e.g. the path to config)
    Paths,
}

/// Arguments of `login`
#[derive(Debug, Parser)]
pub struct LoginCommand {
    /// The email address to log in with. Asked for if not provided.
    email: Option<String>,
}

/// Account commands
#[derive(Debug, Parser)]
pub struct AccountCmds {
    #[command(subcommand)]
    command: AccountCommands,
}

/// Account subcommands
#[derive(Debug, Subcommand)]
pub enum AccountCommands {
    /// List your linked accounts and their verification state
    List,
    /// Get a code to put on the account's profile
    Verify(AccountArg),
    /// Check right now whether the code is on the profile
    Check(CheckCommand),
    /// Discard the account's code and get a new one
    Reset(ResetCommand),
    /// Wait for pending verifications to go through
    Watch,
}

/// A required account id
#[derive(Debug, Parser)]
pub struct AccountArg {
    /// The account's id, as shown by `vouch accounts list`
    account_id: String,
}

/// Arguments of `accounts check`
#[derive(Debug, Parser)]
pub struct CheckCommand {
    /// The account's id, as shown by `vouch accounts list`
    account_id: String,
    /// If checking is cooling down, wait for it instead of giving up
    #[arg(long)]
    wait: bool,
}

/// Arguments of `accounts reset`
#[derive(Debug, Parser)]
pub struct ResetCommand {
    /// The account's id.
    /// If not provided, you're asked to pick one of your pending accounts.
    account_id: Option<String>,
}

impl Cli {
    /// Run the command
    pub async fn run(&self, mut settings: Settings) -> Result<()> {
        let ansi = !self.no_colors;
        setup_tracing(ansi);

        if let Some(session_file) = &self.session_file {
            settings.storage.session_file = session_file.clone();
        }

        if let Commands::Paths = &self.command {
            match config_file() {
                Some(path) => println!("{}", path.display()),
                None => println!("(no config directory on this platform)"),
            }
            println!("{}", settings.storage.session_file.display());
            return Ok(());
        }

        let state = CliState::load(&settings, ansi)?;

        match &self.command {
            Commands::Login(login) => {
                let session = state.login(login.email.clone()).await?;
                if let Some(email) = &session.email {
                    println!("Logged in as {email}.");
                }
                tracing::info!(?session, "Logged in");
            }
            Commands::Resend => {
                if state.resend().await {
                    state.enter_code().await?;
                }
            }
            Commands::Logout => {
                if report(state.engine.logout().await).is_some() {
                    println!("Logged out.");
                }
            }
            Commands::Status => {
                let session = state.engine.session()?;
                match (&session.email, session.authenticated) {
                    (Some(email), true) => println!("Logged in as {email}."),
                    _ => {
                        println!("Not logged in. Use \"vouch login\" to log in.");
                        return Ok(());
                    }
                }
                if let Some(views) = report(state.engine.refresh_accounts().await) {
                    print_accounts(&views);
                }
            }
            Commands::Accounts(accounts) => state.accounts(&accounts.command).await?,
            Commands::Paths => {}
        }

        Ok(())
    }
}

pub(crate) struct CliState {
    pub(crate) engine: Engine<ProdSetup>,
    pub(crate) render_config: RenderConfig,
}

impl std::fmt::Debug for CliState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliState")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl CliState {
    fn load(settings: &Settings, colors: bool) -> Result<Self> {
        let render_config = if colors {
            RenderConfig::default_colored()
        } else {
            RenderConfig::empty()
        };

        let session = FileSessionStore::open(&settings.storage.session_file)?;
        tracing::debug!(path = %session.path().display(), "Opened session");

        let engine = EngineBuilder::default()
            .with_settings(settings.verification.clone())
            .with_authority(HttpAuthority::new(&settings.authority)?)
            .with_session_store(session)
            .with_clock(SystemClock)
            .finalize()?;

        Ok(Self {
            engine,
            render_config,
        })
    }

    /// Request a code and keep asking for it until the login completes.
    /// A fatal error starts over from the email address.
    async fn login(&self, mut email: Option<String>) -> Result<Session> {
        loop {
            let address = match email.take() {
                Some(address) => address,
                None => inquire::Text::new("What's your email address?")
                    .with_render_config(self.render_config)
                    .prompt()?,
            };

            match settle(self.engine.request_email_login(&address).await).await {
                Step::Done(login) => println!("We sent a login code to {}.", login.email),
                Step::Retry | Step::Restart => continue,
            }

            if let Some(session) = self.enter_code().await? {
                return Ok(session);
            }
        }
    }

    /// Ask for the code until it matches. Returns `None` if the login has to
    /// start over.
    async fn enter_code(&self) -> Result<Option<Session>> {
        let mut entry = CodeEntry::email();
        loop {
            let input = inquire::Text::new(&format!(
                "Please enter the {EMAIL_CODE_DIGITS}-digit code (or \"resend\"):"
            ))
            .with_render_config(self.render_config)
            .prompt()?;

            if input.trim().eq_ignore_ascii_case("resend") {
                if !self.resend().await {
                    return Ok(None);
                }
                continue;
            }

            entry.clear();
            let Some(code) = entry.paste(&input) else {
                println!("Please enter all {EMAIL_CODE_DIGITS} digits.");
                continue;
            };

            match settle(self.engine.submit_email_code(code.as_str()).await).await {
                Step::Done(session) => return Ok(Some(session)),
                Step::Retry => {}
                Step::Restart => return Ok(None),
            }
        }
    }

    /// Returns whether the login can go on
    async fn resend(&self) -> bool {
        println!("Requesting a new code...");
        match settle(self.engine.resend_email_code().await).await {
            Step::Done(login) => {
                println!("We sent a new login code to {}.", login.email);
                true
            }
            Step::Retry => true,
            Step::Restart => false,
        }
    }

    async fn accounts(&self, command: &AccountCommands) -> Result<()> {
        match command {
            AccountCommands::List => {
                if let Some(views) = report(self.engine.refresh_accounts().await) {
                    print_accounts(&views);
                }
            }
            AccountCommands::Verify(AccountArg { account_id }) => {
                if let Some(view) =
                    report(self.engine.request_account_verification(account_id).await)
                {
                    print_instructions(&view);
                    self.watch().await?;
                }
            }
            AccountCommands::Check(check) => self.check(check).await?,
            AccountCommands::Reset(reset) => {
                let account_id = match &reset.account_id {
                    Some(account_id) => Some(account_id.clone()),
                    None => self.pick_pending_account().await?,
                };
                if let Some(view) = report(
                    self.engine
                        .reset_account_verification(account_id.as_deref())
                        .await,
                ) {
                    print_instructions(&view);
                }
            }
            AccountCommands::Watch => {
                if report(self.engine.refresh_accounts().await).is_some() {
                    self.watch().await?;
                }
            }
        }
        Ok(())
    }

    async fn check(&self, check: &CheckCommand) -> Result<()> {
        loop {
            match self.engine.manual_account_check(&check.account_id).await {
                Outcome::Recoverable(FlowError::RateLimited { .. }) if check.wait => {
                    let mut ticks = Box::pin(self.engine.countdown(&check.account_id));
                    while let Some(secs) = ticks.next().await {
                        print!("\rChecking again in {secs:>3}s");
                        std::io::stdout().flush()?;
                    }
                    println!();
                }
                outcome => {
                    if let Some(view) = report(outcome) {
                        print_account(&view);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Print verifications and timeouts until nothing is pending anymore,
    /// or until interrupted.
    async fn watch(&self) -> Result<()> {
        if !self.engine.poller().is_running() {
            println!("Nothing pending.");
            return Ok(());
        }

        println!("Waiting for the code to show up on the profile. Press Ctrl-C to stop.");
        let mut notices = self.engine.subscribe();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    break;
                }
                notice = notices.recv() => match notice {
                    Ok(Notice::AccountVerified { account_id, handle }) => {
                        println!("Verified {}.", display_name(&account_id, handle.as_ref()));
                    }
                    Ok(Notice::ChallengeExpired { account_id, handle }) => {
                        println!(
                            "The code for {} expired. Use \"vouch accounts verify {account_id}\" to get a new one.",
                            display_name(&account_id, handle.as_ref())
                        );
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Missed notices");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            if !self.engine.poller().is_running() {
                break;
            }
        }

        self.engine.poller().stop().await;
        Ok(())
    }

    async fn pick_pending_account(&self) -> Result<Option<String>> {
        let Some(views) = report(self.engine.refresh_accounts().await) else {
            return Ok(None);
        };
        let mut pending: Vec<_> = views
            .into_iter()
            .filter(|view| view.challenge.is_some() && !view.account.verified)
            .collect();

        if pending.len() > 1 {
            let options = pending
                .iter()
                .map(|view| format!("{} ({})", view.account.handle, view.account.id))
                .collect();
            let picked = inquire::Select::new("Which account do you want to reset?", options)
                .with_render_config(self.render_config)
                .raw_prompt()?;
            Ok(Some(pending.swap_remove(picked.index).account.id))
        } else {
            Ok(pending.pop().map(|view| view.account.id))
        }
    }
}

/// Print the error of an unsuccessful outcome
/// Where the email login goes after an exit point returned
#[derive(Debug, PartialEq, Eq)]
enum Step<T> {
    Done(T),
    Retry,
    Restart,
}

/// Print a failure. A fatal one is shown for its redirect delay before the
/// login starts over.
async fn settle<T>(outcome: Outcome<T>) -> Step<T> {
    match outcome {
        Outcome::Success(value) => Step::Done(value),
        Outcome::Recoverable(error) => {
            println!("{error}");
            Step::Retry
        }
        Outcome::Fatal {
            error,
            redirect_after,
        } => {
            tracing::debug!(?error, ?redirect_after, "Login has to start over");
            println!("{error}");
            tokio::time::sleep(redirect_after).await;
            Step::Restart
        }
    }
}

fn report<T>(outcome: Outcome<T>) -> Option<T> {
    match outcome {
        Outcome::Success(value) => Some(value),
        Outcome::Recoverable(error) | Outcome::Fatal { error, .. } => {
            tracing::debug!(?error, "Command failed");
            println!("{error}");
            None
        }
    }
}

fn print_accounts(views: &[AccountView]) {
    if views.is_empty() {
        println!("You don't have any linked accounts yet.");
        return;
    }
    for view in views {
        print_account(view);
    }
}

fn print_account(view: &AccountView) {
    let next = match view.affordance {
        Affordance::Verified => "verified".to_string(),
        Affordance::Verify => "not verified".to_string(),
        Affordance::Check => "waiting for the code".to_string(),
        Affordance::Retry { attempts_left } => {
            format!("code not found yet, {attempts_left} checks left")
        }
        Affordance::Wait { remaining } => format!(
            "next check in {}s",
            crate::error::whole_seconds(remaining)
        ),
        Affordance::MustReset => "out of checks, reset to get a new code".to_string(),
    };
    println!("{:<12} {:<24} {next}", view.account.id, view.account.handle.to_string());
}

fn print_instructions(view: &AccountView) {
    if let Some(challenge) = &view.challenge {
        println!(
            "Add the code {} to the bio of {}. It's checked in the background,",
            challenge.code, view.account.handle
        );
        println!(
            "or use \"vouch accounts check {}\" to check right away.",
            view.account.id
        );
    }
}

fn display_name(account_id: &str, handle: Option<&vouch_core::handle::Handle>) -> String {
    handle.map_or_else(|| account_id.to_string(), ToString::to_string)
}
