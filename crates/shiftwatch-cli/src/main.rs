use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shiftwatch_core::Recipient;
use shiftwatch_notify::{
    operator_alert, DispatchReport, Dispatcher, LogOnlyAlert, NotificationSink, RecordingSink,
    TransportConfig, Transports,
};
use shiftwatch_storage::{HttpClient, HttpClientConfig};
use shiftwatch_sync::{maybe_build_scheduler, Checker, CheckerConfig, CycleError};
use shiftwatch_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shiftwatch")]
#[command(about = "Watches a shift listing page and notifies recipients about new openings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single check cycle.
    Check,
    /// Run checks on the cron schedule alongside the web console.
    Run {
        #[arg(long)]
        no_web: bool,
    },
    /// Serve the web console without scheduled checks.
    Serve,
    /// Forget the most recently seen jobs so they are reported again.
    RemoveRecent { count: usize },
    /// Resend the changes between the stored snapshot and the live page.
    Resend {
        /// Send every current job instead of only the differences.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Send two fixed test jobs to every recipient.
    TestNotify {
        #[arg(long)]
        dry_run: bool,
    },
    #[command(subcommand)]
    Recipients(RecipientCommand),
}

#[derive(Debug, Subcommand)]
enum RecipientCommand {
    List,
    Add(RecipientArgs),
    Remove { email: String },
}

#[derive(Debug, Args)]
struct RecipientArgs {
    email: String,
    #[arg(long)]
    telegram_id: Option<String>,
    /// Minutes to wait before notifying this recipient.
    #[arg(long, default_value_t = 0)]
    delay: u64,
    #[arg(long)]
    telegram: bool,
    #[arg(long)]
    no_email: bool,
    #[arg(long)]
    no_new: bool,
    #[arg(long)]
    no_reopened: bool,
    #[arg(long)]
    no_spotfreed: bool,
    #[arg(long)]
    no_links: bool,
}

impl RecipientArgs {
    fn into_recipient(self) -> Recipient {
        let mut recipient = Recipient::new(self.email);
        recipient.telegram_id = self.telegram_id.unwrap_or_default();
        recipient.delay = self.delay;
        recipient.use_telegram = self.telegram;
        recipient.use_email = !self.no_email;
        recipient.notify_new = !self.no_new;
        recipient.notify_reopened = !self.no_reopened;
        recipient.notify_spotfreed = !self.no_spotfreed;
        recipient.receive_job_links = !self.no_links;
        recipient
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shiftwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// A checker wired to real transports, or to an in-memory sink when `dry_run` is set.
fn build_checker(config: &CheckerConfig, dry_run: bool) -> Result<(Checker, Option<Arc<RecordingSink>>)> {
    if dry_run {
        let sink = Arc::new(RecordingSink::new());
        let checker = Checker::new(
            config.store(),
            Arc::new(config.registry()),
            config.cycle_lock(),
            config.build_source()?,
            Dispatcher::new(sink.clone()).skip_delays(),
            Arc::new(LogOnlyAlert),
        );
        return Ok((checker, Some(sink)));
    }

    let transport_config = TransportConfig::from_env();
    let http = HttpClient::new(HttpClientConfig::default()).context("building notification http client")?;
    let transports = Transports::from_config(&transport_config, http).context("configuring transports")?;
    let sink: Arc<dyn NotificationSink> = Arc::new(transports);
    let alert = operator_alert(&transport_config, Arc::clone(&sink));
    Ok((Checker::from_config(config, sink, alert)?, None))
}

fn print_dispatch(report: &DispatchReport) {
    println!(
        "notified={} skipped={} failures={}",
        report.notified.len(),
        report.skipped.len(),
        report.failures.len()
    );
    for failure in &report.failures {
        println!("  {} via {}: {}", failure.recipient, failure.channel, failure.error);
    }
}

fn print_recorded(sink: Option<&Arc<RecordingSink>>) {
    let Some(sink) = sink else { return };
    for message in sink.sent() {
        println!("--- {} to {}", message.channel, message.destination);
        if let Some(subject) = &message.subject {
            println!("Subject: {subject}");
        }
        println!("{}\n", message.body);
    }
}

async fn run_daemon(mut config: CheckerConfig, no_web: bool) -> Result<()> {
    config.scheduler_enabled = true;
    let (checker, _) = build_checker(&config, false)?;
    let checker = Arc::new(checker);

    let mut scheduler = maybe_build_scheduler(Arc::clone(&checker), &config)
        .await?
        .context("scheduler disabled")?;
    scheduler.start().await.context("starting scheduler")?;

    let startup = Arc::clone(&checker);
    tokio::spawn(async move {
        match startup.run().await {
            Ok(outcome) => info!(run_id = %outcome.run_id, "startup check finished"),
            Err(CycleError::AlreadyRunning) => info!("startup check skipped; cycle already running"),
            Err(err) => warn!(error = %err, "startup check failed"),
        }
    });

    if no_web {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    } else {
        let state = AppState::new(checker, config);
        tokio::select! {
            served = shiftwatch_web::serve(state, shiftwatch_web::port_from_env()) => served?,
            signal = tokio::signal::ctrl_c() => signal.context("waiting for ctrl-c")?,
        }
    }

    info!("shutting down");
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = CheckerConfig::from_env();

    match cli.command.unwrap_or(Commands::Check) {
        Commands::Check => {
            let (checker, _) = build_checker(&config, false)?;
            let outcome = checker.run().await?;
            let r = outcome.report;
            println!(
                "check complete: run_id={} new={} reopened={} spotfreed={} suppressed={} unchanged={}",
                outcome.run_id, r.new, r.reopened, r.spotfreed, r.suppressed, r.unchanged
            );
            if let Some(report) = &outcome.dispatch {
                print_dispatch(report);
            }
        }
        Commands::Run { no_web } => run_daemon(config, no_web).await?,
        Commands::Serve => {
            let (checker, _) = build_checker(&config, false)?;
            let state = AppState::new(Arc::new(checker), config);
            shiftwatch_web::serve(state, shiftwatch_web::port_from_env()).await?;
        }
        Commands::RemoveRecent { count } => {
            let (checker, _) = build_checker(&config, false)?;
            let report = checker.remove_recent_jobs(count).await?;
            println!(
                "removed {} jobs and {} ledger entries",
                report.removed_keys.len(),
                report.ledger_entries_removed
            );
            for key in &report.removed_keys {
                println!("  {}", key.as_str().replace('\n', " | "));
            }
            for backup in &report.backups {
                println!("backup: {}", backup.display());
            }
        }
        Commands::Resend { all, dry_run } => {
            let (checker, sink) = build_checker(&config, dry_run)?;
            match checker.resend_last_update(all).await? {
                Some(report) => print_dispatch(&report),
                None => println!("no changes to resend"),
            }
            print_recorded(sink.as_ref());
        }
        Commands::TestNotify { dry_run } => {
            let (checker, sink) = build_checker(&config, dry_run)?;
            print_dispatch(&checker.test_notification().await?);
            print_recorded(sink.as_ref());
        }
        Commands::Recipients(command) => {
            let registry = config.registry();
            match command {
                RecipientCommand::List => {
                    for r in registry.list().await? {
                        println!(
                            "{} email={} telegram={} delay={}m",
                            r.email, r.use_email, r.use_telegram, r.delay
                        );
                    }
                }
                RecipientCommand::Add(args) => {
                    let recipient = args.into_recipient();
                    let email = recipient.email.clone();
                    registry.add(recipient).await?;
                    println!("added {email}");
                }
                RecipientCommand::Remove { email } => {
                    registry.remove(&email).await?;
                    println!("removed {email}");
                }
            }
        }
    }

    Ok(())
}
