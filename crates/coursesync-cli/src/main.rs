//! coursesync - keeps a local copy of course, pricing and internship data
//! in sync with the content server, and keeps working offline.

use std::io;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coursesync_core::{
    CollectionName, Config, FallbackTier, LoadOutcome, PlatformSignal, Record, SessionStatus,
    Snapshot, SyncEvent, SyncSession,
};

/// Directory for daily log files, in addition to stderr
const LOG_DIR_ENV: &str = "COURSESYNC_LOG_DIR";

const USAGE: &str = "\
Usage: coursesync [COMMAND]

Commands:
  (none), --watch             Sync in the background and print updates until Ctrl-C;
                              SIGUSR1 forces a resync, as after waking from sleep
  --show [collection]         Print the current collections
  --dump                      Print the current collections as JSON
  --status                    Print sync status
  --force-sync                Reload from the server, treating it as newer
  --put <collection> <file>   Replace a collection with the records in a JSON file
  --clear-cache               Drop every cached copy of the data and reload
  --help                      Show this message

Collections: courses, pricing, internships";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // RUST_LOG controls the level (e.g., RUST_LOG=coursesync_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "coursesync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("--watch");
    if command == "--help" || command == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    info!(server = %config.server_url, "coursesync starting");
    let session = SyncSession::start(&config).await?;

    let result = match command {
        "--watch" => watch(&session).await,
        "--show" => show(&session.current(), args.get(1).map(String::as_str)),
        "--dump" => dump(&session.current()),
        "--status" => {
            print_status(&session.status().await);
            Ok(())
        }
        "--force-sync" => {
            let outcome = session.force_sync().await;
            println!("{}", describe(outcome));
            Ok(())
        }
        "--put" => match (args.get(1), args.get(2)) {
            (Some(name), Some(file)) => put(&session, name, Path::new(file)).await,
            _ => bail!("--put needs a collection and a file\n\n{}", USAGE),
        },
        "--clear-cache" => {
            let outcome = session.clear_all_cache().await;
            println!("Cache cleared. {}", describe(outcome));
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    };

    session.shutdown();
    result
}

/// SIGUSR1, delivered when the user comes back to the client.
#[cfg(unix)]
struct VisibilitySignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl VisibilitySignal {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        let usr1 = signal(SignalKind::user_defined1()).context("Failed to listen for SIGUSR1")?;
        Ok(Self(usr1))
    }

    async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

#[cfg(not(unix))]
struct VisibilitySignal;

#[cfg(not(unix))]
impl VisibilitySignal {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}

async fn watch(session: &SyncSession) -> Result<()> {
    print_status(&session.status().await);
    let mut events = session.subscribe();
    let mut visibility = VisibilitySignal::new()?;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            Some(()) = visibility.recv() => {
                info!("Visibility regained, resyncing");
                session.signal(PlatformSignal::VisibilityRegained);
            }
            event = events.recv() => match event {
                Ok(SyncEvent::DataUpdated { source, snapshot }) => {
                    println!("{:?} update: {}", source, summary(&snapshot));
                }
                Ok(SyncEvent::ForceSyncFinished { success }) => {
                    println!("Force sync {}", if success { "succeeded" } else { "failed, using local data" });
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed sync events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn show(snapshot: &Snapshot, only: Option<&str>) -> Result<()> {
    let names = match only {
        Some(name) => vec![name.parse::<CollectionName>()?],
        None => CollectionName::ALL.to_vec(),
    };
    for name in names {
        let records = snapshot.get(name);
        println!("{} ({})", name, records.len());
        for record in records {
            println!("  {:>4}  {}", record.id, record.label());
        }
    }
    Ok(())
}

fn dump(snapshot: &Snapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&snapshot.collections)?);
    Ok(())
}

async fn put(session: &SyncSession, name: &str, file: &Path) -> Result<()> {
    let name: CollectionName = name.parse()?;
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let records: Vec<Record> = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a JSON array of records", file.display()))?;

    let outcome = session.propagate(name, records).await?;
    println!(
        "Wrote {} at {}: stored locally: {}, acknowledged by server: {}",
        name,
        outcome.timestamp,
        if outcome.persisted { "yes" } else { "no" },
        if outcome.server_acknowledged { "yes" } else { "no" },
    );
    Ok(())
}

fn summary(snapshot: &Snapshot) -> String {
    format!(
        "{} courses, {} pricing plans, {} internships",
        snapshot.collections.courses.len(),
        snapshot.collections.pricing.len(),
        snapshot.collections.internships.len()
    )
}

fn describe(outcome: LoadOutcome) -> String {
    match outcome {
        LoadOutcome::Updated => "Loaded new data from the server.".to_string(),
        LoadOutcome::Unchanged => "Server data unchanged.".to_string(),
        LoadOutcome::KeptLocal => "Local data is newer than the server's; kept it.".to_string(),
        LoadOutcome::Fallback(FallbackTier::OfflineCache) => {
            "Server unreachable, using the offline cache's last copy.".to_string()
        }
        LoadOutcome::Fallback(tier) => format!("Server unreachable, using {:?} data.", tier),
    }
}

fn print_status(status: &SessionStatus) {
    let synced = status
        .last_sync_time
        .to_datetime()
        .filter(|_| !status.last_sync_time.is_epoch())
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    println!("Context:        {}", status.context);
    println!("State:          {:?}", status.state);
    println!("Initial load:   {}", describe(status.initial_load));
    println!("Last sync:      {}", synced);
    println!(
        "Stored copy:    {}",
        status.stored_age.as_deref().unwrap_or("none")
    );
    println!("Records:        {}", status.total_records);
    match status.offline_worker {
        Some(state) => println!("Offline cache:  {:?}", state),
        None => println!("Offline cache:  off"),
    }
}
