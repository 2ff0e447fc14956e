use std::fmt;
use std::time::Duration;

use intake_core::model::{AssessmentId, FormData, ProgressStage};
use serde_json::json;
use services::{AppServices, Clock, ProgressSubscription, SaveOptions, WorkflowConfig};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidStorageKey { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidStorageKey { raw } => write!(f, "invalid --key value: {raw:?}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  intake [status|start|resume|clear|demo] [--db <sqlite_url>] [--key <name>] [--anonymous]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status   report whether a stored session can be resumed (default)");
    eprintln!("  start    begin a new intake session, replacing any stored one");
    eprintln!("  resume   load the stored session and print its summary");
    eprintln!("  clear    delete the stored session");
    eprintln!("  demo     walk a new session through a simulated submission");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db sqlite:intake.sqlite3");
    eprintln!("  --key {}", services::config::DEFAULT_STORAGE_KEY);
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  INTAKE_DB_URL, INTAKE_STORAGE_KEY, INTAKE_ANONYMOUS, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Status,
    Start,
    Resume,
    Clear,
    Demo,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "status" => Some(Self::Status),
            "start" => Some(Self::Start),
            "resume" => Some(Self::Resume),
            "clear" => Some(Self::Clear),
            "demo" => Some(Self::Demo),
            _ => None,
        }
    }
}

struct Args {
    db_url: String,
    storage_key: String,
    anonymous: bool,
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("INTAKE_DB_URL")
            .ok()
            .map_or_else(|| normalize_sqlite_url("intake.sqlite3".into()), normalize_sqlite_url);
        let mut storage_key = std::env::var("INTAKE_STORAGE_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| services::config::DEFAULT_STORAGE_KEY.to_string());
        let mut anonymous = std::env::var("INTAKE_ANONYMOUS")
            .ok()
            .is_some_and(|value| parse_flag(&value));

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--key" => {
                    let value = require_value(args, "--key")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidStorageKey { raw: value });
                    }
                    storage_key = value;
                }
                "--anonymous" => anonymous = true,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            storage_key,
            anonymous,
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv: Vec<String> = std::env::args().skip(1).collect();

    let cmd = match argv.first().map(String::as_str) {
        None => Command::Status,
        Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(first) if first.starts_with("--") => Command::Status,
        Some(first) => Command::from_arg(first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };

    if !argv.is_empty() && !argv[0].starts_with("--") {
        argv.remove(0);
    }

    let mut iter = argv.into_iter();
    let parsed = Args::parse(&mut iter).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    prepare_sqlite_file(&parsed.db_url)?;
    let config = WorkflowConfig::default().with_storage_key(parsed.storage_key.clone());
    let services = AppServices::new_sqlite(&parsed.db_url, Clock::system(), config).await?;
    info!(db = %parsed.db_url, key = %parsed.storage_key, ?cmd, "intake storage ready");

    let store = services.session_store();
    match cmd {
        Command::Status => match store.stored_summary().await {
            Some(summary) => print_summary(&summary),
            None => println!("no resumable session"),
        },
        Command::Start => {
            let state = store.start_session(parsed.anonymous).await;
            store.flush().await?;
            println!("started session {}", state.session_id);
        }
        Command::Resume => match store.resume_session().await {
            Some(state) => print_summary(&state.summary()),
            None => println!("no resumable session"),
        },
        Command::Clear => {
            store.clear_state().await;
            println!("stored session cleared");
        }
        Command::Demo => run_demo(&services, parsed.anonymous).await?,
    }
    Ok(())
}

fn print_summary(summary: &intake_core::model::WorkflowSummary) {
    println!("session      {}", summary.session_id);
    println!("step         {}", summary.current_step);
    println!("saves        {}", summary.saved_count);
    println!(
        "errors       {} ({} recoverable)",
        summary.error_count, summary.recoverable_error_count
    );
    println!("progress     {}", if summary.has_progress { "yes" } else { "no" });
    println!("anonymous    {}", summary.is_anonymous);
    println!("last update  {}", summary.last_updated_at.to_rfc3339());
}

/// Pause between simulated pipeline steps; longer than the subscription
/// debounce so every frame is printed.
const DEMO_STEP: Duration = Duration::from_millis(150);

async fn run_demo(services: &AppServices, anonymous: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = services.session_store();
    let tracker = services.progress_tracker();

    let state = store.start_session(anonymous).await;
    println!("started session {}", state.session_id);

    let answers: FormData = [
        ("parentFirstName", json!("Demo")),
        ("childFirstName", json!("Sam")),
        ("email", json!("demo@example.com")),
        ("concerns", json!(["focus", "sleep"])),
    ]
    .into_iter()
    .collect();
    store.update_form_data(4, answers, SaveOptions::debounced()).await;
    store.flush().await?;

    let id = AssessmentId::new(format!("demo-{}", state.session_id));
    let subscription = ProgressSubscription::new(id.clone())
        .on_progress(|p| println!("{:>5.1}%  {}  {}", p.progress, p.stage, p.current_step))
        .on_error(|failure| eprintln!("submission failed: {}", failure.message))
        .on_complete(|notice| println!("report ready at {}", notice.completed_at.to_rfc3339()));
    let subscription_id = tracker.subscribe(subscription);

    store.update_progress(tracker.start_progress(id.clone())).await;
    for (stage, percent) in [
        (ProgressStage::SavingResponses, 20.0),
        (ProgressStage::CompletingAssessment, 40.0),
        (ProgressStage::GeneratingReport, 60.0),
    ] {
        tokio::time::sleep(DEMO_STEP).await;
        tracker.update_progress(&id, stage, percent, stage.default_label(), None)?;
        if let Some(snapshot) = tracker.get_progress(&id) {
            store.update_progress(snapshot).await;
        }
    }
    for inner in [25.0, 50.0, 75.0, 100.0] {
        tokio::time::sleep(DEMO_STEP).await;
        tracker.update_report_progress(&id, inner)?;
    }
    tokio::time::sleep(DEMO_STEP).await;
    tracker.update_progress(
        &id,
        ProgressStage::Finalizing,
        95.0,
        ProgressStage::Finalizing.default_label(),
        None,
    )?;

    tracker.complete_progress(&id, json!({ "sessionId": state.session_id.to_string() }));
    if let Some(snapshot) = tracker.get_progress(&id) {
        store.update_progress(snapshot).await;
    }
    store.complete_workflow().await;
    tracker.unsubscribe(subscription_id);

    if let Some(summary) = store.summary() {
        print_summary(&summary);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
