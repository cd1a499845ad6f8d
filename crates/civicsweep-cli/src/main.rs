//! CivicSweep CLI - drive the offline sync engine from a terminal.
//!
//! Each invocation opens the engine over the on-disk store, runs one
//! command, and exits. Queued actions, remembered accounts and cached
//! results persist between runs, so the CLI can be used to exercise the
//! whole offline workflow: queue while offline, then flush once back.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use civicsweep_core::auth::token;
use civicsweep_core::cache::age_display;
use civicsweep_core::{
    Config, DataSource, FlushOutcome, QueueAction, QueueKind, Role, Submitted, SyncEngine,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Overrides `api_base_url` from the config file
const ENV_API_URL: &str = "CIVICSWEEP_API_URL";

/// Overrides the data directory
const ENV_DATA_DIR: &str = "CIVICSWEEP_DATA_DIR";

/// Password for non-interactive login
const ENV_PASSWORD: &str = "CIVICSWEEP_PASSWORD";

/// Log file name prefix inside `<data_dir>/logs`
const LOG_FILE_PREFIX: &str = "civicsweep.log";

const USAGE: &str = "\
Usage: civicsweep [--offline] <command> [args]

Commands:
  status                       Show session, queue and sync status
  login [<role> <login-id>]    Sign in (defaults to the last identity; falls back
                               to a saved account when unreachable)
  login-offline [account-key]  Continue as a saved account without the network
  logout                       Sign out (saved accounts are kept)
  accounts                     List saved accounts
  forget <account-key>         Remove a saved account
  enqueue <kind> <json>        Queue an action for later replay
  submit <kind> <json>         Send an action now, or queue it if unreachable
  flush                        Replay queued actions now
  queue                        List queued actions
  discard <id>                 Drop a queued action without sending it
  get <path> [cache-key]       GET a resource, cached under cache-key

Kinds: report.create, vendor.complete, admin.assign, admin.status
Roles: user, vendor, admin

Environment:
  CIVICSWEEP_API_URL, CIVICSWEEP_DATA_DIR, CIVICSWEEP_PASSWORD, RUST_LOG";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr (filtered by `RUST_LOG`, default `warn`) and to a daily
/// rolling file under `log_dir`. The returned guard flushes the file writer
/// on drop.
fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file = match std::fs::create_dir_all(log_dir) {
        Ok(()) => Some(tracing_appender::non_blocking(tracing_appender::rolling::daily(
            log_dir,
            LOG_FILE_PREFIX,
        ))),
        Err(e) => {
            eprintln!("Warning: file logging disabled ({}): {}", log_dir.display(), e);
            None
        }
    };

    let (file_layer, guard) = match file {
        Some((writer, guard)) => (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn load_config() -> Config {
    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config, using defaults: {}", e);
            Config::default()
        }
    };
    if let Ok(url) = std::env::var(ENV_API_URL) {
        if !url.trim().is_empty() {
            config.api_base_url = url.trim().to_string();
        }
    }
    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        if !dir.trim().is_empty() {
            config.data_dir = Some(PathBuf::from(dir.trim()));
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let offline = take_flag(&mut args, "--offline");
    if args.is_empty() || matches!(args[0].as_str(), "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = load_config();
    let data_dir = config.data_dir()?;
    let _log_guard = init_tracing(&data_dir.join("logs"));
    info!(command = %args[0], offline, "CivicSweep CLI starting");

    let engine = SyncEngine::open(config, !offline).context("Failed to open sync engine")?;
    engine.restore_session();

    let result = run(&engine, &args).await;
    engine.shutdown();
    result
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing argument: <{}>\n\n{}", name, USAGE))
}

async fn run(engine: &SyncEngine, args: &[String]) -> Result<()> {
    match args[0].as_str() {
        "status" => print_status(engine),
        "login" => {
            let (role, login_id) = match engine.config().last_identity() {
                Some(last) if args.len() == 1 => last,
                _ => {
                    let role: Role = arg(args, 1, "role")?.parse().map_err(anyhow::Error::msg)?;
                    (role, arg(args, 2, "login-id")?.to_string())
                }
            };
            login(engine, role, &login_id).await
        }
        "login-offline" => {
            let session = engine.login_offline(args.get(1).map(String::as_str))?;
            println!("Signed in offline as {} ({})", display_name(&session.name, &session.id), session.role);
            Ok(())
        }
        "logout" => {
            engine.logout()?;
            println!("Signed out");
            Ok(())
        }
        "accounts" => {
            print_accounts(engine);
            Ok(())
        }
        "forget" => {
            let key = arg(args, 1, "account-key")?;
            if engine.vault().forget(key)? {
                println!("Forgot {}", key.trim().to_lowercase());
                Ok(())
            } else {
                bail!("No saved account {}", key)
            }
        }
        "enqueue" => {
            let action = parse_action(arg(args, 1, "kind")?, arg(args, 2, "json")?)?;
            let item = engine.queue().enqueue(action)?;
            println!("Queued {} ({})", item.id, item.kind());
            Ok(())
        }
        "submit" => {
            let action = parse_action(arg(args, 1, "kind")?, arg(args, 2, "json")?)?;
            match engine.submit(action).await? {
                Submitted::Sent(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                Submitted::Queued(item) => println!("Queued {} ({}) for replay", item.id, item.kind()),
            }
            Ok(())
        }
        "flush" => {
            print_flush(engine.flush(true).await);
            Ok(())
        }
        "queue" => {
            print_queue(engine);
            Ok(())
        }
        "discard" => {
            let id = arg(args, 1, "id")?;
            if engine.queue().discard(id)? {
                println!("Discarded {}", id);
                Ok(())
            } else {
                bail!("No queued action with id {}", id)
            }
        }
        "get" => {
            let path = arg(args, 1, "path")?;
            let fetched = engine.fetch(path, args.get(2).map(String::as_str)).await?;
            if fetched.source == DataSource::Cache {
                let stored = fetched
                    .cached_at
                    .map(|at| age_display(Utc::now() - at))
                    .unwrap_or_else(|| "at an unknown time".to_string());
                eprintln!("(cached, stored {})", stored);
            }
            println!("{}", serde_json::to_string_pretty(&fetched.data)?);
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

async fn login(engine: &SyncEngine, role: Role, login_id: &str) -> Result<()> {
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(p) if !p.is_empty() => p,
        _ => rpassword::prompt_password("Password: ")?,
    };

    let session = engine.login(role, login_id, &password).await?;
    println!("Signed in as {} ({})", display_name(&session.name, &session.id), session.role);

    // Start from the file copy so environment overrides are not persisted
    let mut config = Config::load().unwrap_or_default();
    config.remember_identity(role, login_id);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
    Ok(())
}

fn parse_action(kind: &str, payload: &str) -> Result<QueueAction> {
    let kind: QueueKind = kind.parse()?;
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    Ok(QueueAction::from_parts(kind, payload)?)
}

fn display_name<'a>(name: &'a str, id: &'a str) -> &'a str {
    if name.is_empty() {
        id
    } else {
        name
    }
}

fn print_status(engine: &SyncEngine) -> Result<()> {
    let status = engine.status();
    let session = engine.vault().current().map(|active| {
        let expires_at = token::decode_claims(&active.token)
            .and_then(|claims| claims.expires_at())
            .map(|at| at.to_rfc3339());
        json!({
            "role": active.session.role,
            "id": active.session.id,
            "name": active.session.name,
            "expiresAt": expires_at,
        })
    });
    let last_synced = status.last_sync.map(|at| age_display(Utc::now() - at));
    let report = json!({
        "apiBaseUrl": engine.config().api_base_url,
        "lastSynced": last_synced,
        "session": session,
        "accounts": engine.vault().accounts().len(),
        "cachedResults": engine.cache().len(),
        "queue": status,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_accounts(engine: &SyncEngine) {
    let accounts = engine.vault().accounts();
    if accounts.is_empty() {
        println!("No saved accounts");
        return;
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for account in accounts {
        let usable = !token::is_expired(&account.token, engine.config().offline_skew(), Utc::now());
        let _ = writeln!(
            out,
            "{:<40} {:<20} last login {}{}",
            account.key,
            display_name(&account.name, &account.session.id),
            account.last_login_at.format("%Y-%m-%d %H:%M"),
            if usable { "" } else { "  (expired)" }
        );
    }
}

fn print_queue(engine: &SyncEngine) {
    let items = engine.queue().items();
    if items.is_empty() {
        println!("Queue is empty");
        return;
    }
    for item in items {
        let state = match item.error {
            Some(ref error) => format!("BLOCKED: {}", error),
            None => "pending".to_string(),
        };
        println!(
            "{}  {:<16} {}  {}",
            item.id,
            item.kind().as_str(),
            item.created_at.format("%Y-%m-%d %H:%M:%S"),
            state
        );
    }
}

fn print_flush(outcome: FlushOutcome) {
    match outcome {
        FlushOutcome::Busy => println!("A flush is already running"),
        FlushOutcome::Offline => println!("Offline; nothing sent"),
        FlushOutcome::Empty => println!("Queue is empty"),
        FlushOutcome::Drained { sent } => println!("Sent {} queued action(s)", sent),
        FlushOutcome::Deferred { sent, error } => {
            println!("Sent {}; service unreachable ({}), will retry", sent, error)
        }
        FlushOutcome::Blocked { sent, id, error } => {
            println!("Sent {}; {} was rejected: {}", sent, id, error);
            println!("Fix the cause or run `civicsweep discard {}`", id);
        }
    }
}
