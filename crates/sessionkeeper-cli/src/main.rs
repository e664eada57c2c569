//! sessionkeeper - operator CLI for the console session lifecycle.
//!
//! Drives `sessionkeeper-core` against real storage and a real refresh
//! endpoint: sign in from a credential file, inspect or refresh the persisted
//! session, migrate old envelopes, and watch expiry events live.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionkeeper_core::config::APP_NAME;
use sessionkeeper_core::{
    ChaChaCipher, Credential, CredentialRefresher, CredentialValidator, CredentialVault,
    FileStorage, HttpRefreshTransport, KeyringStorage, SessionConfig, SessionEvent,
    SessionEventBus, SessionEventKind, SessionManager, StorageMedium, SystemClock,
};

const KEY_ENV: &str = "SESSIONKEEPER_VAULT_KEY";
const PASSPHRASE_ENV: &str = "SESSIONKEEPER_VAULT_PASSPHRASE";

const USAGE: &str = "\
Usage: sessionkeeper [--store file|keyring] [--log-dir DIR] <command>

Commands:
  login <file|->   Sign in with a credential JSON document
  status           Show the persisted session
  refresh          Exchange the refresh token for a new credential
  logout           End the session and clear stored credentials
  migrate          Rewrite legacy envelopes at the current version
  watch            Print session events until the session ends or Ctrl-C";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreKind {
    File,
    Keyring,
}

#[derive(Debug)]
enum Command {
    Login(String),
    Status,
    Refresh,
    Logout,
    Migrate,
    Watch,
}

#[derive(Debug)]
struct Options {
    store: StoreKind,
    log_dir: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut store = StoreKind::File;
    let mut log_dir = None;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--store" => {
                store = match iter.next().map(String::as_str) {
                    Some("file") => StoreKind::File,
                    Some("keyring") => StoreKind::Keyring,
                    other => bail!("--store expects 'file' or 'keyring', got {:?}", other),
                }
            }
            "--log-dir" => {
                let dir = iter.next().context("--log-dir expects a directory")?;
                log_dir = Some(PathBuf::from(dir));
            }
            _ => rest.push(arg.as_str()),
        }
    }

    let command = match rest.as_slice() {
        ["login", source] => Command::Login(source.to_string()),
        ["status"] => Command::Status,
        ["refresh"] => Command::Refresh,
        ["logout"] => Command::Logout,
        ["migrate"] => Command::Migrate,
        ["watch"] => Command::Watch,
        _ => bail!("{}", USAGE),
    };

    Ok(Options {
        store,
        log_dir,
        command,
    })
}

/// Initialize the tracing subscriber. Stderr always; a daily log file too when
/// `log_dir` is given. The returned guard must live until exit.
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // RUST_LOG controls the level (e.g. RUST_LOG=sessionkeeper_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", APP_NAME));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
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

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = parse_args(&args)?;
    let _log_guard = init_tracing(options.log_dir.as_ref());

    let config = SessionConfig::load()?;
    info!(store = ?options.store, "sessionkeeper starting");

    let manager = build_manager(&config, options.store)?;

    match options.command {
        Command::Login(source) => login(&manager, &source),
        Command::Status => status(&manager).await,
        Command::Refresh => refresh(&manager).await,
        Command::Logout => logout(&manager).await,
        Command::Migrate => migrate(&manager, &config),
        Command::Watch => watch(&manager).await,
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn build_manager(config: &SessionConfig, store: StoreKind) -> Result<SessionManager> {
    let medium: Arc<dyn StorageMedium> = match store {
        StoreKind::File => Arc::new(FileStorage::new(config.storage_dir()?)?),
        StoreKind::Keyring => Arc::new(KeyringStorage::new(config.keyring_service.clone())),
    };
    let cipher = Arc::new(load_cipher(config)?);
    let vault = CredentialVault::new(config, medium, cipher);

    let transport = HttpRefreshTransport::new(config).context("Failed to build HTTP client")?;
    let refresher = CredentialRefresher::new(config, Arc::new(transport));

    let manager = SessionManager::new(
        config.clone(),
        vault,
        refresher,
        CredentialValidator::default(),
        SessionEventBus::new(),
        Arc::new(SystemClock),
    )?;
    Ok(manager)
}

/// Vault key from the environment, falling back to an interactive passphrase.
fn load_cipher(config: &SessionConfig) -> Result<ChaChaCipher> {
    if let Ok(key) = std::env::var(KEY_ENV) {
        return ChaChaCipher::from_base64_key(key.trim())
            .with_context(|| format!("{} is not a valid base64 32-byte key", KEY_ENV));
    }

    let passphrase = match std::env::var(PASSPHRASE_ENV) {
        Ok(passphrase) => passphrase,
        Err(_) => rpassword::prompt_password("Vault passphrase: ")
            .context("Failed to read vault passphrase")?,
    };
    if passphrase.is_empty() {
        bail!("Vault passphrase must not be empty");
    }
    ChaChaCipher::from_passphrase(&passphrase, config.key_salt.as_bytes())
        .context("Failed to derive vault key")
}

// ============================================================================
// Commands
// ============================================================================

fn login(manager: &SessionManager, source: &str) -> Result<()> {
    let raw = if source == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read credential from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read credential file {}", source))?
    };
    let credential: Credential =
        serde_json::from_str(&raw).context("Credential is not valid JSON")?;

    let generation = manager.login(credential)?;
    println!("Signed in (session {})", generation);
    print_claims(manager);
    Ok(())
}

async fn status(manager: &SessionManager) -> Result<()> {
    if !manager.bootstrap().await {
        println!("No active session");
        return Ok(());
    }
    println!(
        "Session {} (vault {})",
        manager.live_generation().unwrap_or_default(),
        manager.vault().version()
    );
    print_claims(manager);
    Ok(())
}

async fn refresh(manager: &SessionManager) -> Result<()> {
    if !manager.bootstrap().await {
        bail!("No active session; sign in first");
    }
    manager.refresh().await?;
    println!("Credential refreshed");
    print_claims(manager);
    Ok(())
}

async fn logout(manager: &SessionManager) -> Result<()> {
    manager.bootstrap().await;
    if !manager.logout() {
        // Nothing live; still make sure no envelope lingers.
        manager.vault().clear();
    }
    println!("Signed out");
    Ok(())
}

fn migrate(manager: &SessionManager, config: &SessionConfig) -> Result<()> {
    let current = manager.vault().version();
    for legacy in &config.legacy_versions {
        let migrated = manager
            .vault()
            .migrate(legacy, current)
            .with_context(|| format!("Failed to migrate {} envelope", legacy))?;
        if migrated {
            println!("Migrated {} -> {}", legacy, current);
        } else {
            println!("Nothing to migrate from {}", legacy);
        }
    }
    Ok(())
}

async fn watch(manager: &SessionManager) -> Result<()> {
    if !manager.bootstrap().await {
        bail!("No active session; sign in first");
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
    let mut subscriptions = Vec::new();
    for kind in [
        SessionEventKind::SessionRefreshed,
        SessionEventKind::ExpiryWarning,
        SessionEventKind::SessionExpired,
        SessionEventKind::SessionEnded,
    ] {
        let tx = tx.clone();
        subscriptions.push(manager.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
        }));
    }
    drop(tx);

    print_claims(manager);
    println!("Watching session events (Ctrl-C to stop)");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if matches!(
                    event.kind(),
                    SessionEventKind::SessionExpired | SessionEventKind::SessionEnded
                ) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopped");
                break;
            }
        }
    }

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    Ok(())
}

fn print_claims(manager: &SessionManager) {
    let Some(claims) = manager.claims() else {
        return;
    };
    let or_dash = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

    println!("  subject:     {}", or_dash(&claims.subject));
    println!("  issuer:      {}", or_dash(&claims.issuer));
    println!("  role:        {}", or_dash(&claims.role));
    if !claims.permissions.is_empty() {
        let permissions: Vec<&str> = claims.permissions.iter().map(String::as_str).collect();
        println!("  permissions: {}", permissions.join(", "));
    }
    if claims.mfa_required {
        println!("  mfa:         required");
    }
    if let Some(expires) = claims
        .expiry_epoch_seconds
        .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0))
    {
        let remaining = manager.seconds_until_expiry().unwrap_or_default();
        println!(
            "  expires:     {} ({}s)",
            expires.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            remaining
        );
    }
}
