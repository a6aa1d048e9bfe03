use std::{path::Path, process, sync::Arc};

use syncstate::{
    cache::{KeyPattern, Priority, Tier, inspect_record},
    config::{self, Command, PurgeArgs, Settings},
    infra::{
        error::InfraError,
        storage::{PersistentMedium, SqliteMedium},
        telemetry,
    },
    util::format::{format_age, format_size},
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("no storage path configured; pass --storage-path or set storage.path")]
    NoStorage,
}

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command.unwrap_or(Command::Inspect) {
        Command::Inspect => run_inspect(&settings),
        Command::Purge(args) => run_purge(&settings, &args),
        Command::Config => {
            print_settings(&settings);
            Ok(())
        }
    }
}

fn open_medium(settings: &Settings) -> Result<Arc<dyn PersistentMedium>, AppError> {
    let path = settings.storage.path.as_deref().ok_or(AppError::NoStorage)?;
    let medium = SqliteMedium::open(path).map_err(InfraError::from)?;
    info!(path = %path.display(), "Opened persistent medium");
    Ok(Arc::new(medium))
}

fn run_inspect(settings: &Settings) -> Result<(), AppError> {
    let medium = open_medium(settings)?;
    let mut records = medium.load_all().map_err(InfraError::from)?;
    records.sort_by(|(a, _), (b, _)| a.cmp(b));

    if records.is_empty() {
        println!("no persisted entries");
        return Ok(());
    }

    let now = OffsetDateTime::now_utc();
    println!(
        "{:<40} {:<10} {:<8} {:>10} {:>10}  STALE",
        "KEY", "TIER", "PRIORITY", "AGE", "SIZE"
    );
    for (key, bytes) in &records {
        match inspect_record(key, bytes) {
            Ok(meta) => println!(
                "{:<40} {:<10} {:<8} {:>10} {:>10}  {}",
                key,
                tier_label(meta.tier),
                priority_label(meta.priority),
                format_age(meta.age_at(now)),
                format_size(bytes.len()),
                if meta.is_stale_at(now) { "yes" } else { "no" },
            ),
            Err(err) => {
                warn!(key = %key, error = %err, "Unreadable persisted record");
                println!("{key:<40} <corrupt: {err}>");
            }
        }
    }
    Ok(())
}

fn run_purge(settings: &Settings, args: &PurgeArgs) -> Result<(), AppError> {
    let pattern = match (&args.key, &args.prefix) {
        (Some(key), _) => KeyPattern::exact(key.as_str()),
        (None, Some(prefix)) => KeyPattern::prefix(prefix.as_str()),
        (None, None) => KeyPattern::All,
    };

    let medium = open_medium(settings)?;
    let removed = purge_medium(medium.as_ref(), &pattern)?;
    info!(pattern = %pattern, removed, "Purged persisted entries");
    println!("removed {removed} entries matching {pattern}");
    Ok(())
}

fn purge_medium(medium: &dyn PersistentMedium, pattern: &KeyPattern) -> Result<usize, AppError> {
    let keys: Vec<String> = medium
        .load_all()
        .map_err(InfraError::from)?
        .into_iter()
        .map(|(key, _)| key)
        .filter(|key| pattern.matches(key))
        .collect();

    for key in &keys {
        medium.remove(key).map_err(InfraError::from)?;
    }
    Ok(keys.len())
}

fn print_settings(settings: &Settings) {
    let storage = settings
        .storage
        .path
        .as_deref()
        .map(Path::display)
        .map_or_else(|| "(memory)".to_string(), |path| path.to_string());

    println!("[logging]");
    println!("level = {}", settings.logging.level);
    println!("format = {:?}", settings.logging.format);
    println!();
    println!("[cache]");
    println!("memory_max_entries = {}", settings.cache.memory_max_entries);
    println!("persistent_max_entries = {}", settings.cache.persistent_max_entries);
    println!("default_expiry = {}", format_age(settings.cache.default_expiry));
    println!("high_priority_expiry = {}", format_age(settings.cache.high_priority_expiry));
    println!();
    println!("[requests]");
    println!("max_concurrent = {}", settings.requests.max_concurrent);
    println!("reference_throttle = {}", format_age(settings.requests.reference_throttle));
    println!("counter_throttle = {}", format_age(settings.requests.counter_throttle));
    println!();
    println!("[channels]");
    println!("base_delay_ms = {}", settings.channels.base_delay.as_millis());
    println!("max_delay_ms = {}", settings.channels.max_delay.as_millis());
    println!("max_reconnect_attempts = {}", settings.channels.max_reconnect_attempts);
    println!("polling_interval = {}", format_age(settings.channels.polling_interval));
    println!();
    println!("[storage]");
    println!("path = {storage}");
}

fn tier_label(tier: Tier) -> &'static str {
    match tier {
        Tier::Memory => "memory",
        Tier::Persistent => "persistent",
        Tier::Both => "both",
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
    }
}
