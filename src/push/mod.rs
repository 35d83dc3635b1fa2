//! VoIP push handling: the cached registration and payload decoding.
//!
//! The registration transport itself is the SDK's business; this module only
//! decides when a (re-)registration is due and remembers the last one.

pub mod payload;
pub mod registration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use crate::config::Config;

pub use payload::parse_push_payload;
pub use registration::{
    credentials_invalidated, credentials_updated, record_registration, registration_required,
    renewal_due_at, PushCredentialStore,
};

/// Normalise a device token to lowercase hex.
fn normalize_token(device_token: &str) -> Result<String> {
    let token = device_token.trim().to_ascii_lowercase();
    if token.is_empty() || token.len() % 2 != 0 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("Device token must be a non-empty hex string");
    }
    Ok(token)
}

fn format_timestamp(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Register `device_token` for incoming-call pushes unless the cached binding
/// is still fresh.
pub fn register(device_token: &str, force: bool) -> Result<()> {
    let token = normalize_token(device_token)?;
    let mut config = Config::load()?;
    let now = Utc::now().timestamp();

    if !force && !credentials_updated(&config, &token, config.push.registration_ttl_days, now) {
        println!("Already registered, nothing to do.");
        if let Some(bound_at) = config.binding_date() {
            println!("Registered: {}", format_timestamp(bound_at));
        }
        return Ok(());
    }

    let identity = config.identity.clone().unwrap_or_else(|| "anonymous".to_string());
    tracing::info!("Registering device token for {}", identity);
    record_registration(&mut config, token, now);
    config.save()?;

    println!("Registered {} for incoming calls.", identity);
    Ok(())
}

/// Forget the cached registration. Idempotent.
pub fn unregister() -> Result<()> {
    let mut config = Config::load()?;
    let Some(token) = credentials_invalidated(&mut config) else {
        println!("Not registered.");
        return Ok(());
    };

    let prefix: String = token.chars().take(8).collect();
    tracing::info!("Unregistering device token {}...", prefix);
    config.save()?;
    println!("Unregistered.");
    Ok(())
}

/// Show identity, cached registration and call settings.
pub fn status() -> Result<()> {
    let config = Config::load()?;
    let ttl_days = config.push.registration_ttl_days;

    println!("Config:    {}", Config::config_path()?.display());
    println!(
        "Identity:  {}",
        config.identity.as_deref().unwrap_or("(not set)")
    );

    match (config.cached_device_token(), config.binding_date()) {
        (Some(token), Some(bound_at)) => {
            let prefix: String = token.chars().take(8).collect();
            println!("Push:      registered ({}...)", prefix);
            println!("Bound:     {}", format_timestamp(bound_at));
            println!(
                "Renew at:  {}",
                format_timestamp(renewal_due_at(bound_at, ttl_days))
            );
            if registration_required(&config, ttl_days, Utc::now().timestamp()) {
                println!("Registration is due for renewal.");
            }
        }
        _ => println!("Push:      not registered"),
    }

    println!("Lines:     {}", config.calls.line_groups.max(1));
    println!("Ringback:  {}", config.calls.play_custom_ringback);
    println!("Speaker:   {}", config.calls.speaker_on_connect);
    Ok(())
}
