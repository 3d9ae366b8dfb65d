//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

/// Public relays used when `RELAYS` is not configured.
pub const DEFAULT_RELAYS: [&str; 3] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
];

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// HTTP listen port.
    pub http_port: u16,
    /// Relay URLs to subscribe to.
    pub relays: Vec<String>,
    /// Timeout for webhook POSTs in milliseconds.
    pub webhook_timeout_ms: u64,
    /// Maximum webhook delivery attempts.
    pub webhook_retries: u32,
    /// Hourly request limit for free-tier tenants.
    pub rate_limit_free: u32,
    /// Hourly request limit for premium-tier tenants.
    pub rate_limit_premium: u32,
    /// Seconds between tenant registry reloads.
    pub registry_reload_secs: u64,
    /// Per-relay timeout for one-shot scanner queries, in seconds.
    pub relay_query_timeout_secs: u64,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let database_path = PathBuf::from(env::var("DATABASE_PATH")?);
        let http_port = parse_or("HTTP_PORT", 3000);
        let mut relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        if relays.is_empty() {
            relays = DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect();
        }
        Ok(Self {
            database_path,
            http_port,
            relays,
            webhook_timeout_ms: parse_or("WEBHOOK_TIMEOUT_MS", 5_000),
            webhook_retries: parse_or("WEBHOOK_RETRIES", 3),
            rate_limit_free: parse_or("RATE_LIMIT_FREE", 100),
            rate_limit_premium: parse_or("RATE_LIMIT_PREMIUM", 1_000),
            registry_reload_secs: parse_or("REGISTRY_RELOAD_SECS", 300),
            relay_query_timeout_secs: parse_or("RELAY_QUERY_TIMEOUT_SECS", 10),
        })
    }
}

/// Read an environment variable, falling back to `default` when absent or invalid.
fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 9] = [
        "DATABASE_PATH",
        "HTTP_PORT",
        "RELAYS",
        "WEBHOOK_TIMEOUT_MS",
        "WEBHOOK_RETRIES",
        "RATE_LIMIT_FREE",
        "RATE_LIMIT_PREMIUM",
        "REGISTRY_RELOAD_SECS",
        "RELAY_QUERY_TIMEOUT_SECS",
    ];

    fn clear_vars() {
        for v in ALL_VARS.iter() {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "DATABASE_PATH=/tmp/deepclaw.db\n",
                "HTTP_PORT=4000\n",
                "RELAYS=ws://r1,ws://r2\n",
                "WEBHOOK_TIMEOUT_MS=2500\n",
                "WEBHOOK_RETRIES=5\n",
                "RATE_LIMIT_FREE=50\n",
                "RATE_LIMIT_PREMIUM=500\n",
                "REGISTRY_RELOAD_SECS=60\n",
                "RELAY_QUERY_TIMEOUT_SECS=8\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.database_path, PathBuf::from("/tmp/deepclaw.db"));
        assert_eq!(cfg.http_port, 4000);
        assert_eq!(cfg.relays, vec!["ws://r1".to_string(), "ws://r2".into()]);
        assert_eq!(cfg.webhook_timeout_ms, 2500);
        assert_eq!(cfg.webhook_retries, 5);
        assert_eq!(cfg.rate_limit_free, 50);
        assert_eq!(cfg.rate_limit_premium, 500);
        assert_eq!(cfg.registry_reload_secs, 60);
        assert_eq!(cfg.relay_query_timeout_secs, 8);
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "DATABASE_PATH=/tmp/deepclaw.db\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.http_port, 3000);
        assert_eq!(cfg.relays.len(), DEFAULT_RELAYS.len());
        assert_eq!(cfg.webhook_timeout_ms, 5_000);
        assert_eq!(cfg.webhook_retries, 3);
        assert_eq!(cfg.rate_limit_free, 100);
        assert_eq!(cfg.rate_limit_premium, 1_000);
        assert_eq!(cfg.registry_reload_secs, 300);
        assert_eq!(cfg.relay_query_timeout_secs, 10);
    }

    #[test]
    fn missing_database_path_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "HTTP_PORT=4000\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!("DATABASE_PATH=/tmp/x.db\n", "HTTP_PORT=notaport\n"),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.http_port, 3000);
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
