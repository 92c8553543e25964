use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::constants::*;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub cors_allowed_origins: String,

    // Game
    pub public_seed: String,
    pub game_server_url: String,
    pub web_server_url: String,
    pub event_source: String,
    pub tick_window: usize,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub database_acquire_timeout_secs: u64,
    pub write_to_db: bool,
    pub tx_max_attempts: u32,
    pub tx_retry_base_ms: u64,

    // History windows
    pub game_history: usize,
    pub chat_history: usize,

    // Identity cache
    pub identity_cache_ttl_secs: u64,
    pub identity_cache_max: usize,

    // Backfill
    pub backfill_enabled: bool,
    pub backfill_max_retries: u32,
    pub backfill_retry_delay_ms: u64,
    pub backfill_throttle_ms: u64,
    pub backfill_max_span: i64,
}

// Internal helper that checks conditions for `parse_flag`.
fn parse_flag(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name).map(|v| parse_flag(&v)).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string()),

            public_seed: env::var("PUBLIC_SEED")
                .unwrap_or_else(|_| DEFAULT_PUBLIC_SEED.to_string()),
            game_server_url: env::var("GAME_SERVER_URL")
                .unwrap_or_else(|_| "https://gs.bustabit.com".to_string()),
            web_server_url: env::var("WEB_SERVER_URL")
                .unwrap_or_else(|_| "https://www.bustabit.com".to_string()),
            event_source: env::var("EVENT_SOURCE").unwrap_or_else(|_| "-".to_string()),
            tick_window: env::var("TICK_WINDOW")
                .unwrap_or_else(|_| DEFAULT_TICK_WINDOW.to_string())
                .parse()?,

            database_url: env::var("DATABASE_URL")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| DEFAULT_DATABASE_MAX_CONNECTIONS.to_string())
                .parse()?,
            database_acquire_timeout_secs: env::var("DATABASE_ACQUIRE_TIMEOUT_SECS")
                .unwrap_or_else(|_| DEFAULT_DATABASE_ACQUIRE_TIMEOUT_SECS.to_string())
                .parse()?,
            write_to_db: env_flag("WRITE_TO_DB", true),
            tx_max_attempts: env::var("TX_MAX_ATTEMPTS")
                .unwrap_or_else(|_| DEFAULT_TX_MAX_ATTEMPTS.to_string())
                .parse()?,
            tx_retry_base_ms: env::var("TX_RETRY_BASE_MS")
                .unwrap_or_else(|_| DEFAULT_TX_RETRY_BASE_MS.to_string())
                .parse()?,

            game_history: env::var("GAME_HISTORY")
                .unwrap_or_else(|_| DEFAULT_GAME_HISTORY.to_string())
                .parse()?,
            chat_history: env::var("CHAT_HISTORY")
                .unwrap_or_else(|_| DEFAULT_CHAT_HISTORY.to_string())
                .parse()?,

            identity_cache_ttl_secs: env::var("IDENTITY_CACHE_TTL_SECS")
                .unwrap_or_else(|_| DEFAULT_IDENTITY_CACHE_TTL_SECS.to_string())
                .parse()?,
            identity_cache_max: env::var("IDENTITY_CACHE_MAX")
                .unwrap_or_else(|_| DEFAULT_IDENTITY_CACHE_MAX.to_string())
                .parse()?,

            backfill_enabled: env_flag("BACKFILL_ENABLED", true),
            backfill_max_retries: env::var("BACKFILL_MAX_RETRIES")
                .unwrap_or_else(|_| DEFAULT_BACKFILL_MAX_RETRIES.to_string())
                .parse()?,
            backfill_retry_delay_ms: env::var("BACKFILL_RETRY_DELAY_MS")
                .unwrap_or_else(|_| DEFAULT_BACKFILL_RETRY_DELAY_MS.to_string())
                .parse()?,
            backfill_throttle_ms: env::var("BACKFILL_THROTTLE_MS")
                .unwrap_or_else(|_| DEFAULT_BACKFILL_THROTTLE_MS.to_string())
                .parse()?,
            backfill_max_span: env::var("BACKFILL_MAX_SPAN")
                .unwrap_or_else(|_| DEFAULT_BACKFILL_MAX_SPAN.to_string())
                .parse()?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("DATABASE_URL is empty");
        }
        url::Url::parse(&self.web_server_url)
            .map_err(|e| anyhow::anyhow!("Invalid WEB_SERVER_URL: {e}"))?;
        url::Url::parse(&self.game_server_url)
            .map_err(|e| anyhow::anyhow!("Invalid GAME_SERVER_URL: {e}"))?;
        if self.public_seed.trim().is_empty() {
            anyhow::bail!("PUBLIC_SEED is empty");
        }
        if self.game_history == 0 || self.chat_history == 0 {
            anyhow::bail!("GAME_HISTORY and CHAT_HISTORY must be > 0");
        }
        if self.database_max_connections == 0 {
            anyhow::bail!("DATABASE_MAX_CONNECTIONS must be > 0");
        }
        if self.tx_max_attempts == 0 {
            anyhow::bail!("TX_MAX_ATTEMPTS must be > 0");
        }

        if self.public_seed != DEFAULT_PUBLIC_SEED {
            tracing::warn!("Using a non-default public seed; verification results will differ");
        }
        if self.database_max_connections > 10 {
            tracing::warn!(
                "DATABASE_MAX_CONNECTIONS={} is large for a single watcher",
                self.database_max_connections
            );
        }
        if self.backfill_enabled && self.backfill_max_retries == 0 {
            tracing::warn!("BACKFILL_MAX_RETRIES is 0; every missing round will be skipped");
        }
        if self.tick_window < 2 {
            tracing::warn!("TICK_WINDOW < 2 disables tick predictions");
        }

        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.database_acquire_timeout_secs)
    }

    pub fn identity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_cache_ttl_secs)
    }
}

#[cfg(test)]
pub(crate) fn test_config(database_url: &str) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 3000,
        environment: "development".to_string(),
        cors_allowed_origins: "*".to_string(),
        public_seed: DEFAULT_PUBLIC_SEED.to_string(),
        game_server_url: "https://gs.example.com".to_string(),
        web_server_url: "https://www.example.com".to_string(),
        event_source: "-".to_string(),
        tick_window: DEFAULT_TICK_WINDOW,
        database_url: database_url.to_string(),
        database_max_connections: 1,
        database_acquire_timeout_secs: 1,
        write_to_db: false,
        tx_max_attempts: 2,
        tx_retry_base_ms: 0,
        game_history: 5,
        chat_history: 5,
        identity_cache_ttl_secs: 60,
        identity_cache_max: 10,
        backfill_enabled: false,
        backfill_max_retries: 1,
        backfill_retry_delay_ms: 0,
        backfill_throttle_ms: 0,
        backfill_max_span: 10,
    }
}
