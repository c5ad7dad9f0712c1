use std::env;
use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::premium::manager::{DEFAULT_CACHE_TTL_SECS, DEFAULT_SWEEP_INTERVAL_SECS};

const DEFAULT_MONGODB_URI: &str = "mongodb://localhost:27017";
const DEFAULT_MONGODB_DB: &str = "prism";
const DEFAULT_PREMIUM_DURATION_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub mongodb_uri: String,
    pub mongodb_db: String,
    pub default_duration_days: i64,
    pub cache_ttl_secs: i64,
    pub sweep_interval_secs: u64,
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("{} has an unparseable value '{}', using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        info!("Loading configuration from environment variables");

        let discord_token =
            env::var("DISCORD_TOKEN").context("DISCORD_TOKEN environment variable not set")?;
        if discord_token.is_empty() {
            return Err(anyhow::anyhow!("DISCORD_TOKEN cannot be empty"));
        }
        if discord_token.len() < 50 {
            warn!(
                "DISCORD_TOKEN seems unusually short ({}). This might be incorrect.",
                discord_token.len()
            );
        }

        let mongodb_uri = env::var("MONGODB_URI").unwrap_or_else(|_| {
            info!("MONGODB_URI not set, using default: '{}'", DEFAULT_MONGODB_URI);
            DEFAULT_MONGODB_URI.to_string()
        });

        let mongodb_db = env::var("MONGODB_DB").unwrap_or_else(|_| {
            info!("MONGODB_DB not set, using default: '{}'", DEFAULT_MONGODB_DB);
            DEFAULT_MONGODB_DB.to_string()
        });

        let default_duration_days =
            parse_env_or("PREMIUM_DEFAULT_DAYS", DEFAULT_PREMIUM_DURATION_DAYS);
        let cache_ttl_secs = parse_env_or("PREMIUM_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS);
        let sweep_interval_secs =
            parse_env_or("PREMIUM_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS);

        let config = Config {
            discord_token,
            mongodb_uri,
            mongodb_db,
            default_duration_days,
            cache_ttl_secs,
            sweep_interval_secs,
        };
        config.validate()?;

        info!("Configuration loaded successfully:");
        info!("- Database: {}", config.mongodb_db);
        info!("- Default premium duration: {} days", config.default_duration_days);
        info!("- Cache TTL: {}s", config.cache_ttl_secs);
        info!("- Sweep interval: {}s", config.sweep_interval_secs);

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discord_token.is_empty() {
            return Err(anyhow::anyhow!("Discord token is empty"));
        }
        if self.mongodb_uri.is_empty() {
            return Err(anyhow::anyhow!("MongoDB URI is empty"));
        }
        if self.mongodb_db.is_empty() {
            return Err(anyhow::anyhow!("MongoDB database name is empty"));
        }
        if self.default_duration_days <= 0 {
            return Err(anyhow::anyhow!(
                "Default premium duration must be positive, got {}",
                self.default_duration_days
            ));
        }
        if self.cache_ttl_secs <= 0 {
            return Err(anyhow::anyhow!(
                "Cache TTL must be positive, got {}",
                self.cache_ttl_secs
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Sweep interval must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            discord_token: "x".repeat(60),
            mongodb_uri: DEFAULT_MONGODB_URI.to_string(),
            mongodb_db: DEFAULT_MONGODB_DB.to_string(),
            default_duration_days: DEFAULT_PREMIUM_DURATION_DAYS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn non_positive_durations_are_rejected() {
        let mut config = base_config();
        config.default_duration_days = 0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.cache_ttl_secs = -5;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.sweep_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
