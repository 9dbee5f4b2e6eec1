//! Configuration loading and management

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the authorization server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Credential lifetimes and lengths
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Persistence settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Expired-credential cleanup
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Authorization code lifetime in seconds (default: 10 minutes)
    #[serde(default = "default_authorization_code_lifetime")]
    pub authorization_code_lifetime_secs: u64,

    /// Access token lifetime in seconds (default: 1 day)
    #[serde(default = "default_access_token_lifetime")]
    pub access_token_lifetime_secs: u64,

    /// Refresh token lifetime in seconds (default: about one month)
    #[serde(default = "default_refresh_token_lifetime")]
    pub refresh_token_lifetime_secs: u64,

    /// Length of generated codes and token strings
    #[serde(default = "default_token_length")]
    pub token_length: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            authorization_code_lifetime_secs: default_authorization_code_lifetime(),
            access_token_lifetime_secs: default_access_token_lifetime(),
            refresh_token_lifetime_secs: default_refresh_token_lifetime(),
            token_length: default_token_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Write relations to JSON files in the config directory.
    /// When false, all state is lost on restart.
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persist: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between sweeps of expired codes and tokens; 0 disables the reaper
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_authorization_code_lifetime() -> u64 {
    600 // 10 minutes
}

fn default_access_token_lifetime() -> u64 {
    86400 // 1 day
}

fn default_refresh_token_lifetime() -> u64 {
    2628288 // ~30.4 days
}

fn default_token_length() -> usize {
    64
}

fn default_reaper_interval() -> u64 {
    300
}

/// Shortest token length we accept (~190 bits from a 62-symbol alphabet)
const MIN_TOKEN_LENGTH: usize = 32;

/// Longest lifetime we accept: 100 years
const MAX_LIFETIME_SECS: u64 = 100 * 365 * 24 * 60 * 60;

impl Config {
    /// Load configuration from the config directory
    pub fn load(config_path: &str) -> Result<Self> {
        let config_file = Path::new(config_path).join("config.json");

        let config = if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            config
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_file
            );
            let config = Config::default();

            std::fs::create_dir_all(config_path)
                .with_context(|| format!("Failed to create config directory: {}", config_path))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would break credential invariants
    pub fn validate(&self) -> Result<()> {
        let t = &self.tokens;
        if t.authorization_code_lifetime_secs == 0
            || t.access_token_lifetime_secs == 0
            || t.refresh_token_lifetime_secs == 0
        {
            bail!("Token lifetimes must be greater than zero");
        }
        for (name, secs) in [
            ("authorization_code_lifetime_secs", t.authorization_code_lifetime_secs),
            ("access_token_lifetime_secs", t.access_token_lifetime_secs),
            ("refresh_token_lifetime_secs", t.refresh_token_lifetime_secs),
        ] {
            if secs > MAX_LIFETIME_SECS {
                bail!("{} must be at most {}, got {}", name, MAX_LIFETIME_SECS, secs);
            }
        }
        if t.access_token_lifetime_secs >= t.refresh_token_lifetime_secs {
            bail!(
                "access_token_lifetime_secs ({}) must be shorter than refresh_token_lifetime_secs ({})",
                t.access_token_lifetime_secs,
                t.refresh_token_lifetime_secs
            );
        }
        if t.token_length < MIN_TOKEN_LENGTH {
            bail!(
                "token_length must be at least {}, got {}",
                MIN_TOKEN_LENGTH,
                t.token_length
            );
        }
        Ok(())
    }
}
