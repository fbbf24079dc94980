//! Configuration file management for edgemesh.
//!
//! Provides a TOML-based config file at `~/.config/edgemesh/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use edgemesh_core::retry::RetryConfig;
use edgemesh_core::store::FreshnessThresholds;
use edgemesh_core::token::TokenSecret;
use edgemesh_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub scheduling: SchedulingSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded shared secret presented by workers registering for the
    /// first time (spec.md section 6: `node.register`).
    pub bootstrap_secret: String,
    /// Hex-encoded secret used to sign/verify node tokens.
    pub node_token_secret: String,
    /// Hex-encoded secret used to sign/verify job (producer) tokens.
    pub job_token_secret: String,
    /// Hex-encoded secret used to sign/verify admin tokens.
    pub admin_secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulingSection {
    pub node_token_ttl_ms: i64,
    pub claim_ttl_ms: i64,
    pub healthy_ms: i64,
    pub degraded_ms: i64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ratio: f64,
    pub reaper_interval_ms: u64,
    pub ring_capacity: usize,
}

impl Default for SchedulingSection {
    fn default() -> Self {
        let retry = RetryConfig::default();
        let thresholds = FreshnessThresholds::default();
        Self {
            node_token_ttl_ms: 60 * 60 * 1000,
            claim_ttl_ms: 30_000,
            healthy_ms: thresholds.healthy_ms,
            degraded_ms: thresholds.degraded_ms,
            retry_base_ms: retry.base_delay_ms,
            retry_max_ms: retry.max_delay_ms,
            retry_jitter_ratio: retry.jitter_ratio,
            reaper_interval_ms: 5_000,
            ring_capacity: edgemesh_core::events::DEFAULT_RING_CAPACITY,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the edgemesh config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/edgemesh` or
/// `~/.config/edgemesh`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("edgemesh");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("edgemesh")
}

/// Return the path to the edgemesh config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Secret generation
// -----------------------------------------------------------------------

/// Generate a random secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use by `edgemesh serve` and the
/// other operator commands.
#[derive(Debug)]
pub struct EdgeMeshConfig {
    pub db_config: DbConfig,
    pub bootstrap_secret: TokenSecret,
    pub node_token_secret: TokenSecret,
    pub job_token_secret: TokenSecret,
    pub admin_secret: TokenSecret,
    pub node_token_ttl_ms: i64,
    pub claim_ttl_ms: i64,
    pub freshness_thresholds: FreshnessThresholds,
    pub retry_config: RetryConfig,
    pub reaper_interval: Duration,
    pub ring_capacity: usize,
}

impl EdgeMeshConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `EDGEMESH_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Secrets: `EDGEMESH_{KIND}_SECRET` env > `config_file.auth.{kind}` (hex-decoded) > error
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("EDGEMESH_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let bootstrap_secret = resolve_secret(
            "EDGEMESH_BOOTSTRAP_SECRET",
            file_config.as_ref().map(|c| c.auth.bootstrap_secret.as_str()),
            "bootstrap_secret",
        )?;
        let node_token_secret = resolve_secret(
            "EDGEMESH_NODE_TOKEN_SECRET",
            file_config.as_ref().map(|c| c.auth.node_token_secret.as_str()),
            "node_token_secret",
        )?;
        let job_token_secret = resolve_secret(
            "EDGEMESH_JOB_TOKEN_SECRET",
            file_config.as_ref().map(|c| c.auth.job_token_secret.as_str()),
            "job_token_secret",
        )?;
        let admin_secret = resolve_secret(
            "EDGEMESH_ADMIN_SECRET",
            file_config.as_ref().map(|c| c.auth.admin_secret.as_str()),
            "admin_secret",
        )?;

        let scheduling = file_config.map(|c| c.scheduling).unwrap_or_default();

        Ok(Self {
            db_config,
            bootstrap_secret,
            node_token_secret,
            job_token_secret,
            admin_secret,
            node_token_ttl_ms: scheduling.node_token_ttl_ms,
            claim_ttl_ms: scheduling.claim_ttl_ms,
            freshness_thresholds: FreshnessThresholds {
                healthy_ms: scheduling.healthy_ms,
                degraded_ms: scheduling.degraded_ms,
            },
            retry_config: RetryConfig {
                base_delay_ms: scheduling.retry_base_ms,
                max_delay_ms: scheduling.retry_max_ms,
                jitter_ratio: scheduling.retry_jitter_ratio,
            },
            reaper_interval: Duration::from_millis(scheduling.reaper_interval_ms),
            ring_capacity: scheduling.ring_capacity,
        })
    }
}

fn resolve_secret(env_var: &str, file_hex: Option<&str>, field_name: &str) -> Result<TokenSecret> {
    let hex_str = if let Ok(v) = std::env::var(env_var) {
        v
    } else if let Some(v) = file_hex {
        v.to_string()
    } else {
        bail!(
            "{field_name} not found; set {env_var} or run `edgemesh init` to create a config file"
        );
    };
    TokenSecret::from_hex(&hex_str).with_context(|| format!("invalid hex in {field_name}"))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
