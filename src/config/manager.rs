//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "RUSTFORWARD_";

/// Manages configuration loading
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults if it is missing.
    ///
    /// Not validated here: CLI overrides usually fill in the remote target.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            tracing::debug!("Configuration loaded from {}", path.display());
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Load configuration from `RUSTFORWARD_*` environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from defaults plus whatever `lookup` returns
    /// for each `RUSTFORWARD_*` variable name
    pub fn load_from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Config::default();

        if let Some(local_addr) = var("LOCAL_ADDR") {
            config.forwarding.local_addr = local_addr
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid RUSTFORWARD_LOCAL_ADDR: {}", local_addr))?;
        }

        if let Some(host) = var("REMOTE_HOST") {
            config.forwarding.remote_host = host;
        }

        if let Some(port) = var("REMOTE_PORT") {
            config.forwarding.remote_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid RUSTFORWARD_REMOTE_PORT: {}", port))?;
        }

        if let Some(port) = var("PREFERRED_PORT") {
            config.forwarding.preferred_port = Some(
                port.parse::<u16>()
                    .with_context(|| format!("Invalid RUSTFORWARD_PREFERRED_PORT: {}", port))?,
            );
        }

        if let Some(backlog) = var("BACKLOG") {
            config.forwarding.backlog = backlog
                .parse::<u32>()
                .with_context(|| format!("Invalid RUSTFORWARD_BACKLOG: {}", backlog))?;
        }

        if let Some(chunk_size) = var("CHUNK_SIZE") {
            config.forwarding.chunk_size = chunk_size
                .parse::<usize>()
                .with_context(|| format!("Invalid RUSTFORWARD_CHUNK_SIZE: {}", chunk_size))?;
        }

        if let Some(timeout) = var("DRAIN_TIMEOUT") {
            config.forwarding.drain_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid RUSTFORWARD_DRAIN_TIMEOUT: {}", timeout))?;
        }

        if let Some(path) = var("CONTROL_SOCKET") {
            config.termination.enabled = true;
            config.termination.socket_path = Some(PathBuf::from(path));
        }

        if let Some(secret) = var("SECRET") {
            config.termination.enabled = true;
            config.termination.secret = Some(secret);
        }

        if let Some(log_level) = var("LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(config)
    }
}

/// Values given on the command line; `None` leaves the setting alone
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub local_addr: Option<IpAddr>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub preferred_port: Option<u16>,
    pub backlog: Option<u32>,
    pub chunk_size: Option<usize>,
    pub control_socket: Option<PathBuf>,
    pub secret: Option<String>,
    pub credential_file: Option<PathBuf>,
    pub terminable: bool,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_forwarding_config()
            .with_context(|| "Forwarding configuration validation failed")?;

        self.validate_termination_config()
            .with_context(|| "Termination configuration validation failed")?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    fn validate_forwarding_config(&self) -> Result<()> {
        let forwarding = &self.forwarding;

        if forwarding.remote_host.trim().is_empty() {
            bail!("remote_host must be set");
        }

        if forwarding.remote_port == 0 {
            bail!("remote_port must be greater than 0");
        }

        validate_socket_settings(forwarding.backlog, forwarding.chunk_size)
    }

    fn validate_termination_config(&self) -> Result<()> {
        let termination = &self.termination;
        if !termination.enabled {
            return Ok(());
        }

        if matches!(&termination.secret, Some(secret) if secret.is_empty()) {
            bail!("secret must not be empty");
        }

        if termination.send_timeout.is_zero() {
            bail!("send_timeout must be greater than 0");
        }

        validate_socket_settings(termination.backlog, termination.chunk_size)
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &ConfigOverrides) {
        if let Some(addr) = overrides.local_addr {
            self.forwarding.local_addr = addr;
            tracing::info!("CLI override: local address set to {}", addr);
        }

        if let Some(host) = &overrides.remote_host {
            self.forwarding.remote_host = host.clone();
            tracing::info!("CLI override: remote host set to {}", host);
        }

        if let Some(port) = overrides.remote_port {
            self.forwarding.remote_port = port;
            tracing::info!("CLI override: remote port set to {}", port);
        }

        if let Some(port) = overrides.preferred_port {
            self.forwarding.preferred_port = Some(port);
            tracing::info!("CLI override: preferred port set to {}", port);
        }

        if let Some(backlog) = overrides.backlog {
            self.forwarding.backlog = backlog;
            tracing::info!("CLI override: backlog set to {}", backlog);
        }

        if let Some(chunk_size) = overrides.chunk_size {
            self.forwarding.chunk_size = chunk_size;
            tracing::info!("CLI override: chunk size set to {} bytes", chunk_size);
        }

        if let Some(path) = &overrides.control_socket {
            self.termination.enabled = true;
            self.termination.socket_path = Some(path.clone());
            tracing::info!("CLI override: control socket set to {}", path.display());
        }

        if let Some(secret) = &overrides.secret {
            self.termination.enabled = true;
            self.termination.secret = Some(secret.clone());
            tracing::info!("CLI override: termination secret set");
        }

        if let Some(path) = &overrides.credential_file {
            self.termination.enabled = true;
            self.termination.credential_file = Some(path.clone());
            tracing::info!("CLI override: credential file set to {}", path.display());
        }

        if overrides.terminable {
            self.termination.enabled = true;
            tracing::info!("CLI override: termination channel enabled");
        }
    }
}

fn validate_socket_settings(backlog: u32, chunk_size: usize) -> Result<()> {
    if backlog == 0 {
        bail!("backlog must be at least 1");
    }

    if chunk_size == 0 {
        bail!("chunk_size must be greater than 0");
    }

    if chunk_size > 1_048_576 {
        bail!("chunk_size cannot exceed 1MB");
    }

    Ok(())
}
