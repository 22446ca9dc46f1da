//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Listen backlog used when none is configured
pub const DEFAULT_BACKLOG: u32 = 5;

/// Bytes read from a socket per readiness event
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub forwarding: ForwardingConfig,
    pub termination: TerminationConfig,
    pub logging: LoggingConfig,
}

/// Forwarding listener configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Local address to listen on
    pub local_addr: IpAddr,
    pub remote_host: String,
    pub remote_port: u16,
    /// Port to try first; the OS picks one if it is taken or unset
    pub preferred_port: Option<u16>,
    pub backlog: u32,
    pub chunk_size: usize,
    /// How long `serve` waits for in-flight connections after a signal
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

/// Termination channel configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TerminationConfig {
    pub enabled: bool,
    /// Generated under the temp directory when unset
    pub socket_path: Option<PathBuf>,
    /// Generated when unset
    pub secret: Option<String>,
    /// Where `serve` writes the credential JSON
    pub credential_file: Option<PathBuf>,
    pub backlog: u32,
    pub chunk_size: usize,
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            local_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_host: String::new(),
            remote_port: 0,
            preferred_port: None,
            backlog: DEFAULT_BACKLOG,
            chunk_size: DEFAULT_CHUNK_SIZE,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: None,
            secret: None,
            credential_file: None,
            backlog: DEFAULT_BACKLOG,
            chunk_size: DEFAULT_CHUNK_SIZE,
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
