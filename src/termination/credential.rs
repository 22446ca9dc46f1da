//! Termination credential and client
//!
//! A credential is the capability to stop a forwarder: the control socket
//! path plus the secret. It is handed to other processes as JSON, with the
//! secret base64-encoded so arbitrary bytes survive.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::Result;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub socket_path: PathBuf,
    #[serde(with = "secret_base64")]
    pub secret: Vec<u8>,
}

impl Credential {
    pub fn new(socket_path: impl Into<PathBuf>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            socket_path: socket_path.into(),
            secret: secret.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize credential")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse credential")
    }

    /// Write the credential readable by the current user only
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to create credential file: {}", path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write credential file: {}", path.display()))?;

        debug!("Credential written to {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credential file: {}", path.display()))?;
        Self::from_json(&json)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("socket_path", &self.socket_path)
            .field("secret", &format_args!("<{} bytes>", self.secret.len()))
            .finish()
    }
}

/// Deliver the secret to the control socket and hang up.
///
/// Success means the bytes were written, not that the forwarder stopped;
/// probe the forwarding port to observe the effect.
pub fn send_termination(credential: &Credential, timeout: Duration) -> Result<()> {
    let path = &credential.socket_path;
    let mut stream = UnixStream::connect(path)
        .with_context(|| format!("Failed to connect to control socket {}", path.display()))?;
    stream
        .set_write_timeout(Some(timeout))
        .context("Failed to set write timeout")?;
    stream
        .write_all(&credential.secret)
        .with_context(|| format!("Failed to send secret to {}", path.display()))?;
    stream.flush()?;

    info!("Termination request sent to {}", path.display());
    Ok(())
}

mod secret_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(secret))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
