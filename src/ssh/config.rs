//! SSH host configuration and pool identity

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Host identifier assigned by the host registry (CRUD layer)
pub type HostId = u64;

/// One managed host as supplied by the host registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub id: HostId,

    /// Display name (falls back to `user@host`)
    #[serde(default)]
    pub name: Option<String>,

    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub auth: AuthMethod,

    /// Optional upstream jump host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    /// Pinned server key, `SHA256:...` as printed by `ssh-keygen -l`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,

    /// Disabled hosts are never polled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Upstream jump host for a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub auth: AuthMethod,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

/// Authentication methods supported
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// Private key file on the console host
    Key {
        key_path: String,
        passphrase: Option<String>,
    },

    /// Private key material stored by the registry (OpenSSH/PEM text)
    KeyData {
        private_key: String,
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
            AuthMethod::KeyData { .. } => "key_data",
        }
    }

    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.kind().as_bytes());
        hasher.update([0u8]);
        match self {
            AuthMethod::Password { password } => hasher.update(password.as_bytes()),
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                hasher.update(key_path.as_bytes());
                hasher.update([0u8]);
                hasher.update(passphrase.as_deref().unwrap_or_default().as_bytes());
            }
            AuthMethod::KeyData {
                private_key,
                passphrase,
            } => {
                hasher.update(private_key.as_bytes());
                hasher.update([0u8]);
                hasher.update(passphrase.as_deref().unwrap_or_default().as_bytes());
            }
        }
    }
}

// Secrets never reach the logs
impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password(***)"),
            AuthMethod::Key { key_path, .. } => write!(f, "Key({})", key_path),
            AuthMethod::KeyData { .. } => f.write_str("KeyData(***)"),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

/// Pool key for a connection.
///
/// Any change to address, credentials or proxy produces a different identity,
/// so a stale connection is never reused after the registry record changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostIdentity {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub credential_fingerprint: String,
    pub proxy: Option<Box<HostIdentity>>,
}

impl std::fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{}#{}",
            self.username,
            self.address,
            self.port,
            &self.credential_fingerprint[..8.min(self.credential_fingerprint.len())]
        )?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}", proxy)?;
        }
        Ok(())
    }
}

fn credential_fingerprint(auth: &AuthMethod, host_key: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    auth.feed(&mut hasher);
    hasher.update([0u8]);
    hasher.update(host_key.unwrap_or_default().as_bytes());
    hasher
        .finalize()
        .iter()
        .take(16)
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl ProxyConfig {
    pub fn identity(&self) -> HostIdentity {
        HostIdentity {
            address: self.host.to_lowercase(),
            port: self.port,
            username: self.username.clone(),
            credential_fingerprint: credential_fingerprint(
                &self.auth,
                self.host_key_fingerprint.as_deref(),
            ),
            proxy: None,
        }
    }
}

impl HostConfig {
    pub fn identity(&self) -> HostIdentity {
        HostIdentity {
            address: self.host.to_lowercase(),
            port: self.port,
            username: self.username.clone(),
            credential_fingerprint: credential_fingerprint(
                &self.auth,
                self.host_key_fingerprint.as_deref(),
            ),
            proxy: self.proxy.as_ref().map(|p| Box::new(p.identity())),
        }
    }

    /// Get display name (or generate from config)
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.username, self.host))
    }
}

/// PTY geometry for interactive shells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}
