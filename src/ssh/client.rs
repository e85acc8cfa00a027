//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, HostConfig, ProxyConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};

/// Established SSH connection: the target controller plus the jump host
/// controller it tunnels through, if any.
pub struct SshConnection {
    pub target: HandleController,
    pub jump: Option<HandleController>,
}

/// Connects to one host from the registry
pub struct SshClient {
    config: HostConfig,
    timeout: Duration,
}

impl SshClient {
    pub fn new(config: HostConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    /// Resolve, handshake and authenticate, optionally through a jump host
    pub async fn connect(self) -> Result<SshConnection, SshError> {
        let label = self.config.identity().to_string();

        match &self.config.proxy {
            None => {
                let handle = self.direct_connect().await?;
                Ok(SshConnection {
                    target: spawn_handle_owner_task(handle, label),
                    jump: None,
                })
            }
            Some(proxy) => {
                let jump_handle = connect_jump_host(proxy, self.timeout).await?;
                let jump = spawn_handle_owner_task(jump_handle, proxy.identity().to_string());

                match self.connect_through(&jump).await {
                    Ok(handle) => Ok(SshConnection {
                        target: spawn_handle_owner_task(handle, label),
                        jump: Some(jump),
                    }),
                    Err(e) => {
                        jump.disconnect().await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn direct_connect(&self) -> Result<Handle<ClientHandler>, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = resolve(&addr)?;
        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_fingerprint.clone(),
        );

        let mut handle = tokio::time::timeout(
            self.timeout,
            client::connect(ssh_config(), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(classify_handshake_error)?;

        debug!("SSH handshake with {} completed", addr);
        authenticate(&mut handle, &self.config.username, &self.config.auth).await?;
        info!("SSH authentication to {} successful", addr);
        Ok(handle)
    }

    /// SSH over a direct-tcpip channel opened on the jump host
    async fn connect_through(
        &self,
        jump: &HandleController,
    ) -> Result<Handle<ClientHandler>, SshError> {
        info!(
            "Connecting to {}:{} via jump host",
            self.config.host, self.config.port
        );

        let channel = jump
            .open_direct_tcpip(&self.config.host, self.config.port)
            .await?;
        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_fingerprint.clone(),
        );

        let mut handle = tokio::time::timeout(
            self.timeout,
            client::connect_stream(ssh_config(), channel.into_stream(), handler),
        )
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "Connection to {}:{} via jump host timed out",
                self.config.host, self.config.port
            ))
        })?
        .map_err(classify_handshake_error)?;

        debug!("SSH handshake via stream completed");
        authenticate(&mut handle, &self.config.username, &self.config.auth).await?;
        Ok(handle)
    }
}

async fn connect_jump_host(
    proxy: &ProxyConfig,
    timeout: Duration,
) -> Result<Handle<ClientHandler>, SshError> {
    let addr = format!("{}:{}", proxy.host, proxy.port);
    info!("Connecting to jump host at {}", addr);

    let socket_addr = resolve(&addr)?;
    let handler = ClientHandler::new(
        proxy.host.clone(),
        proxy.port,
        proxy.host_key_fingerprint.clone(),
    );

    let mut handle = tokio::time::timeout(
        timeout,
        client::connect(ssh_config(), socket_addr, handler),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
    .map_err(classify_handshake_error)?;

    authenticate(&mut handle, &proxy.username, &proxy.auth).await?;
    info!("Authenticated to jump host {}", proxy.host);
    Ok(handle)
}

fn resolve(addr: &str) -> Result<std::net::SocketAddr, SshError> {
    addr.to_socket_addrs()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| SshError::ConnectionFailed(format!("No address found for {}", addr)))
}

fn ssh_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Keep the handler's own error (host key rejection) instead of flattening it
fn classify_handshake_error(err: SshError) -> SshError {
    match err {
        SshError::HostKeyRejected(_) => err,
        SshError::ProtocolError(msg) | SshError::IoError(msg) => SshError::ConnectionFailed(msg),
        other => other,
    }
}

/// Expand ~ to home directory; russh::keys does not
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

fn load_key(auth: &AuthMethod) -> Result<Option<PrivateKey>, SshError> {
    match auth {
        AuthMethod::Password { .. } => Ok(None),
        AuthMethod::Key {
            key_path,
            passphrase,
        } => russh::keys::load_secret_key(expand_tilde(key_path), passphrase.as_deref())
            .map(Some)
            .map_err(|e| SshError::KeyError(e.to_string())),
        AuthMethod::KeyData {
            private_key,
            passphrase,
        } => russh::keys::decode_secret_key(private_key, passphrase.as_deref())
            .map(Some)
            .map_err(|e| SshError::KeyError(e.to_string())),
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    auth: &AuthMethod,
) -> Result<(), SshError> {
    let result = match (auth, load_key(auth)?) {
        (AuthMethod::Password { password }, _) => handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
        (_, Some(key)) => {
            handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), None))
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        (_, None) => {
            return Err(SshError::KeyError("No private key available".to_string()));
        }
    };

    if !result.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "Authentication for {} rejected by server",
            username
        )));
    }
    Ok(())
}

/// `SHA256:<base64>` as printed by `ssh-keygen -l`
pub fn fingerprint(key: &PublicKey) -> String {
    let hash = Sha256::digest(key.public_key_bytes());
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Client handler for russh callbacks.
///
/// With a pinned fingerprint the server key must match it exactly; without
/// one the key is accepted and its fingerprint logged.
pub struct ClientHandler {
    host: String,
    port: u16,
    expected_fingerprint: Option<String>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, expected_fingerprint: Option<String>) -> Self {
        Self {
            host,
            port,
            expected_fingerprint,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);
        match &self.expected_fingerprint {
            Some(expected) if expected.trim_end_matches('=') == actual => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Some(expected) => {
                warn!(
                    "Host key mismatch for {}:{}: expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(SshError::HostKeyRejected(format!(
                    "Key for {}:{} does not match pinned fingerprint (got {})",
                    self.host, self.port, actual
                )))
            }
            None => {
                info!(
                    "Accepting host key for {}:{} ({})",
                    self.host, self.port, actual
                );
                Ok(true)
            }
        }
    }
}
