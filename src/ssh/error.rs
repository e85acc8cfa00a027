//! Transport and channel errors

use crate::error::ErrorCode;

/// Failure talking to a host.
///
/// The pool only distinguishes two families: credential problems, which
/// are reported immediately and never retried, and transport faults, which
/// go through backoff.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Link dropped or the handle owner task is gone
    #[error("Disconnected")]
    Disconnected,

    // Credential family
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),
}

impl SshError {
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SshError::AuthenticationFailed(_) | SshError::KeyError(_) | SshError::HostKeyRejected(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        if self.is_auth() {
            ErrorCode::AuthFailure
        } else {
            ErrorCode::TransportFailure
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::IoError(err.to_string())
    }
}
