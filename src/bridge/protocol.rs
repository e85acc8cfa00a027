//! Gateway wire protocol
//!
//! JSON text frames tagged by `type` (snake_case), fields in camelCase.
//!
//! Client -> server:
//! ```text
//! {"type":"auth","token":"..."}                       first frame only
//! {"type":"subscribe_monitoring","hostId":1,"kind":"host-metrics"}
//! {"type":"unsubscribe_monitoring","hostId":1,"kind":"container-metrics","containerId":"web"}
//! {"type":"ssh_connect","hostId":1}
//! {"type":"ssh_command","sessionId":"...","command":"ls -la"}
//! {"type":"ssh_resize","sessionId":"...","cols":120,"rows":40}
//! {"type":"ssh_disconnect","sessionId":"..."}
//! {"type":"container_action","hostId":1,"containerId":"web","action":"restart"}
//! {"type":"ping"}
//! ```

use serde::{Deserialize, Serialize};

use crate::container::ContainerAction;
use crate::error::ErrorCode;
use crate::monitor::MonitoringSnapshot;
use crate::router::{ClientId, Topic, TopicKind};
use crate::session::SessionId;
use crate::ssh::HostId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    SubscribeMonitoring {
        host_id: HostId,
        kind: TopicKind,
        #[serde(default)]
        container_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UnsubscribeMonitoring {
        host_id: HostId,
        kind: TopicKind,
        #[serde(default)]
        container_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SshConnect {
        host_id: HostId,
    },
    #[serde(rename_all = "camelCase")]
    SshCommand {
        session_id: SessionId,
        command: String,
    },
    #[serde(rename_all = "camelCase")]
    SshResize {
        session_id: SessionId,
        cols: u32,
        rows: u32,
    },
    #[serde(rename_all = "camelCase")]
    SshDisconnect {
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    ContainerAction {
        host_id: HostId,
        container_id: String,
        action: ContainerAction,
    },
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::SubscribeMonitoring { .. } => "subscribe_monitoring",
            ClientMessage::UnsubscribeMonitoring { .. } => "unsubscribe_monitoring",
            ClientMessage::SshConnect { .. } => "ssh_connect",
            ClientMessage::SshCommand { .. } => "ssh_command",
            ClientMessage::SshResize { .. } => "ssh_resize",
            ClientMessage::SshDisconnect { .. } => "ssh_disconnect",
            ClientMessage::ContainerAction { .. } => "container_action",
            ClientMessage::Ping => "ping",
        }
    }

    /// Requests whose handling waits on a handshake or a remote command
    pub fn waits_on_host(&self) -> bool {
        matches!(
            self,
            ClientMessage::SshConnect { .. } | ClientMessage::ContainerAction { .. }
        )
    }
}

/// Topic named by a (un)subscribe message
pub fn topic_of(host_id: HostId, kind: TopicKind, container_id: Option<String>) -> Topic {
    Topic {
        host_id,
        kind,
        container_id: container_id.filter(|id| !id.is_empty()),
    }
    .normalized()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    AuthOk {
        client_id: ClientId,
        user: String,
    },
    #[serde(rename_all = "camelCase")]
    MonitoringUpdate {
        host_id: HostId,
        #[serde(skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
        snapshot: MonitoringSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    SshOutput {
        session_id: SessionId,
        chunk: String,
        seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    SshConnected {
        session_id: SessionId,
        host_id: HostId,
    },
    #[serde(rename_all = "camelCase")]
    SshDisconnected {
        session_id: SessionId,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    ContainerUpdated {
        host_id: HostId,
        container_id: String,
        action: ContainerAction,
        success: bool,
        message: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    pub fn monitoring(snapshot: MonitoringSnapshot) -> Self {
        ServerEvent::MonitoringUpdate {
            host_id: snapshot.host_id,
            container_id: snapshot.container_id.clone(),
            snapshot,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
