//! Subscription topic types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ssh::HostId;

/// Opaque id of one gateway client connection
pub type ClientId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopicKind {
    HostMetrics,
    ContainerMetrics,
    Terminal,
}

impl TopicKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::HostMetrics => "host-metrics",
            TopicKind::ContainerMetrics => "container-metrics",
            TopicKind::Terminal => "terminal",
        }
    }
}

/// What a client wants pushed, or what an event is about.
///
/// As a subscription, `container_id: None` on a container-metrics topic
/// matches every container of the host. Only container-metrics topics carry
/// a container id; the constructors and `normalized` enforce that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub host_id: HostId,
    pub kind: TopicKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl Topic {
    pub fn host_metrics(host_id: HostId) -> Self {
        Self {
            host_id,
            kind: TopicKind::HostMetrics,
            container_id: None,
        }
    }

    pub fn container_metrics(host_id: HostId, container_id: Option<String>) -> Self {
        Self {
            host_id,
            kind: TopicKind::ContainerMetrics,
            container_id,
        }
    }

    pub fn terminal(host_id: HostId) -> Self {
        Self {
            host_id,
            kind: TopicKind::Terminal,
            container_id: None,
        }
    }

    pub fn normalized(mut self) -> Self {
        if self.kind != TopicKind::ContainerMetrics {
            self.container_id = None;
        }
        self
    }

    /// Does this subscription receive `event`?
    pub fn matches(&self, event: &Topic) -> bool {
        self.host_id == event.host_id
            && self.kind == event.kind
            && match &self.container_id {
                None => true,
                Some(id) => event.container_id.as_deref() == Some(id.as_str()),
            }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container_id {
            Some(id) => write!(f, "{}/{}/{}", self.host_id, self.kind.as_str(), id),
            None => write!(f, "{}/{}", self.host_id, self.kind.as_str()),
        }
    }
}
