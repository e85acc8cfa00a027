//! Subscription routing
//!
//! Maps gateway clients to the topics they want pushed. The gateway asks
//! `matching_clients` for every produced event; the monitoring aggregator
//! asks `interested_hosts` before spending a poll on containers nobody
//! watches.

mod subscriptions;
mod types;

pub use subscriptions::SubscriptionRegistry;
pub use types::{ClientId, Topic, TopicKind};
