//! Real-time gateway
//!
//! - `protocol`: tagged JSON messages in both directions
//! - `auth`: first-frame token authentication
//! - `Gateway`: client registry, message routing and event fan-out
//! - `GatewayServer`: the WebSocket listener feeding the gateway

pub mod auth;
mod gateway;
pub mod protocol;
mod server;

pub use auth::{AuthError, Authenticator, Identity, StaticTokenAuthenticator};
pub use gateway::{ClientConnection, Gateway, GatewayConfig, GatewayError, CLOSED_BY_CLIENT};
pub use protocol::{ClientMessage, ServerEvent};
pub use server::{DisconnectReason, GatewayServer};
