//! The linkhub routing hub.
//!
//! Links connect over WebSocket, identify with the shared secret, and then
//! exchange [`Package`](linkhub_core::Package)s addressed by nid or by link
//! type. See [`Hub`].

mod config;
mod hub;
mod registry;

pub use config::{ConfigError, HubConfig};
pub use hub::Hub;
pub use registry::{ConnectedClient, Registry, RegistryError};
