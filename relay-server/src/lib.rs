//! Relay Server
//!
//! Central relay for the chat service:
//! - Account registration and login through an [`auth::Authenticator`]
//! - Directory of logged-in identities with presence broadcasts
//! - Relaying of `text` and `signal` messages between peers

pub mod auth;
pub mod config;
pub mod server;

pub use auth::{AuthError, Authenticator, CredentialStore};
pub use config::{ConfigError, ServerConfig};
pub use server::{RelayServer, ServerHandle};
