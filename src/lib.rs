//! Built-in SSH server for a self-hosted Git service.
//!
//! Clients authenticate with a public key registered in the application,
//! may only run Git commands, and every command is executed by re-running
//! this binary as `serv key-<id> --config=<path>` with the client's stdio
//! bridged over the SSH channel.

pub mod auth;
pub mod codec;
pub mod command;
pub mod config;
pub mod host_keys;
pub mod registry;
pub mod serv;
pub mod server;
pub mod session;

pub use auth::{Authenticator, KeyId, KeyRegistry};
pub use config::Settings;
pub use server::SshServer;
