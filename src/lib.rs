//! ovpn-pilot - Supervisor for an OpenVPN daemon driven over its management interface
//!
//! This crate launches `openvpn` with a connection profile, feeds it
//! credentials over the loopback management protocol, waits for the tunnel
//! to come up and can tear the daemon down again.
//!
//! # Architecture
//!
//! - `management`: Control channel, wire codec, retry loop and the `Session` state machine
//! - `launcher`: Building and spawning the daemon command line
//! - `platform`: Elevation checks (Unix, Windows)
//! - `profile`: Port-priority selection among a server's `.ovpn` files
//! - `credential`: Account credentials with optional expiry
//! - `config`: Configuration file handling (TOML)
//!
//! # Usage
//!
//! ```bash
//! ovpn-pilot connect ~/.openvpn/configs/us-east -u tcpvpn.com-abc --watch
//! ovpn-pilot status --json
//! ovpn-pilot kill
//! ```

pub mod config;
pub mod credential;
pub mod launcher;
pub mod management;
pub mod platform;
pub mod profile;

pub use config::Config;
pub use credential::Credential;
pub use launcher::{DaemonLauncher, Launcher};
pub use management::{Session, SessionError, StatsRecord, StatusRecord};
