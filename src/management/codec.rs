//! Management protocol text codec
//!
//! Outbound commands are single text lines. Inbound lines are one of:
//!
//! | Prefix | Meaning |
//! |--------|---------|
//! | `>` | Asynchronous push (`>INFO:`, `>PASSWORD:`, `>LOG:`...) |
//! | `END` | Terminates a multi-line reply |
//! | anything else | Reply line (`SUCCESS: ...`, `ERROR: ...`, data rows) |
//!
//! `state` answers with a comma-separated row such as
//! `1700000000,CONNECTED,SUCCESS,10.8.0.6,203.0.113.7,1194,,` and
//! `load-stats` with `SUCCESS: nclients=0,bytesin=1234,bytesout=5678`.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Substring the daemon logs when the server rejects the supplied credentials
pub const AUTH_FAILURE_MARKER: &str = "Verification Failed: 'Auth'";

/// Credential realm the daemon asks for with `--management-query-passwords`
pub const AUTH_REALM: &str = "Auth";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Missing field in stats reply: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Commands the supervisor sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Close this management session, leaving the daemon running
    Quit,
    /// Ask the daemon to shut down
    Terminate,
    State,
    LoadStats,
    /// Recent log history, `n` lines
    Log(u32),
    Username { realm: String, value: String },
    Password { realm: String, value: String },
}

impl Command {
    pub fn username(value: impl Into<String>) -> Self {
        Command::Username {
            realm: AUTH_REALM.to_string(),
            value: value.into(),
        }
    }

    pub fn password(value: impl Into<String>) -> Self {
        Command::Password {
            realm: AUTH_REALM.to_string(),
            value: value.into(),
        }
    }

    /// Wire text with secrets masked, for log output
    pub fn redacted(&self) -> String {
        match self {
            Command::Password { realm, .. } => format!("password {} ********", realm),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Quit => write!(f, "quit"),
            Command::Terminate => write!(f, "signal SIGTERM"),
            Command::State => write!(f, "state"),
            Command::LoadStats => write!(f, "load-stats"),
            Command::Log(n) => write!(f, "log {}", n),
            Command::Username { realm, value } => write!(f, "username {} {}", realm, value),
            Command::Password { realm, value } => write!(f, "password {} {}", realm, value),
        }
    }
}

/// One classified inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Asynchronous notification, prefix stripped
    Push(String),
    /// End of a multi-line reply
    End,
    Reply(String),
}

impl Line {
    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix('>') {
            Line::Push(rest.to_string())
        } else if raw.starts_with("END") {
            Line::End
        } else {
            Line::Reply(raw.to_string())
        }
    }

    /// Reply lines that acknowledge a command
    pub fn is_success(&self) -> bool {
        matches!(self, Line::Reply(text) if text.starts_with("SUCCESS"))
    }
}

/// Connection state names reported in the second `state` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
    Connecting,
    Wait,
    Auth,
    GetConfig,
    AssignIp,
    AddRoutes,
    Connected,
    Reconnecting,
    Exiting,
    Resolve,
    TcpConnect,
    Other(String),
}

impl From<&str> for DaemonState {
    fn from(name: &str) -> Self {
        match name {
            "CONNECTING" => DaemonState::Connecting,
            "WAIT" => DaemonState::Wait,
            "AUTH" => DaemonState::Auth,
            "GET_CONFIG" => DaemonState::GetConfig,
            "ASSIGN_IP" => DaemonState::AssignIp,
            "ADD_ROUTES" => DaemonState::AddRoutes,
            "CONNECTED" => DaemonState::Connected,
            "RECONNECTING" => DaemonState::Reconnecting,
            "EXITING" => DaemonState::Exiting,
            "RESOLVE" => DaemonState::Resolve,
            "TCP_CONNECT" => DaemonState::TcpConnect,
            other => DaemonState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonState::Connecting => "CONNECTING",
            DaemonState::Wait => "WAIT",
            DaemonState::Auth => "AUTH",
            DaemonState::GetConfig => "GET_CONFIG",
            DaemonState::AssignIp => "ASSIGN_IP",
            DaemonState::AddRoutes => "ADD_ROUTES",
            DaemonState::Connected => "CONNECTED",
            DaemonState::Reconnecting => "RECONNECTING",
            DaemonState::Exiting => "EXITING",
            DaemonState::Resolve => "RESOLVE",
            DaemonState::TcpConnect => "TCP_CONNECT",
            DaemonState::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// Parsed `state` reply
///
/// Fields missing from a short row are left empty; fields past the fifth
/// are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub up_since: String,
    pub connected: String,
    pub success: String,
    pub local_ip: String,
    pub remote_ip: String,
}

impl StatusRecord {
    pub fn state(&self) -> DaemonState {
        DaemonState::from(self.connected.as_str())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == DaemonState::Connected
    }
}

/// Parsed `load-stats` reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsRecord {
    #[serde(rename = "bytesin")]
    pub bytes_in: u64,
    #[serde(rename = "bytesout")]
    pub bytes_out: u64,
}

pub fn parse_state(line: &str) -> StatusRecord {
    let mut fields = line.split(',');
    let mut next = || fields.next().unwrap_or_default().to_string();
    StatusRecord {
        up_since: next(),
        connected: next(),
        success: next(),
        local_ip: next(),
        remote_ip: next(),
    }
}

pub fn parse_stats(line: &str) -> Result<StatsRecord, CodecError> {
    let mut bytes_in = None;
    let mut bytes_out = None;

    for field in line.split(',') {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key.trim() {
            "bytesin" => bytes_in = Some(parse_counter("bytesin", value)?),
            "bytesout" => bytes_out = Some(parse_counter("bytesout", value)?),
            _ => {}
        }
    }

    Ok(StatsRecord {
        bytes_in: bytes_in.ok_or(CodecError::MissingField("bytesin"))?,
        bytes_out: bytes_out.ok_or(CodecError::MissingField("bytesout"))?,
    })
}

fn parse_counter(field: &'static str, value: &str) -> Result<u64, CodecError> {
    let value = value.trim();
    value.parse().map_err(|_| CodecError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_command_wire_text() {
        assert_eq!(Command::Quit.to_string(), "quit");
        assert_eq!(Command::Terminate.to_string(), "signal SIGTERM");
        assert_eq!(Command::State.to_string(), "state");
        assert_eq!(Command::LoadStats.to_string(), "load-stats");
        assert_eq!(Command::Log(2).to_string(), "log 2");
        assert_eq!(Command::username("alice").to_string(), "username Auth alice");
        assert_eq!(Command::password("s3cret").to_string(), "password Auth s3cret");
    }

    #[test]
    fn test_redacted_hides_password_only() {
        let redacted = Command::password("s3cret").redacted();
        assert!(!redacted.contains("s3cret"));
        assert!(redacted.starts_with("password Auth"));

        assert_eq!(Command::username("alice").redacted(), "username Auth alice");
    }

    #[test]
    fn test_line_classification() {
        assert_eq!(
            Line::parse(">INFO:OpenVPN Management Interface Version 5"),
            Line::Push("INFO:OpenVPN Management Interface Version 5".to_string())
        );
        assert_eq!(Line::parse("END"), Line::End);
        assert_eq!(
            Line::parse("1700000000,CONNECTED,SUCCESS,10.8.0.6,203.0.113.7"),
            Line::Reply("1700000000,CONNECTED,SUCCESS,10.8.0.6,203.0.113.7".to_string())
        );
    }

    #[test]
    fn test_success_acknowledgement() {
        assert!(Line::parse("SUCCESS: signal SIGTERM thrown").is_success());
        assert!(!Line::parse("ERROR: unknown command").is_success());
        assert!(!Line::parse(">SUCCESS: pushed").is_success());
        assert!(!Line::End.is_success());
    }

    #[test]
    fn test_parse_state_full_row() {
        let record = parse_state("1700000000,CONNECTED,SUCCESS,10.8.0.6,203.0.113.7,1194,,");
        assert_eq!(record.up_since, "1700000000");
        assert_eq!(record.connected, "CONNECTED");
        assert_eq!(record.success, "SUCCESS");
        assert_eq!(record.local_ip, "10.8.0.6");
        assert_eq!(record.remote_ip, "203.0.113.7");
        assert!(record.is_connected());
    }

    #[test]
    fn test_parse_state_short_row() {
        let record = parse_state("1700000000,CONNECTING");
        assert_eq!(record.connected, "CONNECTING");
        assert!(record.success.is_empty());
        assert!(record.remote_ip.is_empty());
        assert_eq!(record.state(), DaemonState::Connecting);
    }

    #[test]
    fn test_daemon_state_names() {
        assert_eq!(DaemonState::from("RECONNECTING"), DaemonState::Reconnecting);
        assert_eq!(DaemonState::from("GET_CONFIG"), DaemonState::GetConfig);
        assert_eq!(
            DaemonState::from("SOMETHING_NEW"),
            DaemonState::Other("SOMETHING_NEW".to_string())
        );
        assert_eq!(DaemonState::AssignIp.to_string(), "ASSIGN_IP");
        assert_eq!(DaemonState::Other("X".to_string()).to_string(), "X");
    }

    #[test]
    fn test_parse_stats_canonical_reply() {
        let stats = parse_stats("SUCCESS: nclients=0,bytesin=123456,bytesout=7890").unwrap();
        assert_eq!(stats.bytes_in, 123456);
        assert_eq!(stats.bytes_out, 7890);
    }

    #[test]
    fn test_parse_stats_errors() {
        assert_eq!(
            parse_stats("SUCCESS: nclients=0,bytesin=12"),
            Err(CodecError::MissingField("bytesout"))
        );
        assert_eq!(
            parse_stats("SUCCESS: nclients=0,bytesin=lots,bytesout=1"),
            Err(CodecError::InvalidNumber {
                field: "bytesin",
                value: "lots".to_string()
            })
        );
        assert!(parse_stats("ERROR: unknown command").is_err());
    }

    #[test]
    fn test_stats_json_keeps_wire_names() {
        let stats = StatsRecord {
            bytes_in: 1,
            bytes_out: 2,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, r#"{"bytesin":1,"bytesout":2}"#);
    }

    proptest! {
        #[test]
        fn prop_parse_state_keeps_field_order(
            up_since in "[0-9]{1,10}",
            connected in "[A-Z_]{1,12}",
            success in "[A-Z]{0,8}",
            local_ip in "[0-9.]{0,15}",
            remote_ip in "[0-9.]{0,15}",
        ) {
            let line = format!("{},{},{},{},{}", up_since, connected, success, local_ip, remote_ip);
            let record = parse_state(&line);
            prop_assert_eq!(record.up_since, up_since);
            prop_assert_eq!(record.connected, connected);
            prop_assert_eq!(record.success, success);
            prop_assert_eq!(record.local_ip, local_ip);
            prop_assert_eq!(record.remote_ip, remote_ip);
        }

        #[test]
        fn prop_parse_stats_reads_counters(bytes_in: u64, bytes_out: u64, clients in 0u32..100) {
            let line = format!("SUCCESS: nclients={},bytesin={},bytesout={}", clients, bytes_in, bytes_out);
            let stats = parse_stats(&line).unwrap();
            prop_assert_eq!(stats, StatsRecord { bytes_in, bytes_out });
        }
    }
}
