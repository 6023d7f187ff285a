//! Supervised daemon session
//!
//! A [`Session`] launches the daemon, talks to it over the management
//! channel and decides when the tunnel is up:
//!
//! 1. Launch the daemon and wait the settle interval
//! 2. Connect to the management endpoint and require a greeting
//! 3. Submit credentials, if any
//! 4. Poll `state` until `CONNECTED`, scanning `log 2` for an auth rejection
//!    after every poll that is not yet connected
//! 5. On rejection, exhaustion, or cancellation: `stop()` the daemon
//!
//! # Error Handling
//!
//! Socket failures never escape as panics; they leave the session
//! disconnected and come back as a [`SessionError`]. Commands sent while
//! disconnected are dropped.

use crate::credential::Credential;
use crate::launcher::{DaemonLauncher, LaunchError, LaunchSpec, Launcher};
use crate::management::codec::{
    AUTH_FAILURE_MARKER, Command, Line, StatsRecord, StatusRecord, parse_state, parse_stats,
};
use crate::management::retry::{Pause, Retry, RetryOutcome, ThreadPause};
use crate::management::transport::{ChannelTimeouts, ControlChannel, Drain, TransportError};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Timed out while connecting to the management interface")]
    SocketTimeout,
    #[error("Management interface refused the connection")]
    ConnectionRefused,
    #[error("Management interface unavailable: {0}")]
    Transport(TransportError),
    #[error("Daemon never answered on the management interface")]
    NoHandshakeResponse,
    #[error("Wrong credentials")]
    AuthenticationFailed,
    #[error("Timed out connecting to the VPN server")]
    ConnectTimeout,
    #[error("Management interface closed while waiting for the connection")]
    ChannelClosed,
    #[error("Daemon did not acknowledge termination")]
    TerminationAcknowledgeMissing,
    #[error("Interrupted before the connection was established")]
    Cancelled,
    #[error("No connection profile configured for this session")]
    MissingProfile,
    #[error("Failed to launch daemon: {0}")]
    Launch(#[from] LaunchError),
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(_) => SessionError::SocketTimeout,
            TransportError::Refused(_) => SessionError::ConnectionRefused,
            other => SessionError::Transport(other),
        }
    }
}

impl SessionError {
    /// Failures worth retrying later with the same profile
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::SocketTimeout
                | SessionError::ConnectionRefused
                | SessionError::Transport(_)
        )
    }
}

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    ConnectingSocket,
    Authenticating,
    PollingConnected,
    Connected,
    /// Management endpoint unreachable or silent after launch
    Unreachable,
    AuthFailed,
    TimedOut,
    Cancelled,
    /// Daemon acknowledged `signal SIGTERM`; follows any failure phase
    /// whose cleanup `stop()` succeeded
    Terminated,
}

/// Knobs for one session; see [`crate::Config`] for the file form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub timeouts: ChannelTimeouts,
    /// Wait between launching the daemon and the first connect
    pub settle: Duration,
    /// `state` polls before giving up, and the pause between them
    pub connect_retry: Retry,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7505,
            timeouts: ChannelTimeouts::default(),
            settle: Duration::from_secs(1),
            connect_retry: Retry::new(30, Duration::from_secs(1)),
        }
    }
}

enum PollVerdict {
    Connected,
    Rejected,
    ChannelLost,
}

/// One supervised daemon and its management channel
pub struct Session<L = DaemonLauncher, P = ThreadPause> {
    profile: Option<PathBuf>,
    credential: Option<Credential>,
    settings: SessionSettings,
    channel: Option<ControlChannel>,
    phase: Phase,
    launcher: L,
    pause: P,
}

impl<L: Launcher, P: Pause + Clone> Session<L, P> {
    pub fn new(settings: SessionSettings, launcher: L, pause: P) -> Self {
        Self {
            profile: None,
            credential: None,
            settings,
            channel: None,
            phase: Phase::Created,
            launcher,
            pause,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<PathBuf>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn profile(&self) -> Option<&Path> {
        self.profile.as_deref()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True while the management channel is open
    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Open a fresh management channel, replacing any previous one
    pub fn connect(&mut self) -> Result<(), SessionError> {
        let SessionSettings {
            ref host,
            port,
            ref timeouts,
            ..
        } = self.settings;

        match ControlChannel::connect(host, port, timeouts) {
            Ok(channel) => {
                debug!("Connected to management interface at {}", channel.peer());
                self.channel = Some(channel);
                Ok(())
            }
            Err(e) => {
                match e {
                    TransportError::Timeout(_) => {
                        warn!("Timed out while trying to connect to management: {}", e)
                    }
                    _ => error!("Can't connect to management: {}", e),
                }
                self.channel = None;
                Err(e.into())
            }
        }
    }

    /// Say goodbye to the management interface, leaving the daemon running
    pub fn disconnect(&mut self) {
        self.send(&Command::Quit);
        if let Some(channel) = self.channel.take() {
            channel.shutdown();
        }
    }

    /// Write one command; silently skipped while disconnected
    pub fn send(&mut self, command: &Command) {
        let Some(channel) = self.channel.as_mut() else {
            debug!("Not connected, dropping command: {}", command.redacted());
            return;
        };
        debug!("-> {}", command.redacted());
        if let Err(e) = channel.send_line(&command.to_string()) {
            warn!("Failed to send '{}': {}", command.redacted(), e);
            if let Some(channel) = self.channel.take() {
                channel.shutdown();
            }
        }
    }

    /// Lines available right now, ending after one quiet poll window
    pub fn receive_lines(&mut self) -> Drain<'_> {
        Drain::new(&mut self.channel)
    }

    pub fn send_receive(&mut self, command: &Command) -> Drain<'_> {
        self.send(command);
        self.receive_lines()
    }

    /// Launch the daemon and wait until it reports `CONNECTED`
    pub fn start(&mut self) -> Result<(), SessionError> {
        let profile = self.profile.clone().ok_or(SessionError::MissingProfile)?;
        let spec = LaunchSpec {
            profile,
            management_host: self.settings.host.clone(),
            management_port: self.settings.port,
            query_passwords: self.credential.is_some(),
        };
        self.launcher.launch(&spec)?;

        if self.pause.pause(self.settings.settle).is_err() {
            return self.abandon_launch();
        }

        self.phase = Phase::ConnectingSocket;
        if let Err(e) = self.connect() {
            self.phase = Phase::Unreachable;
            return Err(e);
        }
        if self.receive_lines().count() == 0 {
            error!("Daemon did not greet on the management interface");
            if let Some(channel) = self.channel.take() {
                channel.shutdown();
            }
            self.phase = Phase::Unreachable;
            return Err(SessionError::NoHandshakeResponse);
        }

        if let Some(credential) = self.credential.clone() {
            self.phase = Phase::Authenticating;
            // rejections only show up later in the log
            self.send_receive(&Command::username(credential.username))
                .for_each(drop);
            self.send_receive(&Command::password(credential.password))
                .for_each(drop);
        }
        info!("OpenVPN started, waiting for the tunnel");

        self.phase = Phase::PollingConnected;
        let pause = self.pause.clone();
        let retry = self.settings.connect_retry;
        match retry.run(&pause, |attempt| self.poll_connected(attempt)) {
            RetryOutcome::Done(PollVerdict::Connected) => {
                info!("Connected to server");
                self.phase = Phase::Connected;
                Ok(())
            }
            RetryOutcome::Done(PollVerdict::Rejected) => {
                error!("Server rejected the credentials");
                self.phase = Phase::AuthFailed;
                self.stop_after_failure();
                Err(SessionError::AuthenticationFailed)
            }
            RetryOutcome::Done(PollVerdict::ChannelLost) => {
                error!("Management interface went away before the tunnel came up");
                self.phase = Phase::Unreachable;
                Err(SessionError::ChannelClosed)
            }
            RetryOutcome::Exhausted => {
                error!(
                    "Timed out while connecting to server after {} polls",
                    retry.attempts
                );
                self.phase = Phase::TimedOut;
                self.stop_after_failure();
                Err(SessionError::ConnectTimeout)
            }
            RetryOutcome::Cancelled => {
                warn!("Interrupted while connecting, stopping daemon");
                self.phase = Phase::Cancelled;
                self.stop_after_failure();
                Err(SessionError::Cancelled)
            }
        }
    }

    fn poll_connected(&mut self, attempt: u32) -> ControlFlow<PollVerdict> {
        if !self.is_connected() {
            return ControlFlow::Break(PollVerdict::ChannelLost);
        }
        let Some(status) = self.get_state() else {
            debug!("Attempt {}: no state reply", attempt);
            return ControlFlow::Continue(());
        };
        if status.is_connected() {
            return ControlFlow::Break(PollVerdict::Connected);
        }
        debug!("Attempt {}: daemon is {}", attempt, status.connected);
        if self.credentials_rejected() {
            return ControlFlow::Break(PollVerdict::Rejected);
        }
        ControlFlow::Continue(())
    }

    fn credentials_rejected(&mut self) -> bool {
        self.send_receive(&Command::Log(2))
            .fold(false, |hit, line| hit || line.contains(AUTH_FAILURE_MARKER))
    }

    /// Cancelled during the settle wait: the daemon may be coming up, so
    /// reach it if possible and shut it down rather than orphan it.
    fn abandon_launch(&mut self) -> Result<(), SessionError> {
        warn!("Interrupted after launch, stopping daemon");
        self.phase = Phase::Cancelled;
        if self.connect().is_ok() {
            self.receive_lines().for_each(drop);
            self.stop_after_failure();
        } else {
            warn!("Daemon unreachable; it may need to be stopped by hand");
        }
        Err(SessionError::Cancelled)
    }

    fn stop_after_failure(&mut self) {
        // outcome already logged by stop()
        let _ = self.stop();
    }

    /// Ask the daemon to terminate. Not fatal if it does not acknowledge;
    /// it may already be gone.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let acknowledged = self
            .send_receive(&Command::Terminate)
            .fold(false, |ack, line| ack || Line::parse(&line).is_success());

        if acknowledged {
            info!("OpenVPN terminated");
            self.phase = Phase::Terminated;
            Ok(())
        } else {
            warn!("Failed to terminate OpenVPN: no acknowledgement");
            Err(SessionError::TerminationAcknowledgeMissing)
        }
    }

    /// `stop()` when connected, `start()` otherwise
    ///
    /// A new session is not connected, so toggling it always launches a
    /// daemon. To reach one that is already running, call [`Session::connect`]
    /// first; `toggle()` then stops it.
    pub fn toggle(&mut self) -> Result<(), SessionError> {
        if self.is_connected() {
            self.stop()
        } else {
            self.start()
        }
    }

    /// Current connection status, or `None` if nothing answered in time
    pub fn get_state(&mut self) -> Option<StatusRecord> {
        self.query(&Command::State, |text| Some(parse_state(text)))
    }

    /// Traffic counters, or `None` if nothing answered in time
    pub fn get_stats(&mut self) -> Option<StatsRecord> {
        self.query(&Command::LoadStats, |text| match parse_stats(text) {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!("Ignoring reply '{}': {}", text, e);
                None
            }
        })
    }

    /// Send `command` and parse the first reply line `parse` accepts. The
    /// whole reply is drained so nothing stale leaks into the next query.
    fn query<T>(&mut self, command: &Command, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let mut found = None;
        for raw in self.send_receive(command) {
            if found.is_some() {
                continue;
            }
            match Line::parse(&raw) {
                Line::Reply(text) => found = parse(&text),
                Line::Push(text) => debug!("Push during {}: {}", command.redacted(), text),
                Line::End => {}
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::management::retry::NoPause;
    use std::cell::RefCell;
    use std::net::TcpListener;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct FakeLauncher {
        launches: Rc<RefCell<Vec<LaunchSpec>>>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, spec: &LaunchSpec) -> Result<(), LaunchError> {
            self.launches.borrow_mut().push(spec.clone());
            Ok(())
        }
    }

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn settings(port: u16) -> SessionSettings {
        SessionSettings {
            port,
            settle: Duration::ZERO,
            connect_retry: Retry::new(3, Duration::ZERO),
            ..SessionSettings::default()
        }
    }

    #[test]
    fn test_session_error_display() {
        assert_eq!(
            SessionError::AuthenticationFailed.to_string(),
            "Wrong credentials"
        );
        assert!(SessionError::ConnectTimeout.to_string().contains("Timed out"));
    }

    #[test]
    fn test_transport_errors_map_to_taxonomy() {
        let err: SessionError = TransportError::Refused("x".into()).into();
        assert!(matches!(err, SessionError::ConnectionRefused));
        assert!(err.is_recoverable());

        let err: SessionError = TransportError::Timeout("x".into()).into();
        assert!(matches!(err, SessionError::SocketTimeout));

        assert!(!SessionError::AuthenticationFailed.is_recoverable());
        assert!(!SessionError::ConnectTimeout.is_recoverable());
    }

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.port, 7505);
        assert_eq!(settings.connect_retry.attempts, 30);
        assert_eq!(settings.settle, Duration::from_secs(1));
    }

    #[test]
    fn test_new_session_is_disconnected() {
        let session = Session::new(settings(7505), FakeLauncher::default(), NoPause);
        assert!(!session.is_connected());
        assert_eq!(session.phase(), Phase::Created);
        assert!(session.profile().is_none());
    }

    #[test]
    fn test_start_without_profile() {
        let launcher = FakeLauncher::default();
        let mut session = Session::new(settings(closed_port()), launcher.clone(), NoPause);

        assert!(matches!(session.start(), Err(SessionError::MissingProfile)));
        assert!(launcher.launches.borrow().is_empty());
    }

    #[test]
    fn test_start_unreachable_management() {
        let launcher = FakeLauncher::default();
        let mut session = Session::new(settings(closed_port()), launcher.clone(), NoPause)
            .with_profile("/tmp/server-443.ovpn")
            .with_credential(Credential::new("alice", "pw"));

        let err = session.start().unwrap_err();
        assert!(err.is_recoverable());
        assert!(!session.is_connected());
        assert_eq!(session.phase(), Phase::Unreachable);

        let launches = launcher.launches.borrow();
        assert_eq!(launches.len(), 1);
        assert!(launches[0].query_passwords);
    }

    #[test]
    fn test_disconnected_queries_are_quiet() {
        let mut session = Session::new(settings(closed_port()), FakeLauncher::default(), NoPause);
        session.send(&Command::State);
        assert!(session.get_state().is_none());
        assert!(session.get_stats().is_none());
        assert!(matches!(
            session.stop(),
            Err(SessionError::TerminationAcknowledgeMissing)
        ));
        session.disconnect();
        assert!(!session.is_connected());
    }
}
