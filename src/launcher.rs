//! Starting the OpenVPN daemon
//!
//! The daemon is started detached (`--daemon`) with its management interface
//! bound to the session's endpoint. The launcher does not wait for it to
//! become ready; the session's handshake on the management socket does that.
//!
//! # Command line
//!
//! ```text
//! [sudo] openvpn --management 127.0.0.1 7505 --config <profile> --daemon \
//!     [--management-query-passwords]
//! ```

use crate::platform;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Connection profile not found: {0}")]
    MissingProfile(PathBuf),
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// What to start and where its management interface should listen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub profile: PathBuf,
    pub management_host: String,
    pub management_port: u16,
    /// Ask for credentials over the management channel instead of the profile
    pub query_passwords: bool,
}

/// Starts a daemon for a session
pub trait Launcher {
    fn launch(&self, spec: &LaunchSpec) -> Result<(), LaunchError>;
}

/// When to prefix the daemon command with `sudo`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    /// Only when the current process is not already elevated
    #[default]
    Auto,
    Sudo,
    Never,
}

/// Launches the real `openvpn` binary
#[derive(Debug, Clone)]
pub struct DaemonLauncher {
    binary: String,
    elevation: Elevation,
    working_dir: Option<PathBuf>,
}

impl Default for DaemonLauncher {
    fn default() -> Self {
        Self::new("openvpn", Elevation::Auto)
    }
}

impl DaemonLauncher {
    pub fn new(binary: impl Into<String>, elevation: Elevation) -> Self {
        Self {
            binary: binary.into(),
            elevation,
            working_dir: None,
        }
    }

    /// Run the daemon from `dir`, so relative paths inside profiles resolve
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Daemon arguments, without any elevation prefix
    pub fn daemon_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "--management".to_string(),
            spec.management_host.clone(),
            spec.management_port.to_string(),
            "--config".to_string(),
            spec.profile.to_string_lossy().into_owned(),
            "--daemon".to_string(),
        ];
        if spec.query_passwords {
            args.push("--management-query-passwords".to_string());
        }
        args
    }

    fn needs_elevation(&self) -> bool {
        match self.elevation {
            Elevation::Auto => !platform::is_elevated(),
            Elevation::Sudo => true,
            Elevation::Never => false,
        }
    }

    /// Program and full argument list that will be executed
    pub fn command_line(&self, spec: &LaunchSpec) -> (String, Vec<String>) {
        let args = Self::daemon_args(spec);
        if self.needs_elevation() {
            let mut sudo_args = Vec::with_capacity(args.len() + 1);
            sudo_args.push(self.binary.clone());
            sudo_args.extend(args);
            ("sudo".to_string(), sudo_args)
        } else {
            (self.binary.clone(), args)
        }
    }
}

impl Launcher for DaemonLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<(), LaunchError> {
        if !spec.profile.is_file() {
            return Err(LaunchError::MissingProfile(spec.profile.clone()));
        }

        let (program, args) = self.command_line(spec);
        info!("Launching: {} {}", program, args.join(" "));

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;
        debug!("Spawned {} (pid {})", program, child.id());

        reap_in_background(child, program);
        Ok(())
    }
}

/// Wait for the launcher process off-thread so it never lingers as a zombie.
/// With `--daemon` it exits as soon as the daemon has forked.
fn reap_in_background(mut child: Child, program: String) {
    let mut stderr = child.stderr.take();
    let spawned = thread::Builder::new()
        .name("daemon-reaper".to_string())
        .spawn(move || {
            let mut output = String::new();
            if let Some(ref mut pipe) = stderr {
                if let Err(e) = pipe.read_to_string(&mut output) {
                    debug!("Could not read {} stderr: {}", program, e);
                }
            }
            match child.wait() {
                Ok(status) if status.success() => debug!("{} exited: {}", program, status),
                Ok(status) => warn!("{} exited with {}: {}", program, status, output.trim()),
                Err(e) => warn!("Failed to wait for {}: {}", program, e),
            }
        });

    if let Err(e) = spawned {
        warn!("Could not start reaper thread: {}", e);
    }
}
