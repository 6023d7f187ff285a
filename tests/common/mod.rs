//! In-process stand-in for the OpenVPN management interface

#![allow(dead_code)]

use ovpn_pilot::launcher::{LaunchError, LaunchSpec, Launcher};
use ovpn_pilot::management::{ChannelTimeouts, Retry, SessionSettings};
use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const GREETING: &str =
    ">INFO:OpenVPN Management Interface Version 5 -- type 'help' for more info";

/// How the fake daemon answers
#[derive(Debug, Clone)]
pub struct Script {
    /// Send the `>INFO:` banner on connect
    pub greet: bool,
    /// Answers to successive `state` queries; the last one repeats
    pub states: Vec<&'static str>,
    /// Include the auth rejection in `log 2` output
    pub reject_auth: bool,
    /// Answer `signal SIGTERM` with `SUCCESS`
    pub ack_terminate: bool,
    pub bytes: (u64, u64),
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greet: true,
            states: vec!["CONNECTED"],
            reject_auth: false,
            ack_terminate: true,
            bytes: (1234, 5678),
        }
    }
}

/// Listens on an ephemeral loopback port and records every command it reads
pub struct FakeDaemon {
    port: u16,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeDaemon {
    pub fn spawn(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));

        let recorded = commands.clone();
        thread::spawn(move || {
            let mut state_polls = 0usize;
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                serve(stream, &script, &recorded, &mut state_polls);
            }
        });

        Self { port, commands }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == command).count()
    }
}

fn serve(
    stream: TcpStream,
    script: &Script,
    recorded: &Mutex<Vec<String>>,
    state_polls: &mut usize,
) {
    let mut writer = stream.try_clone().unwrap();
    let reader = BufReader::new(stream);

    if script.greet {
        let _ = write!(writer, "{}\r\n", GREETING);
    }

    for line in reader.lines() {
        let Ok(line) = line else { return };
        let command = line.trim().to_string();
        recorded.lock().unwrap().push(command.clone());

        let reply = match command.as_str() {
            "state" => {
                let index = (*state_polls).min(script.states.len().saturating_sub(1));
                *state_polls += 1;
                let state = script.states.get(index).copied().unwrap_or("CONNECTING");
                format!(
                    "1700000000,{},SUCCESS,10.8.0.6,203.0.113.7,1194,,\r\nEND\r\n",
                    state
                )
            }
            "load-stats" => format!(
                ">BYTECOUNT:1,2\r\nSUCCESS: nclients=0,bytesin={},bytesout={}\r\n",
                script.bytes.0, script.bytes.1
            ),
            "log 2" if script.reject_auth => concat!(
                "1700000001,,MANAGEMENT: CMD 'password'\r\n",
                "1700000002,,MANAGEMENT: >PASSWORD:Verification Failed: 'Auth'\r\n",
                "END\r\n"
            )
            .to_string(),
            "log 2" => "1700000001,,MANAGEMENT: CMD 'state'\r\nEND\r\n".to_string(),
            "signal SIGTERM" => {
                let reply = if script.ack_terminate {
                    "SUCCESS: signal SIGTERM thrown\r\n"
                } else {
                    "ERROR: signal not supported\r\n"
                };
                let _ = writer.write_all(reply.as_bytes());
                return;
            }
            "quit" => return,
            other if other.starts_with("username ") => {
                "SUCCESS: 'Auth' username entered, but not yet verified\r\n".to_string()
            }
            other if other.starts_with("password ") => {
                "SUCCESS: 'Auth' password entered, but not yet verified\r\n".to_string()
            }
            _ => "ERROR: unknown command\r\n".to_string(),
        };

        if writer.write_all(reply.as_bytes()).is_err() {
            return;
        }
    }
}

/// Records launches instead of spawning anything
#[derive(Clone, Default)]
pub struct RecordingLauncher {
    pub launches: Rc<RefCell<Vec<LaunchSpec>>>,
}

impl Launcher for RecordingLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<(), LaunchError> {
        self.launches.borrow_mut().push(spec.clone());
        Ok(())
    }
}

pub fn settings(port: u16, attempts: u32) -> SessionSettings {
    SessionSettings {
        port,
        timeouts: ChannelTimeouts {
            connect: Duration::from_secs(1),
            poll: Duration::from_millis(50),
            write: Duration::from_secs(1),
            drain_limit: Duration::from_secs(2),
        },
        settle: Duration::ZERO,
        connect_retry: Retry::new(attempts, Duration::ZERO),
        ..SessionSettings::default()
    }
}

/// A port with nothing listening on it
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
