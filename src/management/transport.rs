//! Line-oriented TCP channel to the daemon's management endpoint
//!
//! The management protocol mixes asynchronous pushes with command replies on
//! a single stream, so reads never wait for an exact reply count. A
//! [`Drain`] hands out whatever lines arrive within one poll window and then
//! ends; callers poll again when they want more.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Timed out connecting to management interface at {0}")]
    Timeout(String),
    #[error("Management interface at {0} refused the connection")]
    Refused(String),
    #[error("Could not resolve management address {0}")]
    Unresolved(String),
    #[error("Management I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Deadlines applied to every channel operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimeouts {
    /// Upper bound on the TCP connect
    pub connect: Duration,
    /// How long one read waits for new bytes before the drain ends
    pub poll: Duration,
    /// Upper bound on a single write
    pub write: Duration,
    /// Ceiling on one whole drain, however chatty the daemon is
    pub drain_limit: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            poll: Duration::from_millis(100),
            write: Duration::from_secs(2),
            drain_limit: Duration::from_secs(5),
        }
    }
}

/// Outcome of waiting one poll window for a line
#[derive(Debug)]
pub enum Poll {
    Line(String),
    /// Nothing complete arrived within the window
    Idle,
    /// The peer closed the connection
    Closed,
    Failed(io::Error),
}

const READ_CHUNK: usize = 1024;

/// Longest unterminated line kept in memory; anything beyond is discarded
const MAX_PENDING: usize = 8 * 1024;

/// Connected management socket plus the bytes of any partial line
pub struct ControlChannel {
    stream: TcpStream,
    pending: Vec<u8>,
    eof: bool,
    drain_limit: Duration,
    peer: String,
}

impl ControlChannel {
    /// Connect to `host:port`, giving up after `timeouts.connect`
    pub fn connect(
        host: &str,
        port: u16,
        timeouts: &ChannelTimeouts,
    ) -> Result<Self, TransportError> {
        let peer = format!("{}:{}", host, port);
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Unresolved(peer.clone()))?
            .collect();

        // a zero connect timeout is rejected outright by the OS
        let connect_timeout = timeouts.connect.max(Duration::from_millis(1));
        let mut last_error = None;
        for addr in &addrs {
            debug!("Connecting to management interface at {}", addr);
            match TcpStream::connect_timeout(addr, connect_timeout) {
                Ok(stream) => return Self::from_stream(stream, peer, timeouts),
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => classify_connect_error(e, peer),
            None => TransportError::Unresolved(peer),
        })
    }

    fn from_stream(
        stream: TcpStream,
        peer: String,
        timeouts: &ChannelTimeouts,
    ) -> Result<Self, TransportError> {
        // a zero read timeout means "block forever" to the OS
        stream.set_read_timeout(Some(timeouts.poll.max(Duration::from_millis(1))))?;
        stream.set_write_timeout(Some(timeouts.write.max(Duration::from_millis(1))))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            pending: Vec::new(),
            eof: false,
            drain_limit: timeouts.drain_limit,
            peer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write `line` followed by a newline
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        let mut data = String::with_capacity(line.len() + 1);
        data.push_str(line);
        data.push('\n');
        self.stream.write_all(data.as_bytes())?;
        self.stream.flush()
    }

    /// Return the next complete line, reading for at most one poll window
    /// per chunk. Past `deadline` this reports `Idle` even mid-line.
    pub fn poll_line(&mut self, deadline: Option<Instant>) -> Poll {
        loop {
            if let Some(line) = self.take_line() {
                return Poll::Line(line);
            }
            if self.eof {
                return Poll::Closed;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Poll::Idle;
            }

            let mut buf = [0u8; READ_CHUNK];
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    // flush an unterminated trailing line before reporting EOF
                    if !self.pending.is_empty() {
                        let rest = std::mem::take(&mut self.pending);
                        let line = decode_line(&rest);
                        if !line.is_empty() {
                            return Poll::Line(line);
                        }
                    }
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if self.pending.len() > MAX_PENDING && !self.pending.contains(&b'\n') {
                        warn!(
                            "Discarding {} bytes of unterminated input from {}",
                            self.pending.len(),
                            self.peer
                        );
                        self.pending.clear();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Poll::Idle;
                }
                Err(e) => return Poll::Failed(e),
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = decode_line(&raw);
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    /// Close both directions; errors are irrelevant once we are leaving
    pub fn shutdown(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Management socket shutdown: {}", e);
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

fn classify_connect_error(e: io::Error, peer: String) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout(peer),
        io::ErrorKind::ConnectionRefused => TransportError::Refused(peer),
        _ => TransportError::Io(e),
    }
}

/// Finite iterator over the lines currently available on a channel slot
///
/// Ends on the first idle poll window, on the drain ceiling, or when the
/// channel goes away. EOF and read errors empty the slot, which is how the
/// owning session learns it is disconnected.
pub struct Drain<'a> {
    slot: &'a mut Option<ControlChannel>,
    deadline: Option<Instant>,
    done: bool,
}

impl<'a> Drain<'a> {
    pub fn new(slot: &'a mut Option<ControlChannel>) -> Self {
        let deadline = slot.as_ref().map(|c| Instant::now() + c.drain_limit);
        Self {
            slot,
            deadline,
            done: false,
        }
    }

    fn finish(&mut self) -> Option<String> {
        self.done = true;
        None
    }
}

impl Iterator for Drain<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        let Some(channel) = self.slot.as_mut() else {
            return self.finish();
        };
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            debug!("Drain limit reached on {}", channel.peer);
            return self.finish();
        }

        match channel.poll_line(self.deadline) {
            Poll::Line(line) => {
                trace!("<- {}", line);
                Some(line)
            }
            Poll::Idle => self.finish(),
            Poll::Closed => {
                info!("Management interface at {} closed the connection", channel.peer);
                if let Some(channel) = self.slot.take() {
                    channel.shutdown();
                }
                self.finish()
            }
            Poll::Failed(e) => {
                warn!("Management read from {} failed: {}", channel.peer, e);
                if let Some(channel) = self.slot.take() {
                    channel.shutdown();
                }
                self.finish()
            }
        }
    }
}

impl std::iter::FusedIterator for Drain<'_> {}
