//! OpenVPN management interface supervision
//!
//! The daemon exposes a loopback text protocol (`--management <host> <port>`)
//! that we use to feed it credentials, watch it connect, read traffic
//! counters and shut it down.
//!
//! # Usage
//!
//! ```no_run
//! use ovpn_pilot::management::{Session, SessionSettings, ThreadPause};
//! use ovpn_pilot::launcher::DaemonLauncher;
//!
//! let mut session = Session::new(
//!     SessionSettings::default(),
//!     DaemonLauncher::default(),
//!     ThreadPause::default(),
//! )
//! .with_profile("/home/me/.openvpn/configs/us-east/us-east-443.ovpn");
//!
//! if session.start().is_ok() {
//!     println!("{:?}", session.get_stats());
//! }
//! ```

pub mod codec;
pub mod retry;
pub mod session;
pub mod transport;

pub use codec::{Command, DaemonState, Line, StatsRecord, StatusRecord};
pub use retry::{CancelToken, Cancelled, NoPause, Pause, Retry, RetryOutcome, ThreadPause};
pub use session::{Phase, Session, SessionError, SessionSettings};
pub use transport::{ChannelTimeouts, ControlChannel, TransportError};
