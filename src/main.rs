use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use ovpn_pilot::config::{Config, LOCAL_CONFIG};
use ovpn_pilot::management::{CancelToken, Pause, ThreadPause};
use ovpn_pilot::{Credential, Session, SessionError, profile};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// How often `connect --watch` logs traffic counters
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "ovpn-pilot")]
#[command(about = "Launch and supervise OpenVPN through its management interface")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./ovpn-pilot.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start OpenVPN with a profile and wait for the tunnel
    Connect(ConnectArgs),
    /// Terminate a running OpenVPN daemon
    Kill {
        /// Management port of the running daemon
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show the daemon's connection state
    Status {
        #[arg(long)]
        port: Option<u16>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the daemon's traffic counters
    Stats {
        #[arg(long)]
        port: Option<u16>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate default config file
    Init,
}

#[derive(Args)]
struct ConnectArgs {
    /// A `.ovpn` file, or a server directory to pick one from
    profile: Option<PathBuf>,

    /// Server directory to pick a profile from by port priority
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Username for VPN authentication (password is prompted)
    #[arg(short, long)]
    user: Option<String>,

    /// When the account expires (RFC 3339)
    #[arg(long, requires = "user")]
    expires: Option<DateTime<Utc>>,

    /// Management port to bind the daemon to
    #[arg(long)]
    port: Option<u16>,

    /// Keep running and log traffic counters until Ctrl+C
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::discover()?,
    };

    let result = match cli.command {
        Commands::Connect(args) => connect(config, args).await,
        Commands::Kill { port } => kill(&config, port),
        Commands::Status { port, json } => status(&config, port, json),
        Commands::Stats { port, json } => stats(&config, port, json),
        Commands::Init => init(),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn connect(config: Config, args: ConnectArgs) -> Result<(), Box<dyn Error>> {
    let profile = resolve_profile(&config, args.profile, args.dir)?;
    info!("Using profile {}", profile.display());

    let credential = match args.user {
        Some(user) => {
            let password = rpassword::prompt_password(format!("Password for {}: ", user))?;
            let mut credential = Credential::new(user, password);
            if let Some(expires) = args.expires {
                credential = credential.with_expiry(expires);
            }
            if credential.is_expired() {
                warn!("Credentials for {} have expired", credential.username);
            }
            Some(credential)
        }
        None => None,
    };

    let mut settings = config.session_settings();
    if let Some(port) = args.port {
        settings.port = port;
    }

    let mut launcher = config.launcher();
    if let Some(parent) = profile.parent() {
        launcher = launcher.with_working_dir(parent.to_path_buf());
    }

    let token = CancelToken::new();
    let pause = ThreadPause::new(token.clone());
    let mut session = Session::new(settings, launcher, pause.clone()).with_profile(profile);
    if let Some(credential) = credential {
        session = session.with_credential(credential);
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted");
            token.cancel();
        }
    });

    let watch = args.watch;
    tokio::task::spawn_blocking(move || -> Result<(), SessionError> {
        session.start()?;
        println!("Connected");
        if watch {
            watch_stats(&mut session, &pause)?;
        }
        Ok(())
    })
    .await??;

    Ok(())
}

/// Log counters until the pause is cancelled, then stop the daemon
fn watch_stats(session: &mut Session, pause: &ThreadPause) -> Result<(), SessionError> {
    while pause.pause(WATCH_INTERVAL).is_ok() {
        if !session.is_connected() {
            return Err(SessionError::ChannelClosed);
        }
        match session.get_stats() {
            Some(stats) => info!(
                "Traffic: {} bytes in, {} bytes out",
                stats.bytes_in, stats.bytes_out
            ),
            None => debug!("No stats reply"),
        }
    }

    info!("Stopping OpenVPN...");
    session.stop()
}

/// Explicit file, explicit directory, or the configured profile root
fn resolve_profile(
    config: &Config,
    target: Option<PathBuf>,
    dir: Option<PathBuf>,
) -> Result<PathBuf, Box<dyn Error>> {
    if let Some(path) = target.as_deref().filter(|p| p.is_file()) {
        return Ok(path.to_path_buf());
    }

    let dir = match target.or(dir).or_else(|| config.profiles.root()) {
        Some(dir) => dir,
        None => return Err("No profile given and no profile directory configured".into()),
    };
    Ok(profile::select_profile(&dir, &config.profiles.port_priorities)?)
}

/// Connect to an already running daemon and swallow its greeting
fn attach(config: &Config, port: Option<u16>) -> Result<Session, SessionError> {
    let mut settings = config.session_settings();
    if let Some(port) = port {
        settings.port = port;
    }
    let mut session = Session::new(settings, config.launcher(), ThreadPause::default());
    session.connect()?;
    session.receive_lines().for_each(drop);
    Ok(session)
}

fn kill(config: &Config, port: Option<u16>) -> Result<(), Box<dyn Error>> {
    info!("Terminating OpenVPN...");
    let mut session = attach(config, port)?;
    session.stop()?;
    println!("OpenVPN terminated");
    Ok(())
}

fn status(config: &Config, port: Option<u16>, json: bool) -> Result<(), Box<dyn Error>> {
    let mut session = attach(config, port)?;
    let state = session.get_state().ok_or("No reply to state query")?;
    session.disconnect();

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("VPN Status: {}", state.connected);
        println!("  Since: {}", state.up_since);
        println!("  Local IP: {}", state.local_ip);
        println!("  Remote IP: {}", state.remote_ip);
    }
    Ok(())
}

fn stats(config: &Config, port: Option<u16>, json: bool) -> Result<(), Box<dyn Error>> {
    let mut session = attach(config, port)?;
    let stats = session.get_stats().ok_or("No reply to load-stats query")?;
    session.disconnect();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Bytes in:  {}", stats.bytes_in);
        println!("Bytes out: {}", stats.bytes_out);
    }
    Ok(())
}

fn init() -> Result<(), Box<dyn Error>> {
    info!("Generating default config...");
    let path = Path::new(LOCAL_CONFIG);
    if path.exists() {
        return Err(format!("{} already exists", LOCAL_CONFIG).into());
    }
    Config::default().save(path)?;
    println!("Created default config: {}", LOCAL_CONFIG);
    Ok(())
}
