//! XMouse Daemon
//!
//! Polls the wheel counter and extra-button register of a memory-mapped
//! mouse interface and injects the resulting events through uinput. A second
//! invocation talks to the running daemon instead of starting another one.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use xmoused::{
    config::{ConfigByte, Settings, DEFAULT_CONFIG_BYTE},
    control::{unpack_status, ControlMessage},
    daemon::startup,
    dbus::{ClientError, DaemonClient},
};

/// What the invocation should do with respect to a running daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    /// Start if stopped, stop if running
    Toggle,
    /// Start, or reconfigure a running daemon with the given byte
    Start(Option<ConfigByte>),
    /// Stop a running daemon
    Stop,
}

/// Parse `start`, `stop` or a `0xNN` configuration byte
///
/// A byte with neither wheel nor buttons enabled means stop.
fn parse_mode(arg: &str) -> Result<StartMode, String> {
    let arg = arg.trim();

    if arg.eq_ignore_ascii_case("stop") {
        return Ok(StartMode::Stop);
    }
    if arg.eq_ignore_ascii_case("start") {
        return Ok(StartMode::Start(None));
    }

    let digits = arg
        .strip_prefix("0x")
        .or_else(|| arg.strip_prefix("0X"))
        .ok_or_else(|| format!("expected start, stop or 0xNN, got '{}'", arg))?;
    let bits = u8::from_str_radix(digits, 16)
        .map_err(|_| format!("invalid configuration byte '{}'", arg))?;

    let config = ConfigByte::new(bits);
    if config.is_idle() {
        Ok(StartMode::Stop)
    } else {
        Ok(StartMode::Start(Some(config)))
    }
}

/// XMouse Daemon - wheel and extra buttons for memory-mapped mice
#[derive(Parser, Debug)]
#[command(name = "xmoused")]
#[command(version, about, long_about = None)]
struct Args {
    /// start, stop, or a 0xNN configuration byte (default: toggle)
    #[arg(value_parser = parse_mode)]
    mode: Option<StartMode>,

    /// Print the running daemon's configuration and poll interval
    #[arg(long)]
    status: bool,

    /// Set the running daemon's poll interval in microseconds
    #[arg(long, value_name = "MICROS")]
    interval: Option<u32>,

    /// Settings file path (default: ~/.config/xmouse/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mode = args.mode.unwrap_or(StartMode::Toggle);

    let client = match DaemonClient::find().await {
        Ok(client) => Some(client),
        Err(ClientError::NotRunning) => None,
        Err(e) => {
            warn!("Could not look for a running daemon: {}", e);
            None
        }
    };

    if args.status || args.interval.is_some() {
        let Some(client) = client else {
            println!("daemon is not running");
            return Ok(());
        };
        return query_daemon(&client, &args).await;
    }

    match (mode, client) {
        (StartMode::Stop, None) => {
            println!("daemon is not running");
        }
        (StartMode::Start(config), Some(client)) => match config {
            Some(config) if config.bits() != DEFAULT_CONFIG_BYTE => {
                client.send(ControlMessage::set_config(config)).await?;
                println!("config updated to {}", config);
            }
            _ => println!("daemon already running"),
        },
        (StartMode::Stop | StartMode::Toggle, Some(client)) => {
            print!("stopping daemon...");
            client.send(ControlMessage::quit()).await?;
            println!(" done.");
        }
        (StartMode::Start(config), None) => {
            run_daemon(load_settings(&args, config)).await?;
        }
        (StartMode::Toggle, None) => {
            run_daemon(load_settings(&args, None)).await?;
        }
    }

    Ok(())
}

/// Handle `--interval` and `--status` against a running daemon
async fn query_daemon(client: &DaemonClient, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(micros) = args.interval {
        let reply = client.send(ControlMessage::set_interval(micros)).await?;
        println!("poll interval set to {}us", reply.result);
    }

    if args.status {
        let reply = client.send(ControlMessage::get_status()).await?;
        let (config, millis) = unpack_status(reply.result);
        println!("config: {}", config);
        println!("  Wheel: {}", on_off(config.wheel_enabled()));
        println!("  Extra buttons: {}", on_off(config.buttons_enabled()));
        println!("  Poll interval: {}ms", millis);
        println!("  Debug: {}", on_off(config.debug()));
    }

    Ok(())
}

fn on_off(flag: bool) -> &'static str {
    if flag { "ON" } else { "OFF" }
}

/// Load settings, with a command-line configuration byte taking precedence
fn load_settings(args: &Args, config: Option<ConfigByte>) -> Settings {
    let loaded = match &args.config {
        Some(path) => Settings::load(path),
        None => Settings::load_default(),
    };

    let mut settings = match loaded {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    };

    if let Some(config) = config {
        settings.config_byte = config.bits();
    }
    settings
}

/// Run the daemon in the foreground until Quit or Ctrl-C
async fn run_daemon(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let config = settings.config();
    info!(
        config = %config,
        wheel = on_off(config.wheel_enabled()),
        buttons = on_off(config.buttons_enabled()),
        interval_ms = config.poll_interval_micros() / 1_000,
        "XMouse daemon starting..."
    );

    let mut daemon = match startup(&settings).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to start daemon: {}", e);
            return Err(e.into());
        }
    };

    info!("XMouse daemon ready");

    let reason = daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!(?reason, "XMouse daemon stopped");
    Ok(())
}
