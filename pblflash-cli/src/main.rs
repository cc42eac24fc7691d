//! pcl - Command-line tool for the PIC row bootloader.
//!
//! ## Features
//!
//! - Query the bootloader for its geometry and configuration words
//! - Load Intel HEX or binary application images, or 256-byte EEPROM images
//! - Verify and start the resident application
//! - Direct serial connection or the relay daemon in addressed mode
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use log::{debug, info, warn};
use pblflash::{
    Flasher, Layout, Link, NativePort, RelayClient, RelayLink, SerialConfig, SerialLink,
    flasher::DEFAULT_PRODUCT_ID,
    link::relay::{DEFAULT_HOST, DEFAULT_SERVICE, RelayConfig},
    protocol::MAX_NODE_ADDRESS,
};
use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Read timeout on the serial port; one reply byte must arrive within it.
const SERIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Connect timeout while probing for the relay daemon.
const RELAY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad or missing arguments.
    #[error("{0}")]
    Usage(String),
    /// Stopped by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(pblflash::Error::Interrupted) = cause.downcast_ref::<pblflash::Error>() {
            return 130;
        }
    }
    1
}

const ENV_HELP: &str = "\
Environment variables:
  PCL_PORT           Serial port
  PCL_BAUD           Baud rate override
  PCL_ADDRESS        Node address (0-31)
  PCL_PRODUCT_ID     Expected product ID (hex)
  PCL_RELAY_HOST     Relay daemon host (default ::1)
  PCL_RELAY_SERVICE  Relay daemon TCP port (default 1128)
  PCL_CONFIG         Configuration file";

/// pcl - load applications through the PIC row bootloader.
///
/// Without --address the legacy direct protocol is used at 57600 baud.
/// With --address the addressed protocol is used at 9600 baud, through the
/// relay daemon when one is running.
#[derive(Parser)]
#[command(name = "pcl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = ENV_HELP)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "PCL_PORT")]
    port: Option<String>,

    /// Baud rate (defaults to the protocol's rate).
    #[arg(short, long, global = true, env = "PCL_BAUD")]
    baud: Option<u32>,

    /// Node address; selects the addressed protocol.
    #[arg(short, long, global = true, env = "PCL_ADDRESS", value_parser = parse_address)]
    address: Option<u8>,

    /// Relay daemon host.
    #[arg(long, global = true, env = "PCL_RELAY_HOST")]
    relay_host: Option<String>,

    /// Relay daemon TCP port.
    #[arg(long, global = true, env = "PCL_RELAY_SERVICE")]
    relay_service: Option<u16>,

    /// Expected product ID (hex).
    #[arg(long, global = true, env = "PCL_PRODUCT_ID", value_parser = parse_hex_u16)]
    product_id: Option<u16>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, env = "PCL_CONFIG", value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Query the bootloader and print its report.
    Query {
        /// Output the report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Load an image (.hex or .bin).
    Flash {
        /// Image file (defaults to `flash.file` from the config).
        file: Option<PathBuf>,

        /// Write a 256-byte image to data EEPROM instead of program memory.
        #[arg(short, long)]
        eeprom: bool,

        /// Verify the application after loading.
        #[arg(short, long, conflicts_with = "eeprom")]
        check: bool,

        /// Verify and start the application after loading.
        #[arg(short = 'x', long, conflicts_with_all = ["eeprom", "reset"])]
        execute: bool,

        /// Restart the device after loading.
        #[arg(short, long)]
        reset: bool,
    },

    /// Verify and start the resident application.
    Run,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a node address.
fn parse_address(s: &str) -> Result<u8, String> {
    let address: u8 = s
        .trim()
        .parse()
        .map_err(|e| format!("Invalid address: {e}"))?;
    if address > MAX_NODE_ADDRESS {
        return Err(format!("Address {address} out of range 0-{MAX_NODE_ADDRESS}"));
    }
    Ok(address)
}

/// Parse a hexadecimal value (supports 0x prefix and underscores).
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let s = s
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let s: String = s
        .chars()
        .filter(|c| *c != '_')
        .collect();
    u16::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "pcl v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        warn!("Failed to install Ctrl-C handler: {e}");
    }
    pblflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Query { json } => commands::query::cmd_query(cli, &config, *json),
        Commands::Flash {
            file,
            eeprom,
            check,
            execute,
            reset,
        } => commands::flash::cmd_flash(
            cli,
            &config,
            file.as_ref(),
            &commands::flash::FlashArgs {
                eeprom: *eeprom,
                check: *check,
                execute: *execute,
                reset: *reset,
            },
        ),
        Commands::Run => commands::flash::cmd_run(cli, &config),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Expected product ID from flags, config or the default.
pub(crate) fn product_id(cli: &Cli, config: &Config) -> u16 {
    cli.product_id
        .or(config.device.product_id)
        .unwrap_or(DEFAULT_PRODUCT_ID)
}

/// Packet layout selected by the node address, if any.
fn layout(cli: &Cli, config: &Config) -> Result<Layout> {
    match cli.address.or(config.device.address) {
        Some(address) => {
            Layout::addressed(address).map_err(|e| CliError::Usage(e.to_string()).into())
        },
        None => Ok(Layout::Legacy),
    }
}

/// Open the serial port for `layout`.
fn open_serial(cli: &Cli, config: &Config, layout: Layout) -> Result<SerialLink<NativePort>> {
    let port = cli
        .port
        .clone()
        .or_else(|| config.connection.port.clone())
        .ok_or_else(|| {
            CliError::Usage("no serial port given; use --port or PCL_PORT".to_string())
        })?;
    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or_else(|| layout.baud_rate());

    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("→").cyan(),
            style(&port).bold(),
            baud
        );
    }
    let serial = NativePort::open(&SerialConfig::new(&port, baud).with_timeout(SERIAL_TIMEOUT))
        .with_context(|| format!("failed to open {port}"))?;
    Ok(SerialLink::new(serial))
}

/// Use the relay daemon when it answers the handshake.
fn try_relay(cli: &Cli, config: &Config, address: u8) -> Result<Option<RelayLink>> {
    let host = cli
        .relay_host
        .clone()
        .or_else(|| config.relay.host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let service = cli
        .relay_service
        .or(config.relay.service)
        .unwrap_or(DEFAULT_SERVICE);

    let client = RelayClient::new(
        RelayConfig::new(host.clone(), service).with_socket_timeout(RELAY_PROBE_TIMEOUT),
    );
    match client.handshake() {
        Ok(daemon) => {
            info!("Relay daemon {} at {host}:{service}", daemon.version);
            if !cli.quiet {
                eprintln!(
                    "{} Using relay daemon at {host}:{service}, node {address}",
                    style("→").cyan()
                );
            }
            client
                .enter_bootloader(address)
                .context("failed to start the bootloader through the relay")?;
            Ok(Some(RelayLink::new(client)))
        },
        Err(e @ pblflash::Error::RelayIncompatible(_)) => Err(e.into()),
        Err(e) => {
            debug!("No relay daemon at {host}:{service}: {e}");
            Ok(None)
        },
    }
}

/// Open the link to the bootloader and wrap it in a flasher.
pub(crate) fn open_flasher(cli: &Cli, config: &Config) -> Result<Flasher<Box<dyn Link>>> {
    let layout = layout(cli, config)?;
    let link: Box<dyn Link> = match layout {
        Layout::Addressed { address } => match try_relay(cli, config, address)? {
            Some(relay) => Box::new(relay),
            None => Box::new(open_serial(cli, config, layout)?),
        },
        Layout::Legacy => Box::new(open_serial(cli, config, layout)?),
    };
    Ok(Flasher::new(link, layout))
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd
        .get_name()
        .to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
