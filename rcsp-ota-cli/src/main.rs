//! rcsp-ota CLI - OTA firmware updates for RCSP BLE accessories.
//!
//! ## Features
//!
//! - Scan for nearby BLE devices
//! - Show device information and firmware version
//! - Run a full OTA upgrade with live progress
//! - Environment variable support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use rcsp_ota::protocol::response::DeviceInfo;
use rcsp_ota::{
    Command, DeviceAddress, OtaConfig, OtaEvent, OtaUpdater, RcspSession, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod ble;

use ble::BleTransport;

/// Attribute mask requesting every target-info group.
const TARGET_INFO_MASK: u32 = 0xFFFF_FFFF;
/// Platform identifier reported to the device.
const PLATFORM_HOST: u8 = 0x02;

/// rcsp-ota - OTA firmware updates for RCSP BLE accessories.
///
/// Environment variables:
///   RCSP_OTA_ADDRESS   - Default device address (AA:BB:CC:DD:EE:FF)
#[derive(Parser)]
#[command(name = "rcsp-ota")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Device address (AA:BB:CC:DD:EE:FF).
    #[arg(short, long, global = true, env = "RCSP_OTA_ADDRESS")]
    address: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby BLE devices.
    Scan {
        /// Scan duration in seconds.
        #[arg(long, default_value = "5", value_name = "SECONDS")]
        duration: u64,

        /// Show all devices, not just those advertising the RCSP service.
        #[arg(long)]
        all: bool,
    },

    /// Show device information.
    Info,

    /// Run an OTA upgrade.
    Update {
        /// Path to the firmware file.
        firmware: PathBuf,

        /// Timeout for a single command exchange, in seconds.
        #[arg(long, default_value = "8", value_name = "SECONDS")]
        command_timeout: u64,

        /// How long to wait for the device to reappear after a reboot.
        #[arg(long, default_value = "30", value_name = "SECONDS")]
        reconnect_timeout: u64,

        /// How long to wait for the device to go offline for its reboot.
        #[arg(long, default_value = "20", value_name = "SECONDS")]
        offline_timeout: u64,

        /// Maximum number of initial connection attempts.
        #[arg(long, default_value = "3")]
        retries: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
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
        "rcsp-ota v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match &cli.command {
        Commands::Scan { duration, all } => {
            cmd_scan(&cli, *duration, *all).await?;
        },
        Commands::Info => {
            cmd_info(&cli).await?;
        },
        Commands::Update {
            firmware,
            command_timeout,
            reconnect_timeout,
            offline_timeout,
            retries,
        } => {
            let config = OtaConfig::default()
                .with_command_timeout(Duration::from_secs(*command_timeout))
                .with_reconnect_timeout(Duration::from_secs(*reconnect_timeout))
                .with_offline_wait_timeout(Duration::from_secs(*offline_timeout))
                .with_max_retries(*retries);
            cmd_update(&cli, firmware, config).await?;
        },
    }

    Ok(())
}

/// Resolve the device address from CLI args or the environment.
fn get_address(cli: &Cli) -> Result<DeviceAddress> {
    let raw = cli.address.as_deref().ok_or_else(|| {
        anyhow::anyhow!("no device address given; pass --address or set RCSP_OTA_ADDRESS")
    })?;
    raw.parse::<DeviceAddress>()
        .with_context(|| format!("invalid device address '{raw}'"))
}

/// Whether progress animations should be drawn.
fn use_fancy_output(cli: &Cli) -> bool {
    !cli.quiet && console::Term::stderr().is_term()
}

/// Scan command implementation.
async fn cmd_scan(cli: &Cli, duration: u64, all: bool) -> Result<()> {
    let transport = BleTransport::new().await?;
    if !cli.quiet {
        eprintln!(
            "{} Scanning for {duration} seconds...",
            style("🔍").cyan()
        );
    }

    let mut devices = transport.scan_devices(Duration::from_secs(duration)).await?;
    if !all {
        devices.retain(|device| device.is_rcsp);
    }

    if devices.is_empty() {
        eprintln!("No devices found (try --all to list everything seen).");
        return Ok(());
    }

    for device in &devices {
        let rssi = device
            .rssi
            .map_or_else(|| "   ?".to_string(), |rssi| format!("{rssi:4}"));
        println!(
            "{}  {} dBm  {}{}",
            device.address,
            rssi,
            device.name.as_deref().unwrap_or("(no name)"),
            if device.is_rcsp {
                format!("  {}", style("[RCSP]").green())
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

/// Info command implementation.
async fn cmd_info(cli: &Cli) -> Result<()> {
    let address = get_address(cli)?;
    let transport: Arc<dyn Transport> = Arc::new(BleTransport::new().await?);

    if !cli.quiet {
        eprintln!("{} Connecting to {address}...", style("⏳").yellow());
    }
    transport.connect(&address).await?;

    let session = RcspSession::new(Arc::clone(&transport));
    session.initialize()?;
    let info: DeviceInfo = session
        .request(
            &Command::GetTargetInfo {
                mask: TARGET_INFO_MASK,
                platform: PLATFORM_HOST,
            },
            Duration::from_secs(8),
        )
        .await?;
    session.shutdown();
    transport.disconnect().await?;

    println!("Name:             {}", info.name);
    println!("Version:          {} ({:#010x})", info.version, info.version_code);
    println!("Device type:      {:#04x}", info.device_type);
    println!("Battery:          {}%", info.battery);
    println!("Address:          {}", info.mac);
    println!("Dual bank:        {}", info.dual_bank);
    println!("Bootloader:       {}", info.bootloader_required);
    println!("Mandatory update: {}", info.mandatory_upgrade);
    println!("Reboot scheme:    {:?}", info.reboot_scheme);
    Ok(())
}

/// Update command implementation.
async fn cmd_update(cli: &Cli, firmware: &PathBuf, config: OtaConfig) -> Result<()> {
    let address = get_address(cli)?;

    if !cli.quiet {
        eprintln!(
            "{} Updating {address} with {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let transport = Arc::new(BleTransport::new().await?);
    let updater = Arc::new(OtaUpdater::new(transport, config));

    // First Ctrl-C cancels the session cleanly.
    let cancel_handle = Arc::clone(&updater);
    ctrlc::set_handler(move || {
        eprintln!("\n{} Cancelling upgrade...", style("⚠").yellow());
        cancel_handle.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    // Create progress bar
    let pb = if use_fancy_output(cli) {
        let pb = ProgressBar::new(0);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut events = updater.subscribe();
    let progress_bar = pb.clone();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OtaEvent::State(state) => progress_bar.set_message(state.to_string()),
                OtaEvent::Progress(progress) => {
                    if progress_bar.length() != Some(progress.total_bytes) {
                        progress_bar.set_length(progress.total_bytes);
                    }
                    progress_bar.set_position(progress.transferred_bytes);
                },
            }
        }
    });

    let outcome = updater.start(address, firmware).await?;
    reporter.abort();
    pb.finish_and_clear();

    if outcome.success {
        eprintln!("{} {}", style("✓").green(), outcome.message);
        if let Some(info) = &outcome.device_info {
            eprintln!("  Device was running {} v{}", info.name, info.version);
        }
        Ok(())
    } else {
        eprintln!(
            "{} {} (code {}, state: {})",
            style("✗").red().bold(),
            outcome.message,
            outcome.code.code(),
            outcome.final_state
        );
        std::process::exit(1);
    }
}
