use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nrf_serial_dfu::dfu::{
    unpack_and_parse, DfuEvent, DfuOrchestrator, FlowControl, SerialTransport, TransportConfig,
};
use nrf_serial_dfu::settings::SettingsManager;

#[derive(Parser, Debug)]
#[command(name = "nrf-serial-dfu")]
#[command(version, about = "Update Nordic nRF5x firmware over a serial DFU bootloader", long_about = None)]
struct Cli {
    /// DFU package (.zip) to send
    #[arg(long = "package", value_name = "ZIP")]
    package: PathBuf,

    /// Serial port of the device (e.g. /dev/ttyACM0 or COM3)
    #[arg(long = "port", value_name = "PORT")]
    port: Option<String>,

    #[arg(short = 'b', long = "baud-rate", value_name = "BAUD")]
    baud_rate: Option<u32>,

    /// Enable hardware (RTS/CTS) flow control
    #[arg(long = "flow-control")]
    flow_control: bool,

    /// Packet receipt notification interval, 0 to disable
    #[arg(long = "prn", value_name = "N")]
    prn: Option<u16>,

    /// Ping the bootloader before each image
    #[arg(long = "ping")]
    ping: bool,

    /// Wait for each response or acknowledgment
    #[arg(long = "timeout-ms", value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Wait after first opening the port
    #[arg(long = "connect-delay-ms", value_name = "MS")]
    connect_delay_ms: Option<u64>,

    /// Text sent to the running application to enter DFU mode (\n and \r are unescaped)
    #[arg(long = "dfu-start", value_name = "TEXT")]
    dfu_start: Option<String>,

    /// JSON settings file providing defaults for the options above
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the effective settings to FILE for later use with --config
    #[arg(long = "save-config", value_name = "FILE")]
    save_config: Option<PathBuf>,

    /// Directory to unpack the package into; must not exist
    #[arg(long = "work-dir", value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Print the images that would be sent and exit
    #[arg(long = "dry-run")]
    dry_run: bool,

    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("nrf_serial_dfu={}", level)))
        .context("Failed to create log filter")?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
    Ok(())
}

/// Settings file values, overridden by explicit flags.
fn transport_config(cli: &Cli) -> Result<TransportConfig> {
    let mut config = match &cli.config {
        Some(path) => SettingsManager::new(path)
            .load()
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => TransportConfig::default(),
    };

    if let Some(port) = &cli.port {
        config.port = port.clone();
    }
    if let Some(baud_rate) = cli.baud_rate {
        config.baud_rate = baud_rate;
    }
    if cli.flow_control {
        config.flow_control = FlowControl::Hardware;
    }
    if let Some(prn) = cli.prn {
        config.prn = prn;
    }
    if cli.ping {
        config.ping = true;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(delay) = cli.connect_delay_ms {
        config.connect_delay_ms = Some(delay);
    }
    if let Some(text) = &cli.dfu_start {
        config.dfu_trigger = Some(text.replace("\\n", "\n").replace("\\r", "\r"));
    }

    if config.port.is_empty() {
        bail!("No serial port given; pass --port or set \"port\" in the settings file");
    }
    Ok(config)
}

/// Persist the merged settings when --save-config is given.
fn save_settings(cli: &Cli, config: &TransportConfig) -> Result<()> {
    let Some(path) = &cli.save_config else {
        return Ok(());
    };
    let manager = SettingsManager::new(path);
    manager
        .save(config)
        .with_context(|| format!("Failed to save settings to {}", path.display()))?;
    info!(path = %manager.settings_path().display(), "settings saved");
    Ok(())
}

fn progress_bar(total: u64) -> Result<ProgressBar> {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n[{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(bar)
}

fn run(cli: &Cli, work_dir: &Path) -> Result<()> {
    let config = transport_config(cli)?;
    save_settings(cli, &config)?;

    let package = unpack_and_parse(&cli.package, work_dir)
        .with_context(|| format!("Failed to load package {}", cli.package.display()))?;

    let (tx, rx) = mpsc::channel::<DfuEvent>();
    let mut orchestrator = DfuOrchestrator::new(package, SerialTransport::new(config), tx);

    let total = orchestrator.total_size()?;
    for (component, size) in orchestrator.transfer_plan()? {
        info!(%component, bytes = size, "queued");
    }
    if cli.dry_run {
        return Ok(());
    }

    let bar = progress_bar(total)?;
    let renderer = {
        let bar = bar.clone();
        thread::spawn(move || {
            for event in rx {
                match event {
                    DfuEvent::Uploading { sent, .. } => bar.set_position(sent),
                    DfuEvent::Complete => bar.finish_with_message(event.message()),
                    other => bar.set_message(other.message()),
                }
            }
        })
    };

    let result = orchestrator.send_images();
    // Closes the event channel so the renderer exits
    drop(orchestrator);
    renderer
        .join()
        .map_err(|_| anyhow!("progress renderer panicked"))?;

    result.map_err(|e| {
        bar.abandon();
        let code = e.error_code();
        anyhow::Error::new(e).context(format!("DFU failed [{}]", code))
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let (work_dir, temporary) = match &cli.work_dir {
        Some(dir) => (dir.clone(), false),
        None => (
            std::env::temp_dir().join(format!("nrf-serial-dfu-{}", std::process::id())),
            true,
        ),
    };
    // Never remove a directory this run did not create
    let owned = temporary && !work_dir.exists();

    let result = run(&cli, &work_dir);

    if owned && work_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            warn!(path = %work_dir.display(), error = %e, "failed to remove unpacked package");
        }
    }

    result
}
