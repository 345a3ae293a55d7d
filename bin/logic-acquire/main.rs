use chrono::Utc;
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use std::{fs, path::PathBuf};

use rusty_logic::{
    load_config, load_config_or_default, spawn, AppConfig, ConnectionConfig, Logger,
    SessionHandle, SessionState, SessionUpdate, SharedConfig, TcpTransport, WireLogEntry,
};

/// Headless Saleae Logic acquisition driver
#[derive(Parser, Debug)]
#[command(name = "logic-acquire")]
#[command(
    about = "Capture and export analog channels through the Logic socket API",
    long_about = None
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Pick the first device entry containing this text
    #[arg(short, long, value_name = "TEXT")]
    device: Option<String>,

    /// Sample rate pair as listed by the device, e.g. "500000,125000"
    #[arg(short, long, value_name = "DIGITAL,ANALOG")]
    sample_rate: Option<String>,

    /// Start a new acquisition after every completed export cycle
    #[arg(short, long)]
    repeat: bool,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

/// Where the headless run is in the connect / select / acquire walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    PickDevice,
    PickRate,
    RateSent,
    RateRunning,
    Acquiring,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", toml::to_string_pretty(&AppConfig::default())?);
        return Ok(());
    }

    let mut config = match args.config.as_deref() {
        Some(path) => load_config(Some(path))?,
        None => load_config_or_default(None),
    };

    let log_level = args.log_level.clone().unwrap_or(config.logging.log_level.clone());
    initialize_logging(&log_level);

    apply_overrides(&mut config, &args);
    log_startup_info(&config, args.config.as_ref());

    let wire_log = if config.logging.wire_log {
        let path = create_log_file_path(&config.logging.log_path)?;
        info!("Wire log: {}", path.display());
        Some(Logger::<WireLogEntry>::new(path, 100, false))
    } else {
        None
    };

    let shared = SharedConfig::new(config.acquisition.clone());
    let transport = TcpTransport::new(ConnectionConfig {
        connect_timeout: config.device.connect_timeout(),
        write_timeout: config.device.write_timeout(),
    });
    let runner = spawn(transport, shared, config.device.poll_interval(), wire_log)?;

    setup_shutdown_handler(runner.handle.clone())?;

    runner
        .handle
        .connect(&config.device.host_ip, config.device.port)?;

    let result = drive(&runner.handle, &runner.updates, &config);

    info!("Cleaning up and shutting down...");
    let _ = runner.handle.shutdown();
    if runner.thread.join().is_err() {
        error!("Session thread panicked");
    }

    result
}

/// Act as the operator: pick entries as lists arrive, then acquire.
fn drive(
    handle: &SessionHandle,
    updates: &crossbeam_channel::Receiver<SessionUpdate>,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stage = Stage::PickDevice;

    for update in updates.iter() {
        match update {
            SessionUpdate::Status(text) => println!("{text}"),
            SessionUpdate::Devices(entries) if stage == Stage::PickDevice => {
                let entry = choose(&entries, config.selection.device.as_deref())
                    .ok_or("No matching Logic device connected")?;
                info!("Selecting device: {entry}");
                handle.select_device(entry)?;
                stage = Stage::PickRate;
            }
            SessionUpdate::SampleRates(entries) if stage == Stage::PickRate => {
                let entry = choose(&entries, config.selection.sample_rate.as_deref())
                    .ok_or("Requested sample rate not offered by the device")?;
                info!("Selecting sample rate: {entry}");
                handle.select_sample_rate(entry)?;
                stage = Stage::RateSent;
            }
            SessionUpdate::State(SessionState::RunningPipeline) if stage == Stage::RateSent => {
                stage = Stage::RateRunning;
            }
            SessionUpdate::State(SessionState::Connected) if stage == Stage::RateRunning => {
                info!("Starting acquisition");
                handle.acquire()?;
                stage = Stage::Acquiring;
            }
            SessionUpdate::ChannelChoices(choices) => {
                info!("Recordable channel counts: {:?}", choices);
            }
            SessionUpdate::SequenceFinished => {
                info!("✓ Acquisition completed successfully!");
                return Ok(());
            }
            SessionUpdate::SequenceHalted(reason) => {
                error!("✗ Acquisition halted: {reason}");
                return Err(format!("device rejected command: {reason}").into());
            }
            SessionUpdate::LinkClosed(reason) => {
                return Err(format!("link to Logic lost: {reason}").into());
            }
            SessionUpdate::State(SessionState::Disconnected) => {
                warn!("Session disconnected");
                return Ok(());
            }
            other => log::debug!("Update: {other:?}"),
        }
    }

    Ok(())
}

/// First non-blank entry, or the first one containing `wanted`.
fn choose<'a>(entries: &'a [String], wanted: Option<&str>) -> Option<&'a String> {
    entries
        .iter()
        .filter(|e| !e.trim().is_empty())
        .find(|e| wanted.is_none_or(|w| e.contains(w)))
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(device) = &args.device {
        config.selection.device = Some(device.clone());
    }
    if let Some(rate) = &args.sample_rate {
        config.selection.sample_rate = Some(rate.clone());
    }
    if args.repeat {
        config.acquisition.repeat = true;
    }
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&PathBuf>) {
    info!("=== Rusty Logic Acquisition ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!("Logic: {}:{}", config.device.host_ip, config.device.port);

    let acq = &config.acquisition;
    info!(
        "Channels: {}, trigger: channel {} {}",
        acq.channel_count, acq.trigger_channel, acq.trigger_mode
    );
    info!(
        "Samples: {}, pre-trigger: {}",
        acq.sample_count, acq.pretrigger_size
    );
    info!("Output: {} (repeat: {})", acq.output_path, acq.repeat);
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler(handle: SessionHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("Ctrl+C received - initiating graceful shutdown...");
        let _ = handle.shutdown();
    })
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn create_log_file_path(log_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let history_dir = PathBuf::from(log_path);
    fs::create_dir_all(&history_dir)?;

    let filename = format!("logic_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(history_dir.join(filename))
}
