//! CLI Entry Point for helix
//!
//! Provides command-line interface for:
//! - Listing candidate serial ports
//! - Inspecting a CSV protocol file
//! - Running a protocol against a device or the built-in simulator
//! - Watching temperatures while idle
//! - Issuing single manual commands
//!
//! # Usage
//!
//! ```bash
//! helix ports
//! helix plan protocols/pcr.csv
//! helix run protocols/pcr.csv --port /dev/ttyACM0 --title "PCR 30x"
//! helix run protocols/pcr.csv --simulate
//! helix monitor --simulate --seconds 10
//! helix control --port /dev/ttyACM0 set-plate 4
//! ```
//!
//! While a run is in progress, type `s` + Enter to skip the current step and `q` + Enter (or
//! press Ctrl-C) for an emergency stop.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use helix_cycler::config::{Settings, DEFAULT_CONFIG_PATH};
use helix_cycler::hardware::{HardwareSession, SimulatedThermocycler};
use helix_cycler::logging;
use helix_cycler::orchestrator::Orchestrator;
use helix_cycler::protocol::{
    load_protocol, ChannelProgressSink, CsvGraphSink, EngineState, ProgressUpdate, RunControl,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "helix")]
#[command(about = "Thermocycler protocol runner", long_about = None, version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct DeviceArgs {
    /// Serial port of the thermocycler (defaults to `serial.port` from the config)
    #[arg(long, conflicts_with = "simulate")]
    port: Option<String>,

    /// Use the built-in simulated device instead of a serial port
    #[arg(long)]
    simulate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate serial ports
    Ports,

    /// Show a protocol file as a stage/step table
    Plan {
        file: PathBuf,

        /// Print the parsed plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a protocol file
    Run {
        file: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,

        /// Title used for the temperature history file
        #[arg(long, default_value = "run")]
        title: String,
    },

    /// Report lid and plate temperatures periodically
    Monitor {
        #[command(flatten)]
        device: DeviceArgs,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Send a single manual command
    Control {
        #[command(flatten)]
        device: DeviceArgs,

        #[command(subcommand)]
        action: ControlAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum ControlAction {
    OpenLid,
    CloseLid,
    /// Set the plate target in °C
    SetPlate {
        target: f64,
        /// Hold time in seconds
        #[arg(long)]
        hold: Option<f64>,
        /// Well volume in µL
        #[arg(long)]
        volume: Option<f64>,
    },
    /// Set the lid target in °C
    SetLid { target: f64 },
    /// Switch heaters or motors off
    Deactivate {
        #[arg(value_enum, default_value_t = DeactivateTarget::All)]
        target: DeactivateTarget,
    },
    OpenLatch,
    CloseLatch,
    /// Set the shaker speed in rpm
    Shake { rpm: u32 },
    /// Read the current lid and plate temperatures
    Status,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum DeactivateTarget {
    All,
    Plate,
    Lid,
    Shaker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    logging::init_from_settings(&settings).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Plan { file, json } => show_plan(file, json),
        Commands::Run {
            file,
            device,
            title,
        } => run_protocol(settings, file, device, title).await,
        Commands::Monitor { device, seconds } => monitor(settings, device, seconds).await,
        Commands::Control { device, action } => control(settings, device, action),
    }
}

fn list_ports() -> Result<()> {
    let ports = HardwareSession::get_available_ports();
    if ports.is_empty() {
        println!("No Ports Found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

fn show_plan(file: PathBuf, json: bool) -> Result<()> {
    let plan = load_protocol(&file)
        .with_context(|| format!("Failed to load protocol {}", file.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{}", plan.summary());
    }
    Ok(())
}

/// Attach the simulator or open the configured serial port.
fn connect(orchestrator: &Orchestrator, settings: &Settings, device: &DeviceArgs) -> Result<()> {
    if device.simulate {
        orchestrator.with_session(|session| {
            session.attach(Box::new(SimulatedThermocycler::new()));
            Ok(())
        })?;
        return Ok(());
    }

    let Some(port) = device.port.clone().or_else(|| settings.serial.port.clone()) else {
        bail!("No serial port given; use --port, set serial.port in the config, or --simulate");
    };
    orchestrator
        .with_session(|session| session.connect(&port))
        .with_context(|| format!("Failed to connect to {}", port))?;
    Ok(())
}

fn print_update(update: &ProgressUpdate) {
    match update {
        ProgressUpdate::Step(text) => println!("▶ {}", text.replace('\t', "  ")),
        ProgressUpdate::Lid(text) => println!("  lid    {}", text),
        ProgressUpdate::Plate(text) => println!("  plate  {}", text),
        ProgressUpdate::TimeRemaining(text) => println!("  left   {}", text),
    }
}

/// Read operator keys from stdin on a plain thread: `s` skips, `q` stops.
fn spawn_operator_input(control: RunControl) {
    let spawned = std::thread::Builder::new()
        .name("helix-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "s" | "skip" => control.skip_step(),
                    "q" | "quit" | "stop" => {
                        control.emergency_stop();
                        break;
                    }
                    "" => {}
                    other => println!("Unknown input '{}': use 's' to skip, 'q' to stop", other),
                }
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "Operator input unavailable");
    }
}

async fn run_protocol(
    settings: Settings,
    file: PathBuf,
    device: DeviceArgs,
    title: String,
) -> Result<()> {
    let plan = load_protocol(&file)
        .with_context(|| format!("Failed to load protocol {}", file.display()))?;
    print!("{}", plan.summary());

    let mut orchestrator = Orchestrator::new(settings.clone());
    connect(&orchestrator, &settings, &device)?;

    let (sink, mut updates) = ChannelProgressSink::new();
    let graph = Arc::new(CsvGraphSink::new(settings.output.history_dir.clone()));
    let run = orchestrator.start_run(plan, &title, Arc::new(sink), graph)?;
    let control = run.control().clone();
    spawn_operator_input(control.clone());
    println!("Running '{}': 's' + Enter skips a step, 'q' + Enter or Ctrl-C stops", title);

    let mut finished = tokio::task::spawn_blocking(move || run.wait());
    let report = loop {
        tokio::select! {
            Some(update) = updates.recv() => print_update(&update),
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, stopping run");
                control.emergency_stop();
            }
            joined = &mut finished => break joined.context("Run worker task failed")??,
        }
    };
    drain(&mut updates);

    orchestrator.with_session(|session| {
        session.disconnect();
        Ok(())
    })?;

    println!("{}", report);
    match report.state {
        EngineState::Faulted => bail!(
            "Protocol faulted: {}",
            report.error.unwrap_or_else(|| "unknown error".into())
        ),
        _ => Ok(()),
    }
}

fn drain(updates: &mut UnboundedReceiver<ProgressUpdate>) {
    while let Ok(update) = updates.try_recv() {
        print_update(&update);
    }
}

async fn monitor(settings: Settings, device: DeviceArgs, seconds: Option<u64>) -> Result<()> {
    let mut orchestrator = Orchestrator::new(settings.clone());
    connect(&orchestrator, &settings, &device)?;

    let (sink, mut updates) = ChannelProgressSink::new();
    orchestrator.start_monitor(Arc::new(sink))?;
    info!(interval_ms = settings.monitor.interval_ms, "Monitoring temperatures");

    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(update) = updates.recv() => print_update(&update),
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
        }
    }

    orchestrator.stop_monitor();
    drain(&mut updates);
    orchestrator.with_session(|session| {
        session.disconnect();
        Ok(())
    })?;
    Ok(())
}

fn control(settings: Settings, device: DeviceArgs, action: ControlAction) -> Result<()> {
    let orchestrator = Orchestrator::new(settings.clone());
    connect(&orchestrator, &settings, &device)?;

    orchestrator
        .with_session(|session| {
            match action {
                ControlAction::OpenLid => session.open_lid()?,
                ControlAction::CloseLid => session.close_lid()?,
                ControlAction::SetPlate {
                    target,
                    hold,
                    volume,
                } => session.set_plate_temperature(target, hold, volume)?,
                ControlAction::SetLid { target } => session.set_lid_temperature(target)?,
                ControlAction::Deactivate { target } => match target {
                    DeactivateTarget::All => session.deactivate_all()?,
                    DeactivateTarget::Plate => session.deactivate_plate()?,
                    DeactivateTarget::Lid => session.deactivate_lid()?,
                    DeactivateTarget::Shaker => session.deactivate_shaker()?,
                },
                ControlAction::OpenLatch => session.open_latch()?,
                ControlAction::CloseLatch => session.close_latch()?,
                ControlAction::Shake { rpm } => session.set_shake_speed(rpm)?,
                ControlAction::Status => {
                    let lid = session.get_lid_temperature()?;
                    let plate = session.get_plate_info()?;
                    println!("lid    {} °C", lid);
                    println!("plate  {} °C", plate.temperature_celsius);
                    println!("left   {} secs", plate.seconds_remaining);
                }
            }
            session.disconnect();
            Ok(())
        })
        .context("Command failed")?;
    Ok(())
}
