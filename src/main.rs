//! Command-line front end for the rf-link control core.
//!
//! Stands in for the graphical operator interface: connects to a
//! synthesizer, prints live status lines, optionally runs one sweep, and
//! disconnects cleanly on Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use rf_link::config::Settings;
use rf_link::error::{RfError, RfResult};
use rf_link::messages::CommandOp;
use rf_link::session::RfLink;
use rf_link::sweep::{SweepPlan, SweepState};
use rf_link::transport::serial::available_ports;

#[derive(Parser, Debug)]
#[command(name = "rf_link", about = "Serial control link for a PLL synthesizer")]
struct Cli {
    /// Serial port (e.g. /dev/ttyUSB0, COM3). Defaults to the first port
    /// the OS reports.
    #[arg(long)]
    port: Option<String>,

    /// List visible serial ports and exit.
    #[arg(long)]
    list_ports: bool,

    /// TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the effective settings as TOML and exit.
    #[arg(long)]
    show_config: bool,

    /// Override the configured baud rate.
    #[arg(long)]
    baud: Option<u32>,

    /// Run one sweep, given as start_hz:stop_hz:step_hz:dwell_ms.
    #[arg(long)]
    sweep: Option<String>,
}

fn parse_sweep(spec: &str) -> RfResult<SweepPlan> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 4 {
        return Err(RfError::InvalidPlan(
            "expected start_hz:stop_hz:step_hz:dwell_ms".into(),
        ));
    }
    let hz = |s: &str| -> RfResult<f64> {
        s.parse()
            .map_err(|_| RfError::InvalidPlan(format!("not a number: '{s}'")))
    };
    let dwell_ms: u64 = parts[3].parse().map_err(|_| {
        RfError::InvalidPlan(format!("not a millisecond count: '{}'", parts[3]))
    })?;
    Ok(SweepPlan {
        start_hz: hz(parts[0])?,
        stop_hz: hz(parts[1])?,
        step_hz: hz(parts[2])?,
        dwell: Duration::from_millis(dwell_ms),
    })
}

#[tokio::main]
async fn main() -> RfResult<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.list_ports {
        for name in available_ports()? {
            println!("{name}");
        }
        return Ok(());
    }

    let mut settings = match &cli.config {
        Some(path) => Settings::from_path(path)?,
        None => Settings::default(),
    };
    if let Some(baud) = cli.baud {
        settings.serial.baud_rate = baud;
    }

    if cli.show_config {
        match toml::to_string_pretty(&settings) {
            Ok(rendered) => print!("{rendered}"),
            Err(err) => log::error!("Could not render settings: {}", err),
        }
        return Ok(());
    }

    let port = match cli.port {
        Some(port) => port,
        None => available_ports()?
            .into_iter()
            .next()
            .ok_or_else(|| RfError::Connection("no serial ports detected".into()))?,
    };

    log::info!("Connecting to {}", port);
    let link = RfLink::open_serial(&port, settings).await?;
    println!("Connected to {port}");

    // Live status printer.
    let mut snapshots = link.subscribe_snapshots();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let Some(snapshot) = snapshots.borrow_and_update().clone() else {
                continue;
            };
            println!(
                "[device] {:.3} MHz  locked={}  flags=0x{:02X}",
                snapshot.frequency_hz / 1e6,
                snapshot.locked,
                snapshot.error_flags
            );
        }
    });

    let mut sweep_states = link.subscribe_sweep_state();
    if let Some(spec) = &cli.sweep {
        let plan = parse_sweep(spec)?;
        link.submit(CommandOp::StartSweep(plan))?;
    }

    // Run until Ctrl-C, or until a requested sweep finishes.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, disconnecting...");
                break;
            }
            changed = sweep_states.changed(), if cli.sweep.is_some() => {
                if changed.is_err() {
                    break;
                }
                match *sweep_states.borrow_and_update() {
                    SweepState::Completed => {
                        println!("Sweep complete.");
                        break;
                    }
                    SweepState::Aborted => {
                        println!("Sweep aborted.");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    link.shutdown().await?;
    println!("Disconnected.");
    Ok(())
}
