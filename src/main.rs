use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::info;

use crate::bus::Bus;
use crate::config::{unicode_vars, Config};
use crate::exporter::{Metrics, MetricsSink};
use crate::i2cdev::I2cDevBus;
use crate::poller::{MonotonicClock, PollingLoop};
use crate::psu::PsuMonitor;
use crate::report::{ReportFormat, ReportSink};
use crate::sim::{SimulatedBus, SimulatedPsu};

mod bus;
mod channel;
mod config;
mod decode;
mod exporter;
mod i2cdev;
mod logging;
mod poller;
mod psu;
mod report;
mod serial;
mod sim;
mod table_types;
#[cfg(test)]
mod test_utils;

/// Polls PSU telemetry controllers over I2C, prints a report per PSU and
/// exports the readings to Prometheus.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON config file. Defaults to the per-user config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll simulated PSUs instead of the I2C bus.
    #[arg(long)]
    simulate: bool,

    #[arg(long, value_enum)]
    format: Option<ReportFormat>,

    /// Metrics listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,

    #[arg(long)]
    no_exporter: bool,
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = Config::load(args.config.as_deref()).map_err(|e| e.to_string())?;
    config
        .apply_env(unicode_vars(std::env::vars_os()))
        .map_err(|e| e.to_string())?;

    if let Some(format) = args.format {
        config.format = format;
    }
    if let Some(listen) = args.listen {
        config.exporter.listen = listen;
    }
    if args.no_exporter {
        config.exporter.enabled = false;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn open_bus(config: &Config, simulate: bool) -> Result<Box<dyn Bus + Send>, String> {
    let mut bus: Box<dyn Bus + Send> = if simulate {
        let mut bus = SimulatedBus::new();
        for (n, device) in config.devices.iter().enumerate() {
            let watts = 350 + 25 * n as u16;
            bus = bus.with_device(device.address, SimulatedPsu::healthy(38 + n as u8, watts));
        }
        info!("Using simulated bus with {} PSUs", config.devices.len());
        Box::new(bus)
    } else {
        Box::new(I2cDevBus::open(&config.bus_path).map_err(|e| e.to_string())?)
    };
    bus.set_clock(config.bus_clock_hz);
    Ok(bus)
}

fn report_sink(config: &Config) -> Result<Box<dyn ReportSink + Send>, String> {
    match &config.report_device {
        Some(path) => {
            let tty = serial::open(path, config.report_baud)
                .map_err(|e| format!("Can't open report device {}: {}", path.display(), e))?;
            info!("Writing reports to {} at {} baud", path.display(), config.report_baud);
            Ok(report::sink_for(config.format, tty))
        }
        None => Ok(report::sink_for(config.format, std::io::stdout())),
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();
    let config = load_config(&args)?;
    logging::init(config.level().map_err(|e| e.to_string())?, config.log_file.as_deref())
        .map_err(|e| format!("Can't set up logging: {}", e))?;

    info!("PSU monitor starting, polling every {}", humantime::format_duration(config.poll_interval));
    for device in &config.devices {
        info!("PSU #{} at {:#04x}", device.index, device.address);
    }

    let bus = open_bus(&config, args.simulate)?;
    let monitors = config
        .devices
        .iter()
        .map(|device| PsuMonitor::new(device.index, device.address))
        .collect();
    let mut poller = PollingLoop::new(bus, monitors, MonotonicClock::new(), config.poll_interval);
    poller.add_sink(report_sink(&config)?);

    if config.exporter.enabled {
        let metrics = Arc::new(Metrics::new());
        let listener = exporter::bind(config.exporter.listen)
            .await
            .map_err(|e| format!("Can't listen on {}: {}", config.exporter.listen, e))?;
        poller.add_sink(Box::new(MetricsSink::new(metrics.clone())));
        tokio::spawn(exporter::sweep_stale(
            metrics.clone(),
            config.exporter.sweep_interval,
            config.exporter.staleness_timeout,
        ));
        tokio::spawn(exporter::serve(listener, metrics));
    } else {
        info!("Metrics exporter disabled");
    }

    let running = Arc::new(AtomicBool::new(true));
    let polling = std::thread::spawn({
        let running = running.clone();
        move || poller.run(&running)
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Can't wait for Ctrl-C: {}", e))?;
    info!("Shutting down");
    running.store(false, Ordering::Relaxed);
    polling
        .join()
        .map_err(|_| "Polling thread panicked".to_string())?;
    Ok(())
}
