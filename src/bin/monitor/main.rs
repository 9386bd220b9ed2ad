//! Read-only dashboard over a live capture device.
//!
//! Connects like the capture binary does but only watches: connection
//! state, recorder state, the latest voltages, and rolling statistics,
//! redrawn four times a second. Press `q` to leave.

mod gui;

use clap::Parser;
use scopelog::{
    args::MonitorArgs,
    config::CaptureConfig,
    gui::device_selector,
    link::{PortOpener, SystemPorts},
    pipeline::Pipeline,
    sim::{SimulatedPorts, SIM_PORT_NAME},
};
use std::{error::Error, path::PathBuf, sync::Arc};

use gui::engage_gui;

fn main() -> Result<(), Box<dyn Error>> {
    // No logger here, stray stderr writes would tear the alternate screen.
    let args = MonitorArgs::parse();

    let mut config = match &args.config {
        Some(path) => CaptureConfig::from_path(path)?,
        None => CaptureConfig::default(),
    };
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }

    let opener: Arc<dyn PortOpener> = if args.simulate {
        Arc::new(SimulatedPorts::default())
    } else {
        Arc::new(SystemPorts)
    };
    let mut pipeline = Pipeline::new(config, opener)?;

    let port = match pick_port(&pipeline, &args)? {
        Some(port) => port,
        None => {
            println!("no device selected, nothing to watch");
            return Ok(());
        }
    };

    // Subscribe before connecting so the first state changes show up.
    let events = pipeline.subscribe();
    pipeline.connect(&port)?;

    engage_gui(events)?;

    pipeline.shutdown();
    Ok(())
}

fn pick_port(pipeline: &Pipeline, args: &MonitorArgs) -> Result<Option<PathBuf>, Box<dyn Error>> {
    if let Some(port) = &args.port {
        return Ok(Some(port.clone()));
    }
    if args.simulate {
        return Ok(Some(PathBuf::from(SIM_PORT_NAME)));
    }
    let ports = pipeline.list_ports()?;
    if ports.is_empty() {
        println!("no serial devices found");
        return Ok(None);
    }
    Ok(device_selector(ports)?)
}
