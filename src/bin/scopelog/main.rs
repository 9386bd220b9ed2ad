//! Interactive capture driver.
//!
//! Brings the pipeline up, connects to a device (from `--port`, the
//! full-screen picker, or the simulator), then takes line commands on
//! stdin:
//!
//! ```text
//! register <id>   make <id> the participant new sessions belong to
//! start           begin a recording session
//! pause           hold recording without ending the session
//! resume          pick recording back up
//! end             finish the session, flush, and back it up
//! status          show link and recorder state
//! quit            end any open session and exit
//! ```
//!
//! Pipeline events are echoed through the logger; run with `RUST_LOG=info`
//! to watch the link and the recorder move.

use clap::Parser;
use log::{error, info, warn};
use scopelog::{
    args::CaptureArgs,
    config::CaptureConfig,
    events::PipelineEvent,
    gui::device_selector,
    link::{PortOpener, SystemPorts},
    pipeline::Pipeline,
    sim::{SimulatedPorts, SIM_PORT_NAME},
};
use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
    thread,
};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CaptureArgs::parse();

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
            println!("no device selected, nothing to do");
            return Ok(());
        }
    };
    pipeline.connect(&port)?;
    println!("capturing from {}", port.display());

    // Keep the event feed flowing into the logger from its own thread so a
    // blocked prompt never backs the subscription up.
    let events = pipeline.subscribe();
    let _event_thread = thread::spawn(move || {
        for event in events {
            match event {
                PipelineEvent::ConnectionStateChanged(state) => info!("link is now {}", state),
                PipelineEvent::RecordingStateChanged(state) => info!("recorder is now {}", state),
                PipelineEvent::ParseError { detail, suppressed } if suppressed > 0 => {
                    warn!("bad frame: {} ({} more suppressed)", detail, suppressed);
                }
                PipelineEvent::ParseError { detail, .. } => warn!("bad frame: {}", detail),
                PipelineEvent::PersistenceError(detail) => {
                    error!("persistence trouble: {}", detail);
                }
                PipelineEvent::BackupCompleted(path) => info!("backed up to {}", path.display()),
                PipelineEvent::BackupFailed(detail) => warn!("backup failed: {}", detail),
                PipelineEvent::PortsChanged(ports) => info!("devices now: {:?}", ports),
                PipelineEvent::SampleReceived(_) => {}
            }
        }
    });

    if let Some(participant) = &args.participant {
        pipeline.register_participant(participant)?;
        println!("participant {} registered", participant);
    }

    print_help();
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }

        let mut words = line.split_whitespace();
        match words.next() {
            Some("register") => match words.next() {
                Some(id) => match pipeline.register_participant(id) {
                    Ok(()) => println!("participant {} registered", id),
                    Err(e) => println!("cannot register: {}", e),
                },
                None => println!("usage: register <participant-id>"),
            },
            Some("start") => match pipeline.start_session() {
                Ok(id) => println!("recording session {}", id),
                Err(e) => println!("cannot start: {}", e),
            },
            Some("pause") => match pipeline.pause() {
                Ok(()) => println!("paused"),
                Err(e) => println!("cannot pause: {}", e),
            },
            Some("resume") => match pipeline.resume() {
                Ok(()) => println!("recording"),
                Err(e) => println!("cannot resume: {}", e),
            },
            Some("end") => match pipeline.end_session() {
                Ok(ended) if ended.clean => println!(
                    "session {} saved to {}",
                    ended.session_id,
                    ended.data_path.display()
                ),
                Ok(ended) => println!(
                    "session {} closed with errors, check {}",
                    ended.session_id,
                    ended.data_path.display()
                ),
                Err(e) => println!("cannot end: {}", e),
            },
            Some("status") => print_status(&pipeline),
            Some("help") => print_help(),
            Some("quit") | Some("exit") | Some("q") => break,
            Some(other) => println!("unknown command {:?}, try help", other),
            None => {}
        }
    }

    pipeline.shutdown();
    Ok(())
}

/// Settle which device to capture from: the flag wins, the simulator names
/// itself, and otherwise the picker runs over whatever is plugged in.
fn pick_port(pipeline: &Pipeline, args: &CaptureArgs) -> Result<Option<PathBuf>, Box<dyn Error>> {
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

fn print_status(pipeline: &Pipeline) {
    println!("link        {}", pipeline.connection_state());
    println!("recorder    {}", pipeline.recorder_state());
    match pipeline.participant() {
        Some(id) => println!("participant {}", id),
        None => println!("participant (none)"),
    }
}

fn print_help() {
    println!("commands:");
    println!("  register <id>   make <id> the participant new sessions belong to");
    println!("  start           begin a recording session");
    println!("  pause           hold recording without ending the session");
    println!("  resume          pick recording back up");
    println!("  end             finish the session, flush, and back it up");
    println!("  status          show link and recorder state");
    println!("  quit            end any open session and exit");
}
