//! Camera-session command line front end.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camera_session::{
    logging, CameraController, CameraEvent, Config, DefaultDriverProvider, EventBus, ParamKey,
    ParamValue, ParameterSet, TriggerMode,
};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;

/// Drive a machine-vision camera from the terminal
#[derive(Parser, Debug)]
#[command(name = "camera-session", version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file path
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated camera instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available cameras
    List,
    /// Connect and print device information and parameters
    Info {
        /// Device id (default: configured or first found)
        #[arg(long, short)]
        device: Option<String>,
    },
    /// Stream frames and report the frame rate
    Stream {
        /// Device id (default: configured or first found)
        #[arg(long, short)]
        device: Option<String>,
        /// How long to stream
        #[arg(long, default_value = "5")]
        seconds: u64,
        /// Parameter to apply before streaming, e.g. `gain=6.0`
        #[arg(long = "set", value_parser = parse_assignment)]
        set: Vec<(ParamKey, ParamValue)>,
        /// Restore the full capture area before applying parameters
        #[arg(long)]
        reset_roi: bool,
    },
    /// Stream in software trigger mode and fire triggers
    Trigger {
        /// Device id (default: configured or first found)
        #[arg(long, short)]
        device: Option<String>,
        /// Number of triggers to fire
        #[arg(long, default_value = "5")]
        count: u32,
    },
}

fn parse_assignment(raw: &str) -> Result<(ParamKey, ParamValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key: ParamKey = key.trim().parse()?;
    let value = key.parse_value(value).map_err(|err| err.to_string())?;
    Ok((key, value))
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if args.simulate {
        config.camera.simulation = true;
    }
    if let Err(err) = logging::init(&config.logging) {
        eprintln!("Warning: logging not initialized: {err}");
    }

    let bus = Arc::new(EventBus::new());
    let events = bus.subscribe();
    let controller = CameraController::new(
        Arc::new(DefaultDriverProvider),
        bus,
        config.controller_options(),
    )?;

    let pick = |device: Option<String>| device.unwrap_or_else(|| config.device_id().to_owned());

    match args.command {
        Command::List => list(&controller),
        Command::Info { device } => info(&controller, &pick(device)),
        Command::Stream {
            device,
            seconds,
            set,
            reset_roi,
        } => stream(
            &controller,
            &events,
            &pick(device),
            Duration::from_secs(seconds),
            reset_roi,
            set.into_iter().collect(),
        ),
        Command::Trigger { device, count } => trigger(&controller, &events, &pick(device), count),
    }
}

fn list(controller: &CameraController) -> Result<(), Box<dyn Error>> {
    let devices = controller.enumerate_devices()?;
    if devices.is_empty() {
        println!("No cameras found");
    }
    for device in devices {
        println!("{device}");
    }
    Ok(())
}

fn print_parameters(params: &ParameterSet) {
    for (key, value) in params.iter() {
        println!("  {key:<22} {value}");
    }
}

fn info(controller: &CameraController, device: &str) -> Result<(), Box<dyn Error>> {
    controller.connect(device)?;
    let summary = controller.status_summary();
    println!(
        "Device: {}",
        summary.current_device_id.as_deref().unwrap_or("?")
    );
    for (key, value) in controller.device_info()? {
        println!("  {key:<22} {value}");
    }
    println!("Parameters:");
    print_parameters(&summary.parameters);
    controller.disconnect()?;
    Ok(())
}

fn stream(
    controller: &CameraController,
    events: &Receiver<CameraEvent>,
    device: &str,
    duration: Duration,
    reset_roi: bool,
    requested: ParameterSet,
) -> Result<(), Box<dyn Error>> {
    controller.connect(device)?;
    if reset_roi {
        controller.reset_roi()?;
    }
    if !requested.is_empty() {
        controller.apply_parameters(&requested)?;
        println!("Applied parameters:");
        print_parameters(&controller.status_summary().parameters);
    }

    controller.start_streaming()?;
    let deadline = Instant::now() + duration;
    let mut frames = 0u64;
    let mut last_counter = None;

    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(remaining) {
            Ok(CameraEvent::NewFrameAvailable(frame)) => {
                frames += 1;
                last_counter = Some(frame.metadata.counter);
            }
            Ok(CameraEvent::FpsUpdated(fps)) => {
                println!(
                    "fps {fps:6.2}  frames {frames}  last counter {}",
                    last_counter.map_or_else(|| "-".to_owned(), |c| c.to_string())
                );
            }
            Ok(CameraEvent::ErrorOccurred { title, message }) => {
                eprintln!("{title}: {message}");
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    controller.stop_streaming()?;
    println!("Received {frames} frames");
    controller.disconnect()?;
    Ok(())
}

fn trigger(
    controller: &CameraController,
    events: &Receiver<CameraEvent>,
    device: &str,
    count: u32,
) -> Result<(), Box<dyn Error>> {
    controller.connect(device)?;
    controller.apply_parameters(
        &ParameterSet::new().with(
            ParamKey::TriggerMode,
            ParamValue::Trigger(TriggerMode::Software),
        ),
    )?;
    controller.start_streaming()?;

    let mut received = 0u32;
    for index in 1..=count {
        controller.trigger_software()?;
        let deadline = Instant::now() + Duration::from_secs(1);
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            if let Ok(CameraEvent::NewFrameAvailable(frame)) = events.recv_timeout(remaining) {
                received += 1;
                println!(
                    "trigger {index}: frame {} ({}x{})",
                    frame.metadata.counter, frame.width, frame.height
                );
                break;
            }
        }
    }

    controller.stop_streaming()?;
    println!("Received {received} of {count} triggered frames");
    controller.disconnect()?;
    Ok(())
}
