// Device calibration utility
//
// Displays, resets or writes device calibration, and can walk an operator
// through producing a calibration file with an external reference meter.

use clap::Parser;
use smu_rs::{CalPoint, CalibrationFile, Device, Session, BLOCK_LABELS};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "calibration",
    about = "Display, reset, write or create device calibration"
)]
struct Args {
    /// Display the stored calibration (default)
    #[arg(short = 'd', long = "display", conflicts_with_all = ["reset", "write", "create"])]
    display: bool,

    /// Reset the calibration to factory defaults
    #[arg(short = 'r', long = "reset", conflicts_with_all = ["write", "create"])]
    reset: bool,

    /// Write a calibration file to the device
    #[arg(short = 'w', long = "write", value_name = "PATH", conflicts_with = "create")]
    write: Option<PathBuf>,

    /// Interactively produce a calibration file
    #[arg(short = 'c', long = "create", value_name = "PATH")]
    create: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::new()?;
    let devices = session.available_devices();
    let device = match devices.as_slice() {
        [device] => Arc::clone(device),
        [] => return Err("no supported device attached".into()),
        more => {
            return Err(format!(
                "expected exactly one attached device, found {}",
                more.len()
            )
            .into())
        }
    };

    if args.reset {
        device.write_calibration(None)?;
        println!("Calibration reset to factory defaults.");
    } else if let Some(path) = &args.write {
        device.write_calibration(Some(path.as_path()))?;
        println!("Calibration from {} written to device.", path.display());
    } else if let Some(path) = &args.create {
        let file = create_calibration(&device)?;
        file.save(path)?;
        println!("Calibration file written to {}.", path.display());
        println!("Use -w {} to store it on the device.", path.display());
    } else {
        display_calibration(&device)?;
    }
    Ok(())
}

fn display_calibration(device: &Device) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "Calibration of {} (serial {}):",
        device.info().label,
        device.serial()
    );
    let triples = device.calibration()?;
    for (label, triple) in BLOCK_LABELS.iter().zip(triples.iter()) {
        println!(
            "  {:<22} offset {:>8.4}  gain+ {:>7.4}  gain- {:>7.4}",
            label, triple.offset, triple.gain_pos, triple.gain_neg
        );
    }
    Ok(())
}

fn create_calibration(device: &Device) -> Result<CalibrationFile, Box<dyn std::error::Error>> {
    println!("Interactive Calibration");
    println!("=======================");
    println!(
        "\nDevice {} serial {}. For every step, connect the requested",
        device.info().label,
        device.serial()
    );
    println!("reference and enter the device reading alongside the value shown");
    println!("by your reference meter.");

    let mut blocks = Vec::with_capacity(BLOCK_LABELS.len());
    for label in BLOCK_LABELS {
        // Current signals are bipolar and get a third, negative point.
        let bipolar = label.ends_with('I');
        blocks.push(collect_block(label, bipolar)?);
    }
    Ok(CalibrationFile::from_blocks(blocks)?)
}

fn collect_block(label: &str, bipolar: bool) -> Result<Vec<CalPoint>, io::Error> {
    println!("\n=== {} ===", label);
    let mut points = Vec::new();

    println!("1. Zero point: apply the zero-level reference");
    wait_for_enter()?;
    points.push(read_point()?);

    println!("2. Positive full scale: apply the positive reference");
    wait_for_enter()?;
    points.push(read_point()?);

    if bipolar {
        println!("3. Negative full scale: apply the negative reference");
        wait_for_enter()?;
        points.push(read_point()?);
    }

    Ok(points)
}

fn read_point() -> Result<CalPoint, io::Error> {
    let measured = read_float("   Device reading: ")?;
    let reference = read_float("   Reference meter value: ")?;
    Ok(CalPoint {
        measured,
        reference,
    })
}

/// Prompt until the operator enters a valid number. Malformed input
/// re-prompts instead of aborting.
fn read_float(prompt: &str) -> Result<f64, io::Error> {
    loop {
        print!("{}", prompt);
        io::stdout().flush()?;
        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "input closed",
            ));
        }
        match input.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => return Ok(value),
            _ => println!("   Not a valid number, try again."),
        }
    }
}

fn wait_for_enter() -> Result<(), io::Error> {
    print!("   Press Enter when ready...");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(())
}
