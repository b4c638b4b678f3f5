// Streaming data acquisition example
//
// This example sources a voltage ramp on channel A while measuring on both
// channels, then reports basic statistics about the captured samples.

use smu_rs::{Mode, Session};
use std::time::Duration;

const SAMPLES: u64 = 20_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("SMU Data Acquisition Example");
    println!("============================\n");

    let session = Session::new()?;
    let failed = session.add_all()?;
    if failed > 0 {
        println!("Warning: {} device(s) could not be added", failed);
    }
    let devices = session.devices();
    if devices.is_empty() {
        println!("No supported devices found. Please connect a device and try again.");
        return Ok(());
    }
    println!("Capturing from {} device(s)\n", devices.len());

    // Channel A sources a voltage and measures current, channel B stays
    // high impedance and just measures voltage.
    for device in &devices {
        device.set_mode(0, Mode::SourceVoltage)?;
        device.set_mode(1, Mode::Disabled)?;
    }
    session.configure(100_000)?;

    // Queue a 0..5V ramp for channel A before starting the stream.
    let ramp: Vec<f32> = (0..1000).map(|i| i as f32 * 5.0 / 999.0).collect();
    for device in &devices {
        device.write(&ramp, 0, Duration::from_millis(100))?;
    }

    println!("1. Running a bounded capture of {} samples...", SAMPLES);
    session.start(SAMPLES)?;

    let mut rows = Vec::new();
    for device in &devices {
        rows.clear();
        let mut total = 0usize;
        while total < SAMPLES as usize {
            match device.read(&mut rows, SAMPLES as usize - total, Duration::from_millis(500)) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    println!("   {}: stream fault: {}", device.serial(), e);
                    break;
                }
            }
        }
        println!("   {}: captured {} rows", device.serial(), total);
        print_summary(&rows);
    }

    session.end();
    println!("\n2. Capture finished (cancelled: {})", session.cancelled());

    Ok(())
}

// Helper function to print basic statistics about captured rows
fn print_summary(rows: &[[f32; 4]]) {
    if rows.is_empty() {
        return;
    }
    // Lane 0 is channel A's measured quantity, lane 2 channel B's.
    for (lane, label) in [(0usize, "A measured"), (2usize, "B measured")] {
        let values: Vec<f32> = rows.iter().map(|r| r[lane]).collect();
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        println!(
            "   {}: {:.3} to {:.3} (mean {:.3})",
            label, min, max, mean
        );
    }
}
