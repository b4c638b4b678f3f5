// Basic device discovery example
//
// This example shows how to discover supported devices and inspect their
// channels and signals.

use smu_rs::Session;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (optional)
    env_logger::init();

    println!("SMU Device Discovery Example");
    println!("============================\n");

    println!("1. Scanning for supported devices...");
    let session = Session::new()?;
    let devices = session.available_devices();

    if devices.is_empty() {
        println!("No supported devices found. Please connect a device and try again.");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        println!(
            "  {}. {} serial {} (firmware {}, hardware rev {})",
            i + 1,
            device.info().label,
            device.serial(),
            device.fwver(),
            device.hwver()
        );
    }

    println!("\n2. Channel and signal layout of the first device:");
    let device = &devices[0];
    for channel in 0..device.info().channel_count {
        let info = device.channel_info(channel).ok_or("missing channel")?;
        println!("  Channel {} ({} signals):", info.label, info.signal_count);
        for signal in 0..info.signal_count {
            let sig = device.signal(channel, signal).ok_or("missing signal")?;
            let si = sig.info();
            println!(
                "    {}: {} to {} (resolution {})",
                si.label, si.min, si.max, si.resolution
            );
        }
    }

    println!(
        "\n3. Default sample rate: {} Hz",
        device.default_rate()
    );

    println!("\nDiscovery completed successfully!");
    Ok(())
}
