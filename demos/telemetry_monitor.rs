use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};
use bushido::{BushidoDevice, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Bushido Telemetry Monitor Example");

    let mut trainer = match BushidoDevice::open().await {
        Ok(device) => device,
        Err(e) => {
            error!("❌ Failed to open the ANT stick: {}", e);
            return Err(e);
        }
    };
    let handle = trainer.handle();
    let session = tokio::spawn(async move { trainer.run().await });

    info!("🔍 Starting telemetry monitoring...");
    info!("Press Ctrl+C to stop monitoring");

    let mut monitor_interval = interval(Duration::from_secs(2));
    let start_time = Instant::now();
    let mut max_power: u16 = 0;
    let mut max_speed = 0.0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = monitor_interval.tick() => {}
        }

        let data = handle.telemetry();
        max_power = max_power.max(data.power_watts);
        if data.speed_kmh > max_speed {
            max_speed = data.speed_kmh;
        }

        let elapsed = start_time.elapsed();
        let minutes = elapsed.as_secs() / 60;
        let seconds = elapsed.as_secs() % 60;

        println!("\n📊 Telemetry ({minutes:02}:{seconds:02})");
        println!("┌─────────────────────────────────────────┐");
        println!("│ State:       {:26} │", handle.connection_state().to_string());
        println!("│ Speed:       {:8.1} km/h                │", data.speed_kmh);
        println!("│ Cadence:     {:8} rpm                 │", data.cadence_rpm);
        println!("│ Power:       {:8} W                   │", data.power_watts);
        println!("│ Heart rate:  {:8} bpm                 │", data.heart_rate_bpm);
        println!("│ Distance:    {:8.2} km                  │", f64::from(data.distance_m) / 1000.0);
        println!("│ Slope:       {:8.1} %                   │", data.slope_percent);
        println!("│ Brake temp:  {:8} °C                  │", data.brake_temp_c);
        println!("└─────────────────────────────────────────┘");

        if handle.is_paused() {
            println!("⏸️  Head unit paused");
        }

        if data.brake_temp_c > 80 {
            println!("🌡️  WARNING: Brake temperature high: {}°C", data.brake_temp_c);
        }

        if !handle.is_connected() {
            warn!("❌ Session ended");
            break;
        }
    }

    info!("🔌 Stopping session...");
    if handle.stop().is_ok() {
        match session.await {
            Ok(Ok(())) => info!("✅ Session stopped"),
            Ok(Err(e)) => error!("❌ Session failed: {}", e),
            Err(e) => error!("❌ Session task failed: {}", e),
        }
    }

    println!("\n📊 Final Summary:");
    println!(
        "  Duration: {:02}:{:02}",
        start_time.elapsed().as_secs() / 60,
        start_time.elapsed().as_secs() % 60
    );
    println!("  Max Speed: {max_speed:.1} km/h");
    println!("  Max Power: {max_power} W");

    info!("🎉 Telemetry monitoring completed!");
    Ok(())
}
