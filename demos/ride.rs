use futures::StreamExt;
use tracing::{error, info, warn};
use bushido::{
    BushidoDevice, BushidoError, Button, ConnectionState, Result, RouteProfile, TrainerEvent,
};

/// Distance skipped per left/right button press, in meters
const SEEK_STEP_M: i64 = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Bushido Ride Example");

    // A rolling 4 km route: climb, descent, flat
    let slopes: Vec<f64> = (0..200)
        .map(|i| match i {
            0..=49 => 0.0,
            50..=99 => 4.5,
            100..=149 => -3.0,
            _ => 1.0,
        })
        .collect();
    let route = RouteProfile::from_slopes(&slopes, 120.0);
    info!(
        "🗺️  Route loaded: {} segments, {:.1} km",
        route.len(),
        route.total_distance_m() as f64 / 1000.0
    );

    let mut trainer = match BushidoDevice::open().await {
        Ok(device) => device.with_route(route.clone()),
        Err(e) => {
            error!("❌ Failed to open the ANT stick: {}", e);
            return Err(e);
        }
    };
    let handle = trainer.handle();
    let mut events = Box::pin(handle.events());

    let session = tokio::spawn(async move {
        let result = trainer.run().await;
        (result, trainer)
    });

    info!("Press Ctrl+C to stop riding, left/right on the head unit to skip");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping...");
                handle.stop()?;
                break;
            }
            event = events.next() => {
                let Some(event) = event else { break };
                match event {
                    TrainerEvent::ConnectionStateChanged(ConnectionState::Disconnected) => break,
                    TrainerEvent::ConnectionStateChanged(state) => info!("🔗 {}", state),
                    TrainerEvent::Paused => info!("⏸️  Paused, start pedaling to ride"),
                    TrainerEvent::Resumed => {}
                    TrainerEvent::Button(Button::Left) => {
                        if let Err(e) = handle.seek(-SEEK_STEP_M) {
                            warn!("Seek failed: {}", e);
                        }
                    }
                    TrainerEvent::Button(Button::Right) => {
                        if let Err(e) = handle.seek(SEEK_STEP_M) {
                            warn!("Seek failed: {}", e);
                        }
                    }
                    TrainerEvent::Button(button) => info!("🔘 {} pressed", button),
                    TrainerEvent::SampleRecorded { segment, sample } => {
                        let data = sample.telemetry;
                        println!(
                            "{:5.2} km ({:5.1}%) | {:5.1} km/h | {:3} rpm | {:4} W | {:3} bpm | slope {:+.1}%",
                            sample.effective_distance_m as f64 / 1000.0,
                            route.progress_percent(sample.effective_distance_m),
                            data.speed_kmh,
                            data.cadence_rpm,
                            data.power_watts,
                            data.heart_rate_bpm,
                            data.slope_percent,
                        );
                        if segment + 1 == route.len() {
                            info!("🏁 Route finished");
                        }
                    }
                    TrainerEvent::DataUpdated(_)
                    | TrainerEvent::DistanceUpdated(_)
                    | TrainerEvent::SlopeChanged(_) => {}
                }
            }
        }
    }

    let (result, trainer) = match session.await {
        Ok(finished) => finished,
        Err(e) => {
            error!("❌ Session task failed: {}", e);
            return Err(BushidoError::Disconnected);
        }
    };
    if let Err(e) = &result {
        error!("❌ Session ended with an error: {}", e);
    }

    let samples = trainer.samples().map_or(0, |samples| samples.len());
    println!("\n📊 Ride Summary:");
    println!("  Segments recorded: {samples}");
    println!("  Final brake temperature: {}°C", trainer.telemetry().brake_temp_c);

    result
}
