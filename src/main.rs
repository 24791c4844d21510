//! Setu VSM daemon - bridges simulated vehicles to UCS servers

use setu_vsm::devices::SimVehicle;
use setu_vsm::{Config, Error, Result, UcsBroker};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Setu VSM v{} starting...", env!("CARGO_PKG_VERSION"));

    // Get config path from args or default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/setu-vsm.toml".to_string());

    log::info!("Using config: {}", config_path);
    let config = Config::load(&config_path)?;

    let mut broker = UcsBroker::start(&config)?;
    if config.ucs.disable {
        log::warn!("UCS core is disabled; no server will be able to connect");
    } else {
        log::info!(
            "UCS listener on {}:{}",
            config.ucs.local_listening_address,
            broker.local_port()
        );
    }

    // Spawn and register the configured vehicles
    let messenger = broker.messenger();
    let mut vehicles = Vec::new();
    for device_config in &config.devices {
        let vehicle = SimVehicle::spawn(device_config, messenger.clone())?;
        broker.register_device(vehicle.clone())?;
        log::info!(
            "Registered vehicle \"{}\" (session {})",
            device_config.name,
            device_config.session_id
        );
        vehicles.push((device_config.session_id, vehicle));
    }

    // Set up shutdown signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Config(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!("Setu VSM running. Press Ctrl-C to stop.");
    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    // Shutdown
    log::info!("Shutting down...");
    for (session_id, vehicle) in vehicles {
        if let Err(e) = broker.unregister_device(session_id) {
            log::error!("Failed to unregister vehicle {}: {}", session_id, e);
        }
        vehicle.stop();
    }
    broker.stop();

    log::info!("Setu VSM stopped");
    Ok(())
}
