use remotethermo::{Engine, EngineConfig, HttpTransport, UnitMode};
use std::env;
use std::time::Duration;

/// Usage: REMOTETHERMO_USER=... REMOTETHERMO_PASSWORD=... monitor [zones] [--auto-units]
#[tokio::main]
async fn main() -> remotethermo::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let username = env::var("REMOTETHERMO_USER").expect("REMOTETHERMO_USER not set");
    let password = env::var("REMOTETHERMO_PASSWORD").expect("REMOTETHERMO_PASSWORD not set");

    let mut config = EngineConfig::new(username, password);
    config.gateway = env::var("REMOTETHERMO_GATEWAY").ok();
    if let Some(zones) = args.get(1).and_then(|z| z.parse().ok()) {
        config.zones = zones;
    }
    if args.iter().any(|a| a == "--auto-units") {
        config.units = UnitMode::Auto;
    }

    let engine = Engine::builder(config, HttpTransport::new()?)
        .on_sensors_changed(|change| {
            for (key, sensor) in &change.changes {
                match &sensor.value {
                    Some(value) => println!(
                        "{key}: {value}{}",
                        sensor.unit.as_deref().map(|u| format!(" {u}")).unwrap_or_default()
                    ),
                    None => println!("{key}: -"),
                }
            }
        })
        .on_status_changed(|change| {
            let s = &change.current;
            println!(
                "available: {} | ch: {:?} | dhw: {} | setting: {}",
                s.available, s.ch_available, s.dhw_available, s.setting_in_progress
            );
        })
        .build()?;

    println!("Starting sync engine...");
    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    engine.stop();
    // Let in-flight work settle before exit.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
