//! Gattmux Sim - run the connection core against a simulated BLE stack
//!
//! Connects a set of fake devices, polls RSSI on the ones that come up,
//! and lets the simulated stack fail, time out and drop links at the
//! configured rates. Every device event is printed as one JSON line; the
//! final per-device state and failure history follow as a JSON document.

mod transport;

use anyhow::Context;
use clap::Parser;
use gattmux_core::{ConnectFailEvent, DeviceId, DeviceState, GattmuxConfig};
use gattmux_device::DeviceSnapshot;
use gattmux_runtime::{sink, GattmuxHandle, GattmuxService};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use transport::{SimProfile, SimulatedTransport};

#[derive(Parser)]
#[command(name = "gattmux-sim")]
#[command(about = "Drive the gattmux connection core against a simulated BLE stack")]
struct Args {
    /// Number of simulated devices
    #[arg(long, short, default_value_t = 3)]
    devices: u16,

    /// How long to run (humantime, e.g. "30s", "2m")
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// JSON configuration file for the core
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// RNG seed for the simulated stack
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Chance a call fails
    #[arg(long, default_value_t = 0.2)]
    fail_rate: f64,

    /// Chance a call times out
    #[arg(long, default_value_t = 0.05)]
    timeout_rate: f64,

    /// Chance a fresh link drops later on
    #[arg(long, default_value_t = 0.1)]
    drop_rate: f64,

    /// How often to read RSSI from connected devices
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    poll: Duration,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

/// Final state of one device
#[derive(Serialize)]
struct DeviceReport {
    #[serde(flatten)]
    snapshot: DeviceSnapshot,
    history: Vec<ConnectFailEvent>,
}

fn load_config(path: &Path) -> anyhow::Result<GattmuxConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: GattmuxConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

fn device_ids(count: u16) -> anyhow::Result<Vec<DeviceId>> {
    (0..count)
        .map(|i| {
            let address = format!("C0:FF:EE:00:{:02X}:{:02X}", i >> 8, i & 0xFF);
            DeviceId::parse(&address).with_context(|| format!("building address {}", address))
        })
        .collect()
}

fn poll_rssi(handle: &GattmuxHandle, device: &DeviceId) {
    let handle = handle.clone();
    let device = device.clone();
    tokio::spawn(async move {
        match handle.read_rssi(&device).await {
            Ok(result) if result.is_success() => {
                let rssi = result.payload.first().map(|b| *b as i8);
                debug!(device = %device, ?rssi, "RSSI");
            }
            Ok(result) => debug!(device = %device, state = %result.state, "RSSI read ended"),
            Err(e) => debug!(device = %device, error = %e, "RSSI read dropped"),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GattmuxConfig::default(),
    };
    let profile = SimProfile {
        fail_rate: args.fail_rate,
        timeout_rate: args.timeout_rate,
        drop_rate: args.drop_rate,
        ..SimProfile::default()
    };
    info!(
        devices = args.devices,
        duration = %humantime::format_duration(args.duration),
        seed = args.seed,
        ?profile,
        "Starting simulation"
    );

    let (native_sink, native) = sink::channel();
    let transport = SimulatedTransport::new(profile, native_sink, args.seed);
    let (service, handle, mut events) =
        GattmuxService::new(config, transport, native).context("creating gattmux service")?;
    let service_task = tokio::spawn(service.run());

    let devices = device_ids(args.devices)?;
    for device in &devices {
        handle.connect(device).await?;
    }

    let deadline = tokio::time::sleep(args.duration);
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(args.poll);

    loop {
        tokio::select! {
            _ = &mut deadline => break,

            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event output fell behind"),
                Err(RecvError::Closed) => break,
            },

            _ = poll.tick() => {
                for device in &devices {
                    if handle.is(device, DeviceState::Initialized).await? {
                        poll_rssi(&handle, device);
                    }
                }
            }
        }
    }

    let mut report = Vec::with_capacity(devices.len());
    for snapshot in handle.snapshot() {
        let history = handle.history(&snapshot.device).await?;
        report.push(DeviceReport { snapshot, history });
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    handle.shutdown().await?;
    service_task.await.context("service task panicked")??;
    info!("Simulation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ids_are_distinct() {
        let ids = device_ids(300).unwrap();
        assert_eq!(ids.len(), 300);
        assert_eq!(ids[0].as_str(), "C0:FF:EE:00:00:00");
        assert_eq!(ids[299].as_str(), "C0:FF:EE:00:01:2B");
    }

    #[test]
    fn test_args_parse_durations() {
        let args = Args::parse_from(["gattmux-sim", "--duration", "2m", "--devices", "5"]);
        assert_eq!(args.duration, Duration::from_secs(120));
        assert_eq!(args.devices, 5);
        assert_eq!(args.poll, Duration::from_secs(2));
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let path = std::env::temp_dir().join("gattmux-sim-config-test.json");
        std::fs::write(&path, r#"{ "reconnect": { "enabled": false } }"#).unwrap();
        let config = load_config(&path).unwrap();
        assert!(!config.reconnect.enabled);
        assert_eq!(config.history.max_size, 25);
        let _ = std::fs::remove_file(&path);
    }
}
