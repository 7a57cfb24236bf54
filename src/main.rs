// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// - config:     Configuration structs loaded from JSON
// - schema:     Sensor reading wire format
// - util:       Endpoint building, time helpers
// - connection: Sensor link (transport, backoff, subscribers, manager)
// - metrics:    Lock-free runtime counters
//
mod config;
mod schema;
mod util;
mod connection;
mod metrics;

use rustls::crypto::{CryptoProvider, ring};

use config::{Config, load_config};
use connection::{ConnectionManager, ConnectionState, LinkOptions, ReconnectPolicy, Subscription};
use metrics::METRICS;
use schema::SensorReading;

use std::env;
use std::time::Duration;
use tokio::time::sleep;

/// Config path used when neither a CLI argument nor the env var is given.
const DEFAULT_CONFIG_PATH: &str = "config.json";
const CONFIG_ENV: &str = "OXIMETER_CONFIG";

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize logging and the rustls crypto backend
// - Load configuration
// - Own the single ConnectionManager for the process lifetime
// - Print readings as they arrive
// - Shut the link down on Ctrl-C
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // The logger has to exist while the config loads; the config
    // can only narrow the level afterwards.
    init_logging();
    let config = load_config(&config_path)?;
    apply_log_level(&config);

    // --------------------------------------------------------
    // rustls >= 0.23 requires an explicit CryptoProvider for
    // wss:// endpoints. Installed once, before any connection.
    // --------------------------------------------------------
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        log::warn!("rustls CryptoProvider already installed");
    }

    let manager = ConnectionManager::connect(
        config.endpoint.url(),
        ReconnectPolicy::from(&config.reconnect),
        LinkOptions { log_raw: config.debug_raw() },
    );
    log::info!("Streaming sensor readings from {}", manager.endpoint());

    let _printer: Subscription = manager.subscribe(print_reading);
    log::debug!("{} subscriber(s) registered", manager.subscriber_count());

    if config.metrics.interval_secs > 0 {
        let every = Duration::from_secs(config.metrics.interval_secs);
        let state = manager.watch_state();

        tokio::spawn(async move {
            loop {
                sleep(every).await;
                log::info!(
                    "[METRICS] state={:?} {}",
                    *state.borrow(),
                    METRICS.summary(util::now_ms())
                );
            }
        });
    }

    // --------------------------------------------------------
    // Run until Ctrl-C or until the link gives up on its own
    // --------------------------------------------------------
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                log::error!("Cannot listen for Ctrl-C: {}", e);
            }
            if manager.is_connected() {
                log::info!("Closing live sensor link");
            }
            manager.disconnect();
        }
        state = manager.stopped() => match state {
            ConnectionState::Exhausted => {
                log::error!("Sensor unreachable, reconnection abandoned; no further readings will arrive");
            }
            other => log::warn!("Sensor link stopped ({:?})", other),
        },
    }

    let state = manager.stopped().await;
    manager.join().await;
    log::info!("Exiting ({:?})", state);

    Ok(())
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
}

/// Drops to info unless the config asks for debug output.
/// An explicit RUST_LOG always wins.
fn apply_log_level(config: &Config) {
    if config.debug_log() || env::var_os("RUST_LOG").is_some() {
        return;
    }
    log::set_max_level(log::LevelFilter::Info);
}

/// Console subscriber: one line per reading.
fn print_reading(reading: &SensorReading) {
    let status = reading.status.map(|s| s.as_str()).unwrap_or("-");

    println!(
        "{} SpO2={:.0}% HR={:.0}bpm quality={:.0} status={}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        reading.spo2,
        reading.hr,
        reading.hr_quality,
        status,
    );
}
