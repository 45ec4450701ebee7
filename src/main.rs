//! CrowdSense CLI
//!
//! Command-line interface for the CrowdSense congestion engine.

use chrono::Utc;
use clap::{Parser, Subcommand};
use crowdsense_engine::collector::{
    CollectorConfig, FixedLocation, GeoPoint, ReplayCollector, StaticNetwork,
};
use crowdsense_engine::core::{format_local, JsonlSink, MemorySink, ResultSink};
use crowdsense_engine::engine::{self, now_ms, spawn_ingest_pump, EpochOutcome, Orchestrator};
use crowdsense_engine::reports::{CrowdReport, MemoryReportStore, ReportStore, SubmitError};
use crowdsense_engine::stats::create_shared_stats_with_persistence;
use crowdsense_engine::{CongestionLevel, Config, StoreConfig, PRIVACY_DECLARATION, VERSION};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "gateway")]
use crowdsense_engine::gateway::{GatewayConfig, HttpReportStore};

/// Listing window of the `reports` dashboard.
const DASHBOARD_WINDOW_MS: i64 = 60 * 60 * 1000;

#[derive(Parser)]
#[command(name = "crowdsense")]
#[command(version = VERSION)]
#[command(about = "Congestion and posture estimation from motion sensing and crowd reports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine, printing one line per epoch
    Start {
        /// JSON-lines trace of sensor events to replay
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Pace replayed events by their timestamps
        #[arg(long)]
        realtime: bool,

        /// Current network name (omit when unknown)
        #[arg(long)]
        ssid: Option<String>,

        /// Current latitude
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,

        /// Current longitude
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,

        /// Serve the local HTTP surface on this port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Submit a congestion report (Low, Medium or High)
    Report {
        level: String,

        #[arg(long)]
        ssid: Option<String>,

        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,

        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
    },

    /// List reports from the last hour, newest first
    Reports,

    /// Show configuration and cumulative statistics
    Status,

    /// Show or change configuration
    Config {
        /// Use a remote report store at this base URL
        #[arg(long, requires = "token")]
        store_url: Option<String>,

        /// Bearer token for the remote report store
        #[arg(long)]
        token: Option<String>,

        /// Switch back to the in-process report store
        #[arg(long, conflicts_with = "store_url")]
        memory_store: bool,

        /// IANA timezone for report times
        #[arg(long)]
        timezone: Option<String>,
    },

    /// Show the data declaration
    Privacy,
}

/// Run `$body` with `$store` bound to the configured report store.
macro_rules! with_store {
    ($config:expr, $store:ident => $body:expr) => {
        match $config.store.clone() {
            StoreConfig::Memory => {
                let $store = Arc::new(MemoryReportStore::new());
                $body
            }
            #[cfg(feature = "gateway")]
            StoreConfig::Http { base_url, token } => {
                match HttpReportStore::new(GatewayConfig::new(base_url, token)) {
                    Ok(store) => {
                        let $store = Arc::new(store);
                        $body
                    }
                    Err(e) => {
                        eprintln!("Error: {e}");
                        std::process::exit(1);
                    }
                }
            }
            #[cfg(not(feature = "gateway"))]
            StoreConfig::Http { .. } => {
                eprintln!("Error: a remote report store is configured, but this build lacks the gateway feature");
                std::process::exit(1);
            }
        }
    };
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crowdsense_engine=info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: could not start async runtime: {e}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Start {
            replay,
            realtime,
            ssid,
            lat,
            lon,
            port,
        } => {
            let location = location_from(lat, lon);
            runtime.block_on(cmd_start(replay, realtime, ssid, location, port));
        }
        Commands::Report {
            level,
            ssid,
            lat,
            lon,
        } => {
            let location = location_from(lat, lon);
            runtime.block_on(cmd_report(&level, ssid, location));
        }
        Commands::Reports => {
            runtime.block_on(cmd_reports());
        }
        Commands::Status => {
            cmd_status();
        }
        Commands::Config {
            store_url,
            token,
            memory_store,
            timezone,
        } => {
            runtime.block_on(cmd_config(store_url, token, memory_store, timezone));
        }
        Commands::Privacy => {
            cmd_privacy();
        }
    }
}

fn location_from(lat: Option<f64>, lon: Option<f64>) -> Option<GeoPoint> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
        _ => None,
    }
}

fn load_config() -> Config {
    match Config::load_or_init() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load config, using defaults: {e}");
            Config::default()
        }
    }
}

fn open_sink(config: &Config) -> Arc<dyn ResultSink> {
    match JsonlSink::open(config.records_path()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            eprintln!("Warning: Could not open record log, records will not be kept: {e}");
            Arc::new(MemorySink::new())
        }
    }
}

async fn cmd_start(
    replay: Option<PathBuf>,
    realtime: bool,
    ssid: Option<String>,
    location: Option<GeoPoint>,
    port: Option<u16>,
) {
    let mut config = load_config();

    println!("CrowdSense Engine v{VERSION}");
    println!();

    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    println!("Configuration:");
    println!("  Epoch duration: {}ms", config.epoch_duration.as_millis());
    println!("  Device ID: {}", config.device_id);
    println!("  Network: {}", ssid.as_deref().unwrap_or("Unknown"));
    match location {
        Some(p) => println!("  Location: {:.5}, {:.5}", p.latitude, p.longitude),
        None => println!("  Location: unavailable"),
    }
    match &replay {
        Some(path) => println!("  Replaying: {path:?}{}", if realtime { " (realtime)" } else { "" }),
        None => println!("  Replaying: nothing (no samples will arrive)"),
    }
    println!("  Records: {:?}", config.records_path());
    #[cfg(not(feature = "server"))]
    if port.is_some() {
        eprintln!("Warning: --port ignored (server feature not enabled at compile time)");
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let stats = create_shared_stats_with_persistence(config.stats_path());
    let sink = open_sink(&config);
    let network = Arc::new(StaticNetwork::new(ssid.as_deref()));

    with_store!(config, store => {
        let (handle, task) = engine::spawn(
            &config,
            store,
            Arc::new(FixedLocation(location)),
            network,
            sink,
            Arc::clone(&stats),
        );

        let mut collector = ReplayCollector::new(CollectorConfig {
            replay_path: replay,
            realtime,
        });
        if let Err(e) = collector.start() {
            eprintln!("Error starting collector: {e}");
            task.shutdown().await;
            std::process::exit(1);
        }

        let pump_running = Arc::new(AtomicBool::new(true));
        let pump = spawn_ingest_pump(
            collector.receiver().clone(),
            handle.ingestor(),
            Arc::clone(&pump_running),
        );

        #[cfg(feature = "server")]
        let server_shutdown = match port {
            Some(port) => {
                let server_config = crowdsense_engine::server::ServerConfig::new(port);
                match crowdsense_engine::server::run(server_config, handle.clone()).await {
                    Ok((addr, shutdown_tx)) => {
                        println!("Serving on http://{addr}");
                        Some(shutdown_tx)
                    }
                    Err(e) => {
                        eprintln!("Warning: Could not start server: {e}");
                        None
                    }
                }
            }
            None => None,
        };

        let running = Arc::new(AtomicBool::new(true));
        ctrlc_handler(Arc::clone(&running));

        let mut latest = handle.watch_latest();
        while running.load(Ordering::SeqCst) {
            match tokio::time::timeout(Duration::from_millis(200), latest.changed()).await {
                Ok(Ok(())) => {
                    let outcome = latest.borrow_and_update().clone();
                    if let Some(outcome) = outcome {
                        print_outcome(&outcome, &config);
                    }
                }
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }

        println!();
        println!("Stopping...");

        #[cfg(feature = "server")]
        if let Some(shutdown_tx) = server_shutdown {
            let _ = shutdown_tx.send(());
        }

        collector.stop();
        pump_running.store(false, Ordering::SeqCst);
        if pump.join().is_err() {
            eprintln!("Warning: ingest thread panicked");
        }
        task.shutdown().await;

        if handle.last_report_ms() != config.last_report_ms {
            config.last_report_ms = handle.last_report_ms();
            if let Err(e) = config.save() {
                eprintln!("Warning: Could not save config: {e}");
            }
        }
    });

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save engine stats: {e}");
    }

    println!();
    println!("{}", stats.summary());
}

fn print_outcome(outcome: &EpochOutcome, config: &Config) {
    let time = format_local(outcome.timestamp, config.tz());
    let tally = &outcome.result.vote_tally;
    println!(
        "[{}] {:<6} sensor={:<6} crowd={:<6}{} votes L/M/H={}/{}/{} | posture={} sitting={} | steps/s={:.2} speed={:.3} stops={} nearby={}",
        time,
        outcome.result.level,
        outcome.result.sensor_level,
        outcome.result.crowd_level,
        if outcome.crowd_fallback { "*" } else { "" },
        tally.low,
        tally.medium,
        tally.high,
        outcome.posture,
        if outcome.snapshot.is_sitting() { "yes" } else { "no" },
        outcome.snapshot.step_rate,
        outcome.snapshot.avg_speed,
        outcome.snapshot.stop_count,
        outcome.snapshot.nearby_device_count,
    );
    if let Some(change) = outcome.posture_change {
        println!("  posture {} -> {}", change.from, change.to);
    }
}

async fn cmd_report(level: &str, ssid: Option<String>, location: Option<GeoPoint>) {
    let level: CongestionLevel = match level.parse() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    let mut config = load_config();
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    if config.store == StoreConfig::Memory {
        eprintln!("Note: no remote report store is configured; this report will not reach other devices.");
        eprintln!("Configure one with `crowdsense config --store-url <URL> --token <TOKEN>`.");
    }

    let stats = create_shared_stats_with_persistence(config.stats_path());
    let sink = open_sink(&config);

    with_store!(config, store => {
        let orchestrator = Orchestrator::new(
            &config,
            store,
            Arc::new(FixedLocation(location)),
            Arc::new(StaticNetwork::new(ssid.as_deref())),
            sink,
            Arc::clone(&stats),
        );
        let handle = orchestrator.handle();

        match handle.submit_report(level).await {
            Ok(_) => println!("Reported {level} congestion. Thank you!"),
            Err(SubmitError::RateLimited { retry_after_ms }) => {
                println!(
                    "Please wait before reporting again ({}s left).",
                    retry_after_ms.div_ceil(1000)
                );
            }
            Err(e) => eprintln!("Error: {e}"),
        }

        if handle.last_report_ms() != config.last_report_ms {
            config.last_report_ms = handle.last_report_ms();
            if let Err(e) = config.save() {
                eprintln!("Warning: Could not save config: {e}");
            }
        }
    });

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save engine stats: {e}");
    }
}

async fn cmd_reports() {
    let config = load_config();
    let tz = config.tz();
    let since = now_ms() - DASHBOARD_WINDOW_MS;

    let fetched: Result<Vec<CrowdReport>, String> = with_store!(config, store => {
        match tokio::time::timeout(config.store_timeout, store.query_since(since)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("timed out after {}ms", config.store_timeout.as_millis())),
        }
    });

    let mut reports = match fetched {
        Ok(reports) => reports,
        Err(e) => {
            eprintln!("Failed to load reports: {e}");
            std::process::exit(1);
        }
    };
    reports.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    println!("Reports from the last hour ({})", reports.len());
    println!("==============================");
    if reports.is_empty() {
        println!("No reports.");
        return;
    }

    let na = || "N/A".to_string();
    for report in &reports {
        println!();
        println!("Time:   {}", format_local(report.timestamp, tz));
        println!("Level:  {}", report.level.clone().unwrap_or_else(na));
        println!("SSID:   {}", report.ssid.clone().unwrap_or_else(na));
        println!(
            "Lat:    {}",
            report.latitude.map(|v| format!("{v:.6}")).unwrap_or_else(na)
        );
        println!(
            "Lon:    {}",
            report.longitude.map(|v| format!("{v:.6}")).unwrap_or_else(na)
        );
        println!("Device: {}", report.device_id.clone().unwrap_or_else(na));
    }
}

fn cmd_status() {
    let config = Config::load().unwrap_or_default();

    println!("CrowdSense Engine Status");
    println!("========================");
    println!();

    println!("Configuration:");
    println!("  Epoch duration: {}ms", config.epoch_duration.as_millis());
    println!("  Look-back horizon: {}ms", config.lookback_horizon.as_millis());
    println!("  Proximity radius: {}m", config.proximity_radius_m);
    println!(
        "  Report store: {}",
        match &config.store {
            StoreConfig::Memory => "in-process".to_string(),
            StoreConfig::Http { base_url, .. } => base_url.clone(),
        }
    );
    match config.last_report_ms {
        Some(ts) => println!("  Last report: {}", format_local(ts, config.tz())),
        None => println!("  Last report: never"),
    }
    println!();

    let stats_path = config.stats_path();
    let loaded = std::fs::read_to_string(&stats_path)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok());
    match loaded {
        Some(stats) => {
            println!("Cumulative Statistics:");
            for key in [
                "accel_samples",
                "step_events",
                "proximity_hits",
                "epochs_emitted",
                "idle_epochs",
                "aggregation_fallbacks",
                "reports_submitted",
                "reports_rejected",
            ] {
                if let Some(value) = stats.get(key) {
                    println!("  {}: {value}", key.replace('_', " "));
                }
            }
        }
        None => println!("No previous session data found."),
    }
}

async fn cmd_config(
    store_url: Option<String>,
    token: Option<String>,
    memory_store: bool,
    timezone: Option<String>,
) {
    let mut config = load_config();
    let mut changed = false;

    if let (Some(base_url), Some(token)) = (store_url, token) {
        check_store(&base_url, &token).await;
        config.store = StoreConfig::Http { base_url, token };
        changed = true;
    }
    if memory_store {
        config.store = StoreConfig::Memory;
        changed = true;
    }
    if let Some(timezone) = timezone {
        if timezone.parse::<chrono_tz::Tz>().is_err() {
            eprintln!("Error: unknown timezone '{timezone}'");
            std::process::exit(2);
        }
        config.timezone = timezone;
        changed = true;
    }

    if changed {
        if let Err(e) = config.save() {
            eprintln!("Error saving config: {e}");
            std::process::exit(1);
        }
        println!("Configuration updated.");
        println!();
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!("Now: {}", Utc::now().with_timezone(&config.tz()).format("%Y-%m-%d %H:%M:%S %Z"));
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&redacted(&config)).unwrap_or_else(|_| "Error".to_string())
    );
}

/// Copy of `config` safe to print: the store token is masked.
fn redacted(config: &Config) -> Config {
    let mut shown = config.clone();
    if let StoreConfig::Http { token, .. } = &mut shown.store {
        *token = mask_token(token);
    }
    shown
}

fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    if token.chars().count() <= 8 {
        "********".to_string()
    } else {
        format!("{visible}********")
    }
}

/// Report whether a newly configured remote store answers its health check.
#[cfg(feature = "gateway")]
async fn check_store(base_url: &str, token: &str) {
    let gateway = GatewayConfig::new(base_url, token).with_timeout(Duration::from_secs(5));
    let store = match HttpReportStore::new(gateway) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Warning: Could not create store client: {e}");
            return;
        }
    };
    match store.test_connection().await {
        Ok(true) => println!("Report store reachable at {base_url}"),
        Ok(false) => eprintln!("Warning: report store at {base_url} answered its health check with an error"),
        Err(e) => eprintln!("Warning: report store at {base_url} is not reachable: {e}"),
    }
}

#[cfg(not(feature = "gateway"))]
async fn check_store(_base_url: &str, _token: &str) {
    eprintln!("Note: this build lacks the gateway feature, so the remote store cannot be used until it is rebuilt with it");
}

fn cmd_privacy() {
    println!("{PRIVACY_DECLARATION}");
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Warning: Could not set Ctrl+C handler: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printed_config_masks_token() {
        let config = Config {
            store: StoreConfig::Http {
                base_url: "https://reports.example".to_string(),
                token: "sk-live-0123456789".to_string(),
            },
            ..Config::default()
        };
        let printed = serde_json::to_string(&redacted(&config)).unwrap();
        assert!(!printed.contains("0123456789"));
        assert!(printed.contains("sk-l********"));
        assert!(printed.contains("https://reports.example"));
    }

    #[test]
    fn test_short_tokens_fully_masked() {
        assert_eq!(mask_token("abc"), "********");
        assert_eq!(mask_token(""), "********");
    }
}
