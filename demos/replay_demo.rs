//! Demonstration of the CrowdSense engine on a synthetic trace.
//!
//! This example shows how to:
//! 1. Seed an in-process report store with peer votes
//! 2. Spawn the engine with fixed location and network context
//! 3. Feed motion samples through a replay collector
//! 4. Watch blended results arrive each epoch
//! 5. Submit a manual report
//!
//! Run with: cargo run --example replay_demo

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crowdsense_engine::{
    collector::{
        AccelSample, CollectorConfig, FixedLocation, GeoPoint, ProximityHit, ReplayCollector,
        SensorEvent, StaticNetwork, StepSample, GRAVITY_EARTH,
    },
    core::{CongestionLevel, MemorySink, ResultSink},
    engine::{self, now_ms, spawn_ingest_pump},
    reports::{CrowdReport, MemoryReportStore},
    stats::create_shared_stats,
    Config, PRIVACY_DECLARATION,
};

/// Ten seconds of slow shuffling in a packed hallway.
fn write_trace(path: &std::path::Path) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    let mut events = Vec::new();
    for i in 0..200u64 {
        let ts = i * 50;
        let wobble = 0.04 + 0.02 * ((i % 7) as f64 / 7.0);
        events.push(SensorEvent::Accelerometer(AccelSample::new(
            ts,
            0.3,
            GRAVITY_EARTH - 0.2,
            wobble,
        )));
        if i % 40 == 0 {
            events.push(SensorEvent::StepCounter(StepSample {
                timestamp_ms: ts,
                cumulative: 1_000.0 + (i / 40) as f64,
            }));
        }
        if i % 20 == 0 {
            events.push(SensorEvent::ProximityHit(ProximityHit {
                timestamp_ms: ts,
                peer_id: format!("peer-{}", i % 9),
            }));
        }
    }
    for event in events {
        writeln!(file, "{}", serde_json::to_string(&event)?)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    println!("CrowdSense Engine - Replay Demo");
    println!("===============================");
    println!();
    println!("{PRIVACY_DECLARATION}");

    let trace = std::env::temp_dir().join("crowdsense-demo-trace.jsonl");
    if let Err(e) = write_trace(&trace) {
        eprintln!("Error writing trace: {e}");
        return;
    }

    let now = now_ms();
    let store = Arc::new(MemoryReportStore::with_reports(vec![
        CrowdReport::new("peer-a", CongestionLevel::Medium, Some("Hallway".into()), None, now - 20_000),
        CrowdReport::new("peer-b", CongestionLevel::High, Some("Hallway".into()), None, now - 10_000),
        CrowdReport::new("peer-c", CongestionLevel::High, None, Some(GeoPoint::new(43.9450, -78.8966)), now - 5_000),
    ]));

    let config = Config {
        epoch_duration: Duration::from_secs(2),
        ..Config::default()
    };
    let sink = Arc::new(MemorySink::new());
    let (handle, task) = engine::spawn(
        &config,
        store,
        Arc::new(FixedLocation(Some(GeoPoint::new(43.9448, -78.8966)))),
        Arc::new(StaticNetwork::new(Some("\"Hallway\""))),
        Arc::clone(&sink) as Arc<dyn ResultSink>,
        create_shared_stats(),
    );

    let mut collector = ReplayCollector::new(CollectorConfig {
        replay_path: Some(trace.clone()),
        realtime: true,
    });
    if let Err(e) = collector.start() {
        eprintln!("Error starting collector: {e}");
        return;
    }
    let pump_running = Arc::new(AtomicBool::new(true));
    let pump = spawn_ingest_pump(
        collector.receiver().clone(),
        handle.ingestor(),
        Arc::clone(&pump_running),
    );

    println!("Running for 10 seconds...");
    println!();

    let mut latest = handle.watch_latest();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while let Ok(Ok(())) = tokio::time::timeout_at(deadline, latest.changed()).await {
        let outcome = latest.borrow_and_update().clone();
        if let Some(o) = outcome {
            println!(
                "level={} (sensor {}, crowd {}) posture={} score={} nearby={}",
                o.result.level,
                o.result.sensor_level,
                o.result.crowd_level,
                o.posture,
                o.breakdown.total,
                o.snapshot.nearby_device_count
            );
        }
    }

    println!();
    match handle.submit_report(CongestionLevel::High).await {
        Ok(record) => println!(
            "Reported High at {} ({} steps, {} nearby so far this epoch)",
            record.formatted_time, record.step_count, record.nearby_devices
        ),
        Err(e) => eprintln!("Report failed: {e}"),
    }

    collector.stop();
    pump_running.store(false, std::sync::atomic::Ordering::SeqCst);
    let _ = pump.join();
    task.shutdown().await;
    let _ = std::fs::remove_file(&trace);

    println!();
    println!("{} epoch records emitted", sink.epochs().len());
    println!("{}", handle.stats().summary());
}
