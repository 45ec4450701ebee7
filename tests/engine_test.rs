//! End-to-end epochs against the in-process report store and sink.

use crowdsense_engine::collector::{
    AccelSample, FixedLocation, GeoPoint, LocationProvider, ProximityHit, SensorEvent,
    StaticNetwork, StepSample, GRAVITY_EARTH,
};
use crowdsense_engine::core::{
    blend, evaluate, score, CongestionLevel, FeatureSnapshot, MemorySink, PostureState,
    ResultSink, VoteTally,
};
use crowdsense_engine::engine::{self, EngineState, Orchestrator};
use crowdsense_engine::reports::{tally_reports, CrowdReport, MemoryReportStore, ReportStore};
use crowdsense_engine::stats::create_shared_stats;
use crowdsense_engine::Config;
use std::sync::Arc;
use std::time::Duration;

const NOW: i64 = 1_700_000_000_000;

fn test_config() -> Config {
    Config {
        epoch_duration: Duration::from_millis(100),
        location_timeout: Duration::from_millis(100),
        store_timeout: Duration::from_millis(100),
        device_id: "crowdsense-test-device".to_string(),
        ..Config::default()
    }
}

fn report(device: &str, level: &str, ts: i64, ssid: Option<&str>) -> CrowdReport {
    CrowdReport {
        device_id: Some(device.to_string()),
        level: Some(level.to_string()),
        ssid: ssid.map(str::to_string),
        latitude: None,
        longitude: None,
        timestamp: ts,
    }
}

fn orchestrator<L: LocationProvider>(
    config: &Config,
    store: Arc<MemoryReportStore>,
    location: L,
    sink: Arc<MemorySink>,
) -> Orchestrator<MemoryReportStore, L> {
    Orchestrator::new(
        config,
        store,
        Arc::new(location),
        Arc::new(StaticNetwork::new(Some("\"CampusNet\""))),
        sink,
        create_shared_stats(),
    )
}

/// A location provider that never answers.
struct HungLocation;

impl LocationProvider for HungLocation {
    async fn current_location(&self) -> Option<GeoPoint> {
        std::future::pending().await
    }
}

#[test]
fn test_scenario_a_still_phone_is_idle() {
    let snapshot = FeatureSnapshot {
        step_rate: 0.0,
        avg_speed: 0.02,
        stop_count: 0,
        nearby_device_count: 0,
        accel_variance: 0.002,
        sample_count: 40,
        ..Default::default()
    };
    let breakdown = evaluate(&snapshot);
    assert_eq!(breakdown.level, CongestionLevel::Idle);
    assert_eq!(breakdown.total, 0);
}

#[test]
fn test_scenario_b_crowded_shuffle_is_high() {
    let snapshot = FeatureSnapshot {
        step_rate: 0.1,
        avg_speed: 0.03,
        stop_count: 6,
        nearby_device_count: 9,
        accel_variance: 0.002,
        sample_count: 40,
        ..Default::default()
    };
    let breakdown = score(&snapshot);
    assert_eq!(breakdown.crowd_factor, 6);
    assert_eq!(breakdown.stop_score, 3);
    assert_eq!(breakdown.speed_score, 2);
    assert_eq!(breakdown.step_score, 2);
    assert_eq!(breakdown.motion_variance_score, 3);
    assert_eq!(breakdown.stationary_penalty, 2);
    assert_eq!(breakdown.slow_walking_penalty, 2);
    assert_eq!(breakdown.total, 20);
    assert_eq!(breakdown.level, CongestionLevel::High);
}

#[tokio::test]
async fn test_scenario_c_crowd_majority_lifts_low_sensor() {
    let store = Arc::new(MemoryReportStore::with_reports(vec![
        report("a", "Low", NOW - 40_000, Some("CampusNet")),
        report("b", "Medium", NOW - 30_000, Some("CampusNet")),
        report("c", "Medium", NOW - 20_000, Some("CampusNet")),
    ]));
    let sink = Arc::new(MemorySink::new());
    let config = test_config();
    let mut orch = orchestrator(&config, store, FixedLocation(None), Arc::clone(&sink));

    // brisk walking alone: sensor level Low
    let ingestor = orch.ingestor();
    ingestor.ingest(SensorEvent::StepCounter(StepSample {
        timestamp_ms: 0,
        cumulative: 100.0,
    }));
    ingestor.ingest(SensorEvent::StepCounter(StepSample {
        timestamp_ms: 90,
        cumulative: 120.0,
    }));
    for i in 0..20u64 {
        // deviations alternate 2.0 / 1.0: fast and jittery
        let bump = if i % 2 == 0 { 2.0 } else { 1.0 };
        ingestor.ingest(SensorEvent::Accelerometer(AccelSample::new(
            i * 5,
            0.0,
            0.0,
            GRAVITY_EARTH + bump,
        )));
    }

    let outcome = orch.run_epoch(NOW).await;
    assert_eq!(outcome.result.sensor_level, CongestionLevel::Low);
    let tally = outcome.result.vote_tally;
    assert_eq!((tally.low, tally.medium, tally.high), (1, 2, 0));
    assert_eq!(outcome.result.crowd_level, CongestionLevel::Medium);
    assert_eq!(outcome.result.level, CongestionLevel::Medium);
    assert_eq!(outcome.posture, PostureState::Walking);

    let records = sink.epochs();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].blended_level, CongestionLevel::Medium);
    assert_eq!(records[0].timestamp, NOW);
}

#[test]
fn test_blend_properties() {
    use CongestionLevel::*;
    for level in [Idle, Low, Medium, High] {
        assert_eq!(blend(High, level), High);
        assert_ne!(blend(level, Low), Idle);
    }
    assert_eq!(blend(Low, Low), Low);
    assert_eq!(blend(Medium, Low), Medium);
}

#[test]
fn test_dedup_keeps_later_report() {
    let reports = vec![
        report("same", "High", NOW - 10_000, Some("CampusNet")),
        report("same", "Low", NOW - 40_000, Some("CampusNet")),
    ];
    let tally = tally_reports(
        &reports,
        NOW,
        "CampusNet",
        None,
        Duration::from_secs(60),
        50.0,
    );
    assert_eq!(tally.total(), 1);
    assert_eq!(tally.winning_level, CongestionLevel::High);
}

#[test]
fn test_horizon_excludes_old_matching_reports() {
    let reports = vec![report("old", "High", NOW - 60_001, Some("CampusNet"))];
    let tally = tally_reports(
        &reports,
        NOW,
        "CampusNet",
        None,
        Duration::from_secs(60),
        50.0,
    );
    assert_eq!(tally, VoteTally::default());
}

#[test]
fn test_tie_resolves_to_low() {
    let reports = vec![
        report("a", "Low", NOW - 1, Some("CampusNet")),
        report("b", "Low", NOW - 2, Some("CampusNet")),
        report("c", "Medium", NOW - 3, Some("CampusNet")),
        report("d", "Medium", NOW - 4, Some("CampusNet")),
    ];
    let tally = tally_reports(
        &reports,
        NOW,
        "CampusNet",
        None,
        Duration::from_secs(60),
        50.0,
    );
    assert_eq!((tally.low, tally.medium, tally.high), (2, 2, 0));
    assert_eq!(tally.winning_level, CongestionLevel::Low);
}

#[tokio::test]
async fn test_nearby_report_without_shared_network() {
    let here = GeoPoint::new(43.9448, -78.8966);
    let mut nearby = report("peer", "High", NOW - 5_000, Some("OtherNet"));
    nearby.latitude = Some(43.9450);
    nearby.longitude = Some(-78.8966);
    let store = Arc::new(MemoryReportStore::with_reports(vec![nearby]));

    let mut orch = orchestrator(
        &test_config(),
        store,
        FixedLocation(Some(here)),
        Arc::new(MemorySink::new()),
    );
    let outcome = orch.run_epoch(NOW).await;
    assert_eq!(outcome.result.crowd_level, CongestionLevel::High);
    assert_eq!(outcome.result.level, CongestionLevel::High);
}

#[tokio::test]
async fn test_store_outage_emits_sensor_only_result() {
    let store = Arc::new(MemoryReportStore::with_reports(vec![report(
        "a",
        "High",
        NOW - 1_000,
        Some("CampusNet"),
    )]));
    store.set_available(false);
    let sink = Arc::new(MemorySink::new());
    let mut orch = orchestrator(&test_config(), store, FixedLocation(None), Arc::clone(&sink));

    let outcome = orch.run_epoch(NOW).await;
    assert!(outcome.crowd_fallback);
    assert_eq!(outcome.result.vote_tally, VoteTally::default());
    assert_eq!(outcome.result.crowd_level, CongestionLevel::Low);
    assert_eq!(sink.epochs().len(), 1);
}

#[tokio::test]
async fn test_hung_dependencies_time_out() {
    let store = Arc::new(
        MemoryReportStore::with_reports(vec![report("a", "High", NOW, Some("CampusNet"))])
            .with_latency(Duration::from_secs(30)),
    );
    let mut orch = orchestrator(
        &test_config(),
        store,
        HungLocation,
        Arc::new(MemorySink::new()),
    );

    let outcome = tokio::time::timeout(Duration::from_secs(5), orch.run_epoch(NOW))
        .await
        .expect("epoch must not hang on its dependencies");
    assert!(outcome.crowd_fallback);
    assert_eq!(outcome.result.level, CongestionLevel::Low);
}

#[tokio::test]
async fn test_posture_change_reported_once() {
    let mut orch = orchestrator(
        &test_config(),
        Arc::new(MemoryReportStore::new()),
        FixedLocation(None),
        Arc::new(MemorySink::new()),
    );
    let ingestor = orch.ingestor();

    // lying flat: pitch 0
    for i in 0..20u64 {
        ingestor.ingest(SensorEvent::Accelerometer(AccelSample::new(
            i * 5,
            0.0,
            0.0,
            GRAVITY_EARTH,
        )));
    }
    let first = orch.run_epoch(NOW).await;
    assert_eq!(first.posture, PostureState::Sitting);
    let change = first.posture_change.expect("transition out of Unknown");
    assert_eq!(change.from, PostureState::Unknown);
    assert_eq!(change.to, PostureState::Sitting);

    // the pitch window carries over, so the posture holds with no new change
    let second = orch.run_epoch(NOW + 5_000).await;
    assert_eq!(second.posture, PostureState::Sitting);
    assert!(second.posture_change.is_none());

    // held upright and still: pitch 90 with no variance
    for i in 0..20u64 {
        ingestor.ingest(SensorEvent::Accelerometer(AccelSample::new(
            10_000 + i * 5,
            0.0,
            GRAVITY_EARTH,
            0.0,
        )));
    }
    let third = orch.run_epoch(NOW + 10_000).await;
    assert_eq!(third.posture, PostureState::Idle);
    let change = third.posture_change.expect("transition out of Sitting");
    assert_eq!(change.from, PostureState::Sitting);
    assert_eq!(change.to, PostureState::Idle);
    assert_eq!(orch.handle().posture(), PostureState::Idle);
}

#[tokio::test]
async fn test_epochs_do_not_share_samples() {
    let sink = Arc::new(MemorySink::new());
    let mut orch = orchestrator(
        &test_config(),
        Arc::new(MemoryReportStore::new()),
        FixedLocation(None),
        Arc::clone(&sink),
    );
    let ingestor = orch.ingestor();

    for peer in ["p1", "p2", "p3"] {
        ingestor.ingest(SensorEvent::ProximityHit(ProximityHit {
            timestamp_ms: 0,
            peer_id: peer.to_string(),
        }));
    }
    ingestor.ingest(SensorEvent::Accelerometer(AccelSample::new(
        0,
        0.0,
        0.0,
        GRAVITY_EARTH,
    )));

    let first = orch.run_epoch(NOW).await;
    let second = orch.run_epoch(NOW + 5_000).await;
    assert_eq!(first.snapshot.nearby_device_count, 3);
    assert_eq!(first.snapshot.stop_count, 1);
    assert_eq!(second.snapshot.nearby_device_count, 0);
    assert_eq!(second.snapshot.stop_count, 0);
    assert_eq!(second.breakdown.level, CongestionLevel::Idle);

    let records = sink.epochs();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].nearby_devices, 0);
}

#[tokio::test]
async fn test_report_then_epoch_sees_own_vote() {
    let config = test_config();
    let store = Arc::new(MemoryReportStore::new());
    let sink = Arc::new(MemorySink::new());
    let mut orch = orchestrator(&config, Arc::clone(&store), FixedLocation(None), Arc::clone(&sink));
    let handle = orch.handle();

    let record = handle
        .submit_report_at(CongestionLevel::High, NOW - 1_000)
        .await
        .unwrap();
    assert_eq!(record.reported_level, CongestionLevel::High);

    let stored = store.query_since(0).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].ssid.as_deref(), Some("CampusNet"));
    assert_eq!(stored[0].device_id.as_deref(), Some("crowdsense-test-device"));

    let outcome = orch.run_epoch(NOW).await;
    assert_eq!(outcome.result.crowd_level, CongestionLevel::High);
    assert_eq!(sink.user_reports().len(), 1);
}

#[tokio::test]
async fn test_shutdown_discards_in_flight_epoch() {
    let store =
        Arc::new(MemoryReportStore::new().with_latency(Duration::from_secs(30)));
    let sink = Arc::new(MemorySink::new());
    let config = Config {
        store_timeout: Duration::from_secs(60),
        location_timeout: Duration::from_secs(60),
        ..test_config()
    };
    let (handle, task) = engine::spawn(
        &config,
        store,
        Arc::new(HungLocation),
        Arc::new(StaticNetwork::new(None)),
        Arc::clone(&sink) as Arc<dyn ResultSink>,
        create_shared_stats(),
    );

    // wait for the first tick to reach aggregation
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while handle.state() != EngineState::Aggregating {
        assert!(tokio::time::Instant::now() < deadline, "epoch never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::time::timeout(Duration::from_secs(2), task.shutdown())
        .await
        .expect("shutdown must not wait on the hung epoch");
    assert_eq!(handle.state(), EngineState::Stopped);
    assert!(sink.epochs().is_empty());
    assert!(handle.latest().is_none());
}
