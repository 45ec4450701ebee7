//! Epoch orchestration.
//!
//! The [`Orchestrator`] owns the feature window and the posture tracker and
//! drives one epoch per timer tick:
//!
//! ```text
//! freeze window ─▶ classify + score ─┬─▶ location fix ──┐
//!                                    └─▶ store query  ──┴─▶ tally ─▶ blend ─▶ sink
//! ```
//!
//! The location fix and the store query run concurrently, each under its own
//! deadline. Either failing falls back (no location, empty tally) instead of
//! failing the epoch. Samples reach the window through an [`Ingestor`] from
//! any thread; the epoch boundary is the window's atomic `freeze`.

use crate::collector::context::{fetch_location, LocationProvider, NetworkIdentity};
use crate::collector::types::SensorEvent;
use crate::config::Config;
use crate::core::blend::BlendedResult;
use crate::core::features::FeatureSnapshot;
use crate::core::posture::{classify, PostureChange, PostureState, PostureTracker};
use crate::core::record::{EpochRecord, ResultSink, UserReportRecord};
use crate::core::scoring::{evaluate, CongestionLevel, ScoreBreakdown};
use crate::core::tally::VoteTally;
use crate::core::windowing::SharedFeatureWindow;
use crate::reports::aggregate::ReportAggregator;
use crate::reports::store::ReportStore;
use crate::reports::submit::{ReportSubmitter, SubmitError};
use crate::stats::SharedEngineStats;
use chrono_tz::Tz;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Poll interval of the ingest pump.
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where the orchestrator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Between ticks
    Waiting,
    /// Freezing the window and scoring
    EpochRunning,
    /// Waiting on the location fix and store query
    Aggregating,
    /// Blending and writing to the sink
    Emitting,
    /// Shut down; terminal
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Waiting => "waiting",
            EngineState::EpochRunning => "epoch-running",
            EngineState::Aggregating => "aggregating",
            EngineState::Emitting => "emitting",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Everything decided in one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochOutcome {
    pub timestamp: i64,
    pub snapshot: FeatureSnapshot,
    pub breakdown: ScoreBreakdown,
    pub posture: PostureState,
    pub posture_change: Option<PostureChange>,
    pub result: BlendedResult,
    /// True when the crowd level is the fail-open default
    pub crowd_fallback: bool,
}

/// Current wall-clock time in ms since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Feeds samples into the shared window, counting them as they pass.
#[derive(Debug, Clone)]
pub struct Ingestor {
    window: SharedFeatureWindow,
    stats: SharedEngineStats,
}

impl Ingestor {
    pub fn ingest(&self, event: SensorEvent) {
        match &event {
            SensorEvent::Accelerometer(_) => self.stats.record_accel_sample(),
            SensorEvent::StepCounter(_) => self.stats.record_step_event(),
            SensorEvent::ProximityHit(_) => self.stats.record_proximity_hit(),
        }
        self.window.ingest(event);
    }
}

/// Drain a sample channel into the window on a dedicated thread.
///
/// The thread exits when `running` is cleared or the channel disconnects.
pub fn spawn_ingest_pump(
    receiver: Receiver<SensorEvent>,
    ingestor: Ingestor,
    running: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            match receiver.recv_timeout(PUMP_POLL_INTERVAL) {
                Ok(event) => ingestor.ingest(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("sample source disconnected");
                    break;
                }
            }
        }
    })
}

/// Drives epochs. Owns the feature window and the posture tracker.
pub struct Orchestrator<S, L> {
    epoch_duration: Duration,
    location_timeout: Duration,
    timezone: Tz,
    window: SharedFeatureWindow,
    posture: PostureTracker,
    aggregator: ReportAggregator<S>,
    submitter: Arc<ReportSubmitter<S, L>>,
    location: Arc<L>,
    network: Arc<dyn NetworkIdentity>,
    sink: Arc<dyn ResultSink>,
    stats: SharedEngineStats,
    state_tx: watch::Sender<EngineState>,
    latest_tx: watch::Sender<Option<EpochOutcome>>,
    posture_tx: watch::Sender<PostureState>,
}

impl<S: ReportStore, L: LocationProvider> Orchestrator<S, L> {
    pub fn new(
        config: &Config,
        store: Arc<S>,
        location: Arc<L>,
        network: Arc<dyn NetworkIdentity>,
        sink: Arc<dyn ResultSink>,
        stats: SharedEngineStats,
    ) -> Self {
        let aggregator = ReportAggregator::new(
            Arc::clone(&store),
            config.lookback_horizon,
            config.proximity_radius_m,
            config.store_timeout,
        );
        let submitter = ReportSubmitter::new(
            store,
            Arc::clone(&location),
            config.device_id.clone(),
            config.report_cooldown,
        )
        .with_timeouts(config.location_timeout, config.store_timeout)
        .with_last_accepted(config.last_report_ms);

        let (state_tx, _) = watch::channel(EngineState::Waiting);
        let (latest_tx, _) = watch::channel(None);
        let (posture_tx, _) = watch::channel(PostureState::Unknown);

        Self {
            epoch_duration: config.epoch_duration,
            location_timeout: config.location_timeout,
            timezone: config.tz(),
            window: SharedFeatureWindow::new(config.epoch_duration),
            posture: PostureTracker::new(),
            aggregator,
            submitter: Arc::new(submitter),
            location,
            network,
            sink,
            stats,
            state_tx,
            latest_tx,
            posture_tx,
        }
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor {
            window: self.window.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// A handle for reading engine output and submitting reports.
    pub fn handle(&self) -> EngineHandle<S, L> {
        EngineHandle {
            ingestor: self.ingestor(),
            submitter: Arc::clone(&self.submitter),
            network: Arc::clone(&self.network),
            sink: Arc::clone(&self.sink),
            stats: Arc::clone(&self.stats),
            timezone: self.timezone,
            state_rx: self.state_tx.subscribe(),
            latest_rx: self.latest_tx.subscribe(),
            posture_rx: self.posture_tx.subscribe(),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
    }

    /// Run one epoch ending at `now_ms`.
    pub async fn run_epoch(&mut self, now_ms: i64) -> EpochOutcome {
        self.set_state(EngineState::EpochRunning);
        let snapshot = self.window.freeze();
        let posture = classify(
            snapshot.step_rate,
            snapshot.pitch_degrees,
            snapshot.pitch_variance,
        );
        self.posture.update(posture);
        self.posture_tx.send_replace(posture);
        let breakdown = evaluate(&snapshot);
        tracing::debug!(
            step_rate = snapshot.step_rate,
            avg_speed = snapshot.avg_speed,
            stop_count = snapshot.stop_count,
            accel_variance = snapshot.accel_variance,
            nearby = snapshot.nearby_device_count,
            samples = snapshot.sample_count,
            total = breakdown.total,
            level = %breakdown.level,
            "epoch scored"
        );

        self.set_state(EngineState::Aggregating);
        let ssid = self.network.current_ssid();
        let (location, fetched) = tokio::join!(
            fetch_location(self.location.as_ref(), self.location_timeout),
            self.aggregator.fetch_recent(now_ms),
        );
        let (tally, crowd_fallback) = match fetched {
            Ok(reports) => (
                self.aggregator.tally(&reports, now_ms, &ssid, location),
                false,
            ),
            Err(e) => {
                tracing::warn!(error = %e, "crowd aggregation failed, assuming no votes");
                self.stats.record_aggregation_fallback();
                (VoteTally::default(), true)
            }
        };

        self.set_state(EngineState::Emitting);
        let result = BlendedResult::new(breakdown.level, tally);
        let record = EpochRecord::new(now_ms, &snapshot, &result, posture);
        if let Err(e) = self.sink.emit_epoch(&record) {
            tracing::warn!(error = %e, "failed to emit epoch record");
        }
        self.stats
            .record_epoch(breakdown.level == CongestionLevel::Idle);
        tracing::info!(
            sensor = %result.sensor_level,
            crowd = %result.crowd_level,
            blended = %result.level,
            votes = tally.total(),
            %posture,
            "epoch complete"
        );

        let outcome = EpochOutcome {
            timestamp: now_ms,
            snapshot,
            breakdown,
            posture,
            posture_change: self.posture.take_change(),
            result,
            crowd_fallback,
        };
        self.latest_tx.send_replace(Some(outcome.clone()));
        self.set_state(EngineState::Waiting);
        outcome
    }

    /// Tick until `shutdown` flips to true or its sender is dropped.
    ///
    /// An epoch still waiting on its location fix or store query when
    /// shutdown arrives is dropped without emitting.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.epoch_duration;
        let mut ticker = tokio::time::interval_at(start, self.epoch_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if !*shutdown.borrow() {
            tracing::info!(
                epoch_ms = self.epoch_duration.as_millis() as u64,
                "engine started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = self.run_epoch(now_ms()) => {}
                            _ = shutdown.changed() => {
                                tracing::debug!("shutdown during epoch, discarding it");
                                break;
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        self.set_state(EngineState::Stopped);
        tracing::info!("engine stopped");
    }
}

/// Cloneable access to a running engine.
pub struct EngineHandle<S, L> {
    ingestor: Ingestor,
    submitter: Arc<ReportSubmitter<S, L>>,
    network: Arc<dyn NetworkIdentity>,
    sink: Arc<dyn ResultSink>,
    stats: SharedEngineStats,
    timezone: Tz,
    state_rx: watch::Receiver<EngineState>,
    latest_rx: watch::Receiver<Option<EpochOutcome>>,
    posture_rx: watch::Receiver<PostureState>,
}

impl<S, L> Clone for EngineHandle<S, L> {
    fn clone(&self) -> Self {
        Self {
            ingestor: self.ingestor.clone(),
            submitter: Arc::clone(&self.submitter),
            network: Arc::clone(&self.network),
            sink: Arc::clone(&self.sink),
            stats: Arc::clone(&self.stats),
            timezone: self.timezone,
            state_rx: self.state_rx.clone(),
            latest_rx: self.latest_rx.clone(),
            posture_rx: self.posture_rx.clone(),
        }
    }
}

impl<S: ReportStore, L: LocationProvider> EngineHandle<S, L> {
    pub fn ingestor(&self) -> Ingestor {
        self.ingestor.clone()
    }

    pub fn ingest(&self, event: SensorEvent) {
        self.ingestor.ingest(event);
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn latest(&self) -> Option<EpochOutcome> {
        self.latest_rx.borrow().clone()
    }

    pub fn posture(&self) -> PostureState {
        *self.posture_rx.borrow()
    }

    /// Receiver that changes on every emitted epoch.
    pub fn watch_latest(&self) -> watch::Receiver<Option<EpochOutcome>> {
        self.latest_rx.clone()
    }

    pub fn stats(&self) -> &SharedEngineStats {
        &self.stats
    }

    pub fn last_report_ms(&self) -> Option<i64> {
        self.submitter.last_accepted()
    }

    /// Submit a manual congestion report now.
    pub async fn submit_report(
        &self,
        level: CongestionLevel,
    ) -> Result<UserReportRecord, SubmitError> {
        self.submit_report_at(level, now_ms()).await
    }

    /// Submit a manual congestion report at `now_ms`.
    ///
    /// An accepted report is written to the sink even if the store push then
    /// fails; the push error is still returned.
    pub async fn submit_report_at(
        &self,
        level: CongestionLevel,
        now_ms: i64,
    ) -> Result<UserReportRecord, SubmitError> {
        let ssid = self.network.current_ssid();
        let pushed = match self.submitter.submit(level, now_ms, &ssid).await {
            Err(e @ SubmitError::RateLimited { .. }) => {
                self.stats.record_report_rejected();
                return Err(e);
            }
            Err(e @ SubmitError::InvalidLevel(_)) => return Err(e),
            accepted => accepted,
        };

        self.stats.record_report_submitted();
        let (step_count, nearby) = self.ingestor.window.peek_counts();
        let record = UserReportRecord::new(
            now_ms,
            self.timezone,
            level,
            step_count,
            nearby,
            self.posture(),
        );
        tracing::info!(
            time = %record.formatted_time,
            %level,
            step_count,
            nearby,
            posture = %record.posture,
            "user reported congestion"
        );
        if let Err(e) = self.sink.emit_user_report(&record) {
            tracing::warn!(error = %e, "failed to emit user report record");
        }

        pushed.map(|_| record)
    }
}

/// Join handle and shutdown switch of a spawned engine.
pub struct EngineTask {
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl EngineTask {
    /// Signal shutdown and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "engine task ended abnormally");
        }
    }
}

/// Build an orchestrator and run it on the current tokio runtime.
pub fn spawn<S: ReportStore, L: LocationProvider>(
    config: &Config,
    store: Arc<S>,
    location: Arc<L>,
    network: Arc<dyn NetworkIdentity>,
    sink: Arc<dyn ResultSink>,
    stats: SharedEngineStats,
) -> (EngineHandle<S, L>, EngineTask) {
    let orchestrator = Orchestrator::new(config, store, location, network, sink, stats);
    let handle = orchestrator.handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(orchestrator.run(shutdown_rx));
    (handle, EngineTask { shutdown_tx, join })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::context::{FixedLocation, StaticNetwork};
    use crate::collector::types::{AccelSample, StepSample, GRAVITY_EARTH};
    use crate::core::record::MemorySink;
    use crate::reports::store::{CrowdReport, MemoryReportStore};
    use crate::stats::create_shared_stats;

    fn test_config() -> Config {
        Config {
            epoch_duration: Duration::from_millis(50),
            location_timeout: Duration::from_millis(50),
            store_timeout: Duration::from_millis(50),
            ..Config::default()
        }
    }

    fn orchestrator(
        store: Arc<MemoryReportStore>,
        sink: Arc<MemorySink>,
    ) -> Orchestrator<MemoryReportStore, FixedLocation> {
        Orchestrator::new(
            &test_config(),
            store,
            Arc::new(FixedLocation(None)),
            Arc::new(StaticNetwork::new(Some("Library"))),
            sink,
            create_shared_stats(),
        )
    }

    #[tokio::test]
    async fn test_empty_epoch_emits_idle_blended_low() {
        let sink = Arc::new(MemorySink::new());
        let mut orch = orchestrator(Arc::new(MemoryReportStore::new()), Arc::clone(&sink));

        let outcome = orch.run_epoch(1_000_000).await;
        assert_eq!(outcome.breakdown.level, CongestionLevel::Idle);
        assert_eq!(outcome.result.level, CongestionLevel::Low);
        assert!(!outcome.crowd_fallback);
        assert_eq!(orch.state(), EngineState::Waiting);

        let records = sink.epochs();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sensor_level, CongestionLevel::Idle);
    }

    #[tokio::test]
    async fn test_store_outage_falls_back() {
        let store = Arc::new(MemoryReportStore::new());
        store.set_available(false);
        let sink = Arc::new(MemorySink::new());
        let mut orch = orchestrator(store, Arc::clone(&sink));

        let outcome = orch.run_epoch(1_000_000).await;
        assert!(outcome.crowd_fallback);
        assert_eq!(outcome.result.vote_tally, VoteTally::default());
        assert_eq!(sink.epochs().len(), 1);
    }

    #[tokio::test]
    async fn test_user_report_uses_in_progress_counts() {
        let store = Arc::new(MemoryReportStore::new());
        let sink = Arc::new(MemorySink::new());
        let orch = orchestrator(Arc::clone(&store), Arc::clone(&sink));
        let handle = orch.handle();

        handle.ingest(SensorEvent::StepCounter(StepSample {
            timestamp_ms: 0,
            cumulative: 40.0,
        }));
        handle.ingest(SensorEvent::StepCounter(StepSample {
            timestamp_ms: 500,
            cumulative: 46.0,
        }));
        handle.ingest(SensorEvent::Accelerometer(AccelSample::new(
            600,
            0.0,
            0.0,
            GRAVITY_EARTH,
        )));

        let record = handle
            .submit_report_at(CongestionLevel::Medium, 0)
            .await
            .unwrap();
        assert_eq!(record.step_count, 6);
        assert_eq!(record.reported_level, CongestionLevel::Medium);
        assert_eq!(record.formatted_time, "1970-01-01 00:00:00");
        assert_eq!(sink.user_reports().len(), 1);
        assert_eq!(store.len().await, 1);

        let second = handle.submit_report_at(CongestionLevel::High, 10_000).await;
        assert!(matches!(second, Err(SubmitError::RateLimited { .. })));
        assert_eq!(sink.user_reports().len(), 1);
        assert_eq!(handle.stats().snapshot().reports_rejected, 1);
    }

    #[tokio::test]
    async fn test_own_report_counts_toward_crowd() {
        let store = Arc::new(MemoryReportStore::with_reports(vec![CrowdReport {
            device_id: Some("peer".to_string()),
            level: Some("High".to_string()),
            ssid: Some("Library".to_string()),
            latitude: None,
            longitude: None,
            timestamp: 990_000,
        }]));
        let mut orch = orchestrator(store, Arc::new(MemorySink::new()));
        let outcome = orch.run_epoch(1_000_000).await;
        assert_eq!(outcome.result.crowd_level, CongestionLevel::High);
        assert_eq!(outcome.result.level, CongestionLevel::High);
    }

    #[tokio::test]
    async fn test_spawned_engine_ticks_and_stops() {
        let sink = Arc::new(MemorySink::new());
        let (handle, task) = spawn(
            &test_config(),
            Arc::new(MemoryReportStore::new()),
            Arc::new(FixedLocation(None)),
            Arc::new(StaticNetwork::new(None)),
            Arc::clone(&sink) as Arc<dyn ResultSink>,
            create_shared_stats(),
        );

        let mut latest = handle.watch_latest();
        tokio::time::timeout(Duration::from_secs(2), latest.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(handle.latest().is_some());

        task.shutdown().await;
        assert_eq!(handle.state(), EngineState::Stopped);
        assert!(!sink.epochs().is_empty());
    }
}
