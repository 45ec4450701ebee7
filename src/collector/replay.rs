//! Replay collector that feeds recorded sample traces into the engine.
//!
//! Platform sensor APIs live outside this crate. A trace is a JSON-lines file
//! of [`SensorEvent`]s; when no trace is configured the collector is a silent
//! source that never emits events.

use crate::collector::types::SensorEvent;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a blocked send waits before rechecking for shutdown.
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the replay source.
#[derive(Debug, Clone, Default)]
pub struct CollectorConfig {
    /// JSON-lines trace to replay
    pub replay_path: Option<PathBuf>,
    /// Pace events by the gaps between their timestamps
    pub realtime: bool,
}

/// Errors that can occur during event collection.
#[derive(Debug)]
pub enum CollectorError {
    AlreadyRunning,
    Io(String),
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::AlreadyRunning => write!(f, "Collector is already running"),
            CollectorError::Io(e) => write!(f, "Trace IO error: {e}"),
        }
    }
}

impl std::error::Error for CollectorError {}

/// A collector that replays a recorded trace on a background thread.
pub struct ReplayCollector {
    config: CollectorConfig,
    sender: Sender<SensorEvent>,
    receiver: Receiver<SensorEvent>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ReplayCollector {
    /// Create a new replay collector.
    pub fn new(config: CollectorConfig) -> Self {
        let (sender, receiver) = bounded(10_000);
        Self {
            config,
            sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Start replaying.
    ///
    /// Without a trace this simply marks the collector as running.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }

        if let Some(path) = &self.config.replay_path {
            let file = File::open(path)
                .map_err(|e| CollectorError::Io(format!("{}: {e}", path.display())))?;
            let sender = self.sender.clone();
            let running = self.running.clone();
            let realtime = self.config.realtime;
            self.running.store(true, Ordering::SeqCst);
            self.worker = Some(thread::spawn(move || {
                replay_lines(BufReader::new(file), &sender, &running, realtime);
            }));
        } else {
            self.running.store(true, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Stop replaying. Events already queued stay in the channel.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("replay worker panicked");
            }
        }
    }

    /// Check if the collector is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the receiver for sensor events.
    pub fn receiver(&self) -> &Receiver<SensorEvent> {
        &self.receiver
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Option<SensorEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for ReplayCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep for `total`, waking every [`SEND_RETRY_INTERVAL`] to check `running`.
///
/// Returns false if the collector was stopped while waiting.
fn pause(total: Duration, running: &AtomicBool) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let step = remaining.min(SEND_RETRY_INTERVAL);
        thread::sleep(step);
        remaining -= step;
    }
    running.load(Ordering::SeqCst)
}

fn replay_lines<R: BufRead>(
    reader: R,
    sender: &Sender<SensorEvent>,
    running: &AtomicBool,
    realtime: bool,
) {
    let mut previous_ts: Option<u64> = None;

    for (line_no, line) in reader.lines().enumerate() {
        if !running.load(Ordering::SeqCst) {
            return;
        }

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("trace read failed at line {}: {}", line_no + 1, e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: SensorEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("skipping malformed trace line {}: {}", line_no + 1, e);
                continue;
            }
        };

        if realtime {
            let ts = event.timestamp_ms();
            if let Some(prev) = previous_ts {
                let gap = Duration::from_millis(ts.saturating_sub(prev));
                if !pause(gap, running) {
                    return;
                }
            }
            previous_ts = Some(ts);
        }

        let mut pending = event;
        loop {
            match sender.send_timeout(pending, SEND_RETRY_INTERVAL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(event)) => {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    pending = event;
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    tracing::debug!("trace replay finished");
}
