//! The monitoring loop.
//!
//! Drives probe output through the parser into the store, one line at a
//! time, and guarantees that the probe process is stopped and the store is
//! closed exactly once on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;
use crate::probe::parse::parse_line;
use crate::probe::{LineSource, Outcome};
use crate::store::{Point, Store};

/// How long to wait for an interrupt after the probe output ends, so that a
/// signal delivered to both processes is reported as a shutdown.
const EOF_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle of a monitor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initializing,
    Running,
    Draining,
    Stopped,
}

impl State {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal monitor errors. Malformed lines are not errors; they are skipped.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("preparing store: {0:#}")]
    StoreSetup(anyhow::Error),

    #[error("launching probe process: {0:#}")]
    Launch(anyhow::Error),

    #[error("reading probe output: {0:#}")]
    Read(anyhow::Error),

    #[error("probe process output ended unexpectedly")]
    ProbeExited,

    #[error("writing point for {host}: {error:#}")]
    StoreWrite { host: String, error: anyhow::Error },

    #[error("monitor has already run")]
    AlreadyRan,
}

/// Counters for a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub lines: u64,
    pub points: u64,
    pub timeouts: u64,
    pub malformed: u64,
}

/// Monitor owns the store for the duration of one run.
pub struct Monitor<S: Store> {
    store: S,
    health: Arc<HealthMetrics>,
    state: State,
    stats: RunStats,
}

impl<S: Store> Monitor<S> {
    /// Creates a monitor in the `Initializing` state.
    pub fn new(store: S, health: Arc<HealthMetrics>) -> Self {
        Self {
            store,
            health,
            state: State::Initializing,
            stats: RunStats::default(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Returns the store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs until `cancel` fires or a fatal error occurs.
    ///
    /// `launch` is called once the store is ready. Whatever the outcome, the
    /// probe source is stopped and the store closed before returning.
    pub async fn run<P, F>(
        &mut self,
        launch: F,
        cancel: CancellationToken,
    ) -> Result<RunStats, MonitorError>
    where
        P: LineSource,
        F: FnOnce() -> anyhow::Result<P>,
    {
        if self.state != State::Initializing {
            return Err(MonitorError::AlreadyRan);
        }

        info!(state = %self.state, "monitor starting");

        let result = self.drive(launch, &cancel).await;

        if let Err(e) = self.store.close().await {
            error!(error = %e, "error closing store");
        }
        self.transition(State::Stopped);

        match &result {
            Ok(stats) => info!(
                lines = stats.lines,
                points = stats.points,
                timeouts = stats.timeouts,
                malformed = stats.malformed,
                "monitor stopped",
            ),
            Err(e) => error!(error = %e, "monitor stopped on error"),
        }

        result
    }

    async fn drive<P, F>(
        &mut self,
        launch: F,
        cancel: &CancellationToken,
    ) -> Result<RunStats, MonitorError>
    where
        P: LineSource,
        F: FnOnce() -> anyhow::Result<P>,
    {
        self.store
            .ensure_ready()
            .await
            .map_err(MonitorError::StoreSetup)?;

        let mut source = launch().map_err(MonitorError::Launch)?;

        self.transition(State::Running);
        let result = self.pump(&mut source, cancel).await;

        self.transition(State::Draining);
        if let Err(e) = source.stop().await {
            error!(error = %e, "error stopping probe process");
        }

        result.map(|()| self.stats)
    }

    /// Reads, parses and writes until interrupted or the output ends.
    async fn pump<P: LineSource>(
        &mut self,
        source: &mut P,
        cancel: &CancellationToken,
    ) -> Result<(), MonitorError> {
        loop {
            if cancel.is_cancelled() {
                info!("interrupt received, draining");
                return Ok(());
            }

            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("interrupt received, draining");
                    return Ok(());
                }
                line = source.next_line() => line.map_err(MonitorError::Read)?,
            };

            let Some(line) = line else {
                return self.on_output_end(cancel).await;
            };

            self.process_line(&line).await?;
        }
    }

    async fn on_output_end(&self, cancel: &CancellationToken) -> Result<(), MonitorError> {
        if tokio::time::timeout(EOF_GRACE, cancel.cancelled())
            .await
            .is_ok()
        {
            info!("probe output ended during shutdown");
            return Ok(());
        }

        Err(MonitorError::ProbeExited)
    }

    async fn process_line(&mut self, line: &str) -> Result<(), MonitorError> {
        self.stats.lines += 1;
        self.health.lines_received.inc();

        let measurement = match parse_line(line) {
            Ok(m) => m,
            Err(e) => {
                self.stats.malformed += 1;
                self.health
                    .lines_malformed
                    .with_label_values(&[e.reason()])
                    .inc();
                warn!(error = %e, line = line.trim(), "discarding malformed probe line");
                return Ok(());
            }
        };

        let point = Point::from_measurement(&measurement);
        let outcome = measurement.outcome();

        let start = Instant::now();
        let written = self.store.write(&point).await;
        self.health
            .write_duration
            .observe(start.elapsed().as_secs_f64());

        if let Err(error) = written {
            self.health.write_errors.inc();
            return Err(MonitorError::StoreWrite {
                host: measurement.host,
                error,
            });
        }

        self.stats.points += 1;
        if outcome == Outcome::Timeout {
            self.stats.timeouts += 1;
        }
        self.health
            .points_written
            .with_label_values(&[outcome.as_str()])
            .inc();

        debug!(
            host = %measurement.host,
            latency_ms = ?measurement.latency_ms,
            %outcome,
            "point written",
        );

        Ok(())
    }

    fn transition(&mut self, next: State) {
        debug!(from = %self.state, to = %next, "monitor state change");
        if next != State::Stopped {
            info!(state = %next, "monitor state");
        }
        self.state = next;
    }
}
