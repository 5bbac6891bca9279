//! Latency aggregation and the test/batch/probe loop.
//!
//! Samples are plain running sums. Means always divide by the number of
//! units that actually completed, so a run cut short by shutdown or a batch
//! with abandoned probes still reports honest averages.

use crate::config::Config;
use crate::error::BounceError;
use crate::report::Reporter;
use crate::shutdown::CancellationToken;
use std::time::Duration;
use tracing::{debug, warn};

/// Pause after a threshold breach before retrying the same slot.
pub const THRESHOLD_COOLDOWN: Duration = Duration::from_secs(5);

/// Pause between batches.
pub const BATCH_PAUSE: Duration = Duration::from_millis(10);

/// One completed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Elapsed microseconds reported by the terminal hop.
    pub elapsed: u64,
    /// Relay transitions in the chain.
    pub relays: u32,
}

/// Runs one probe exchange end to end.
pub trait Prober {
    fn probe(&mut self) -> Result<ProbeOutcome, BounceError>;
}

/// Running sum and count of latency samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    sum: u64,
    count: u64,
}

impl LatencyStats {
    pub fn record(&mut self, micros: u64) {
        self.sum = self.sum.saturating_add(micros);
        self.count += 1;
    }

    /// Total microseconds.
    pub fn total(&self) -> u64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean microseconds, `None` before the first sample.
    pub fn mean(&self) -> Option<u64> {
        (self.count > 0).then(|| self.sum / self.count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub test: u32,
    pub batch: u32,
    pub stats: LatencyStats,
    /// Probes abandoned on protocol errors.
    pub failures: u32,
    /// Samples discarded for exceeding the threshold.
    pub retries: u32,
    /// Every slot was attempted; false when shutdown cut the batch short.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSummary {
    pub test: u32,
    /// Every batch recorded, including a trailing partial one.
    pub batches: Vec<BatchSummary>,
    /// All configured batches ran to completion.
    pub complete: bool,
}

impl TestSummary {
    /// Sum of all batch totals, in microseconds.
    pub fn total(&self) -> u64 {
        self.batches.iter().map(|b| b.stats.total()).sum()
    }

    /// Mean batch total over completed batches only.
    pub fn mean_batch(&self) -> Option<u64> {
        mean_of(
            self.batches
                .iter()
                .filter(|b| b.complete)
                .map(|b| b.stats.total()),
        )
    }

    pub fn samples(&self) -> u64 {
        self.batches.iter().map(|b| b.stats.count()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tests: Vec<TestSummary>,
}

impl RunSummary {
    pub fn total(&self) -> u64 {
        self.tests.iter().map(TestSummary::total).sum()
    }

    /// Mean test total over completed tests only.
    pub fn mean_test(&self) -> Option<u64> {
        mean_of(self.tests.iter().filter(|t| t.complete).map(TestSummary::total))
    }

    pub fn samples(&self) -> u64 {
        self.tests.iter().map(TestSummary::samples).sum()
    }
}

fn mean_of(totals: impl Iterator<Item = u64>) -> Option<u64> {
    let (sum, n) = totals.fold((0u64, 0u64), |(sum, n), t| (sum.saturating_add(t), n + 1));
    (n > 0).then(|| sum / n)
}

/// How many probes to run and how to pace them.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub tests: u32,
    pub batches: u32,
    pub count: u32,
    /// Outlier threshold in microseconds.
    pub threshold: Option<u64>,
    pub cooldown: Duration,
    pub batch_pause: Duration,
    pub test_interval: Duration,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tests: config.tests,
            batches: config.batches,
            count: config.count,
            threshold: config.threshold,
            cooldown: THRESHOLD_COOLDOWN,
            batch_pause: BATCH_PAUSE,
            test_interval: config.interval,
        }
    }
}

/// Drives tests, batches and probes, feeding samples to a reporter.
pub struct Aggregator<'a> {
    schedule: Schedule,
    reporter: &'a mut dyn Reporter,
    token: CancellationToken,
}

impl<'a> Aggregator<'a> {
    pub fn new(schedule: Schedule, reporter: &'a mut dyn Reporter, token: CancellationToken) -> Self {
        Self {
            schedule,
            reporter,
            token,
        }
    }

    /// Run the whole schedule. Stops early, with partial results, once the
    /// token is cancelled; fails on the first fatal probe error.
    pub fn run(&mut self, prober: &mut dyn Prober) -> Result<RunSummary, BounceError> {
        let mut run = RunSummary::default();

        for test in 0..self.schedule.tests {
            if self.token.is_cancelled() {
                break;
            }
            self.reporter.test_started(test);

            let mut summary = TestSummary {
                test,
                batches: Vec::with_capacity(self.schedule.batches as usize),
                complete: false,
            };
            for batch in 0..self.schedule.batches {
                if self.token.is_cancelled() {
                    break;
                }
                let result = self.run_batch(test, batch, prober)?;
                self.reporter.batch_finished(&result);
                summary.batches.push(result);
                self.token.sleep(self.schedule.batch_pause);
            }
            summary.complete = summary.batches.len() == self.schedule.batches as usize
                && summary.batches.iter().all(|b| b.complete);

            self.reporter.test_finished(&summary);
            run.tests.push(summary);

            if test + 1 < self.schedule.tests {
                self.token.sleep(self.schedule.test_interval);
            }
        }

        self.reporter.run_finished(&run);
        Ok(run)
    }

    fn run_batch(
        &mut self,
        test: u32,
        batch: u32,
        prober: &mut dyn Prober,
    ) -> Result<BatchSummary, BounceError> {
        let mut summary = BatchSummary {
            test,
            batch,
            stats: LatencyStats::default(),
            failures: 0,
            retries: 0,
            complete: false,
        };

        let mut slot = 0;
        while slot < self.schedule.count {
            if self.token.is_cancelled() {
                debug!(test, batch, slot, "Batch cut short by shutdown");
                break;
            }

            match prober.probe() {
                Ok(outcome) => {
                    if let Some(limit) = self.schedule.threshold {
                        if outcome.elapsed > limit {
                            summary.retries += 1;
                            self.reporter.threshold_hit(outcome.elapsed, limit);
                            self.token.sleep(self.schedule.cooldown);
                            continue;
                        }
                    }
                    summary.stats.record(outcome.elapsed);
                    self.reporter.sample_recorded(outcome.elapsed, summary.stats.total());
                    slot += 1;
                }
                Err(e) if e.is_probe_local() => {
                    warn!(test, batch, slot, error = %e, "Probe abandoned");
                    summary.failures += 1;
                    self.reporter.probe_failed(&e);
                    slot += 1;
                }
                Err(e) => return Err(e),
            }
        }

        summary.complete = slot == self.schedule.count;
        Ok(summary)
    }
}
