//! Result output.
//!
//! Console output is unconditional. When a result file is configured the
//! same summaries, plus a line per accepted message, are mirrored to it.

use crate::error::BounceError;
use crate::stats::{BatchSummary, RunSummary, TestSummary};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::warn;

const SEPARATOR: &str = "|-------------------------------|";
const RUN_SEPARATOR: &str = "==============================================";

/// Receives progress and summaries from the aggregator.
pub trait Reporter {
    fn test_started(&mut self, _test: u32) {}
    fn sample_recorded(&mut self, _elapsed: u64, _batch_total: u64) {}
    fn threshold_hit(&mut self, _elapsed: u64, _limit: u64) {}
    fn probe_failed(&mut self, _error: &BounceError) {}
    fn batch_finished(&mut self, _batch: &BatchSummary) {}
    fn test_finished(&mut self, _test: &TestSummary) {}
    fn run_finished(&mut self, _run: &RunSummary) {}
}

/// Discards everything.
#[cfg(test)]
pub struct NullReporter;

#[cfg(test)]
impl Reporter for NullReporter {}

fn micros(value: Option<u64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v}us"))
}

fn seconds(value: Option<u64>) -> String {
    value.map_or_else(
        || "n/a".to_string(),
        |v| format!("{:.6}s", v as f64 / 1_000_000.0),
    )
}

/// Writes results to stdout and, optionally, to a file.
pub struct ResultWriter<W: Write = BufWriter<File>> {
    console: Box<dyn Write>,
    file: Option<W>,
}

impl ResultWriter {
    /// Console writer, plus a result file at `path` when given.
    pub fn create(path: Option<&Path>) -> io::Result<Self> {
        let file = match path {
            Some(path) => Some(BufWriter::new(File::create(path)?)),
            None => None,
        };
        Ok(Self::with_outputs(Box::new(io::stdout()), file))
    }
}

impl<W: Write> ResultWriter<W> {
    pub fn with_outputs(console: Box<dyn Write>, file: Option<W>) -> Self {
        let mut writer = Self { console, file };
        let started = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %z");
        writer.file_line(&format!("bounceping results, started {started}"));
        writer
    }

    fn console_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.console, "{line}") {
            warn!(error = %e, "Console write failed");
        }
    }

    fn file_line(&mut self, line: &str) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                warn!(error = %e, "Result file write failed");
            }
        }
    }

    fn both(&mut self, line: &str) {
        self.console_line(line);
        self.file_line(line);
    }

    /// Flush both outputs and hand back the file writer.
    pub fn finish(mut self) -> Option<W> {
        if let Err(e) = self.console.flush() {
            warn!(error = %e, "Console flush failed");
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                warn!(error = %e, "Result file flush failed");
            }
        }
        self.file
    }
}

impl<W: Write> Reporter for ResultWriter<W> {
    fn test_started(&mut self, test: u32) {
        self.console_line(&format!("Starting test {test}\n"));
        self.file_line(&format!("Test {test}"));
        self.file_line(SEPARATOR);
    }

    fn sample_recorded(&mut self, _elapsed: u64, batch_total: u64) {
        self.file_line(&format!(
            "Message received. Current batch time: {batch_total}us"
        ));
    }

    fn threshold_hit(&mut self, elapsed: u64, limit: u64) {
        warn!(elapsed, limit, "Threshold exceeded, cooling down before retry");
        self.file_line(&format!(
            "Discarded {elapsed}us sample (threshold {limit}us)"
        ));
    }

    fn probe_failed(&mut self, error: &BounceError) {
        self.file_line(&format!("Probe abandoned: {error}"));
    }

    fn batch_finished(&mut self, batch: &BatchSummary) {
        let total = batch.stats.total();
        let mean = micros(batch.stats.mean());
        self.console_line(&format!(
            "Batch {}: total {}us, average {} ({} samples, {} failed, {} retried){}",
            batch.batch,
            total,
            mean,
            batch.stats.count(),
            batch.failures,
            batch.retries,
            if batch.complete { "" } else { " [interrupted]" }
        ));
        self.file_line("");
        self.file_line(&format!("Total message time: {total}us"));
        self.file_line(&format!("Average message time: {mean}"));
    }

    fn test_finished(&mut self, test: &TestSummary) {
        let total = test.total();
        let mean = micros(test.mean_batch());
        self.console_line("");
        self.console_line(&format!(
            "Test {}: total batch time {}us, average batch time {}",
            test.test, total, mean
        ));
        self.file_line("");
        self.file_line(&format!("Total batch time: {total}us"));
        self.file_line(&format!("Average batch time: {mean}"));
        self.file_line(SEPARATOR);
    }

    fn run_finished(&mut self, run: &RunSummary) {
        let total = seconds(Some(run.total()));
        let mean = seconds(run.mean_test());
        self.console_line("");
        self.file_line(RUN_SEPARATOR);
        self.both(&format!("Total test time: {total}"));
        self.both(&format!("Average test time: {mean}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::LatencyStats;
    use std::io::Read;

    fn batch(test: u32, batch: u32, samples: &[u64]) -> BatchSummary {
        let mut stats = LatencyStats::default();
        for &s in samples {
            stats.record(s);
        }
        BatchSummary {
            test,
            batch,
            stats,
            failures: 0,
            retries: 0,
            complete: true,
        }
    }

    #[test]
    fn test_formatting_helpers() {
        assert_eq!(micros(Some(42)), "42us");
        assert_eq!(micros(None), "n/a");
        assert_eq!(seconds(Some(1_500_000)), "1.500000s");
        assert_eq!(seconds(None), "n/a");
    }

    #[test]
    fn test_result_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.txt");

        let mut writer = ResultWriter::create(Some(path.as_path())).unwrap();
        writer.test_started(0);
        writer.sample_recorded(100, 100);
        writer.sample_recorded(200, 300);
        let b = batch(0, 0, &[100, 200]);
        writer.batch_finished(&b);
        let test = TestSummary {
            test: 0,
            batches: vec![b],
            complete: true,
        };
        writer.test_finished(&test);
        writer.run_finished(&RunSummary { tests: vec![test] });
        writer.finish();

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();

        assert!(contents.starts_with("bounceping results, started "));
        assert!(contents.contains("Test 0\n"));
        assert!(contents.contains("Message received. Current batch time: 300us"));
        assert!(contents.contains("Total message time: 300us"));
        assert!(contents.contains("Average message time: 150us"));
        assert!(contents.contains("Average batch time: 300us"));
        assert!(contents.contains("Total test time: 0.000300s"));
    }

    #[test]
    fn test_console_only() {
        let mut writer: ResultWriter<Vec<u8>> = ResultWriter::with_outputs(Box::new(io::sink()), None);
        writer.batch_finished(&batch(0, 3, &[]));
        assert!(writer.finish().is_none());
    }

    /// Console that rejects every write.
    struct BrokenConsole;

    impl Write for BrokenConsole {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn test_console_failure_keeps_result_file() {
        let mut writer = ResultWriter::with_outputs(Box::new(BrokenConsole), Some(Vec::new()));
        let mut partial = batch(0, 1, &[25]);
        partial.complete = false;
        writer.batch_finished(&partial);

        let file = String::from_utf8(writer.finish().unwrap()).unwrap();
        assert!(file.contains("Total message time: 25us"));
    }

    #[test]
    fn test_file_mirrors_summaries() {
        let mut writer = ResultWriter::with_outputs(Box::new(io::sink()), Some(Vec::new()));
        writer.batch_finished(&batch(1, 2, &[10, 30]));
        let file = String::from_utf8(writer.finish().unwrap()).unwrap();
        assert!(file.contains("Total message time: 40us"));
        assert!(file.contains("Average message time: 20us"));
    }
}
