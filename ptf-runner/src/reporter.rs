//! Per-test result sinks.

use crate::aggregate::RunSummary;
use crate::supervisor::TestRecord;
use crate::{Result, RunnerError};
use ptf_harness::report::{recreate_dir, report_file_name, write_json_report};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Receives each record as soon as its test finishes.
pub trait Reporter {
  fn start_run(&mut self) -> Result<()> {
    Ok(())
  }

  fn report(&mut self, record: &TestRecord) -> Result<()>;

  fn finish(&mut self, _summary: &RunSummary) -> Result<()> {
    Ok(())
  }
}

/// One line per test, `name ... ok`.
pub struct ConsoleReporter {
  out: Box<dyn Write>,
}

impl ConsoleReporter {
  pub fn new(out: Box<dyn Write>) -> Self {
    Self { out }
  }

  pub fn stderr() -> Self {
    Self::new(Box::new(io::stderr()))
  }
}

impl Reporter for ConsoleReporter {
  fn report(&mut self, record: &TestRecord) -> Result<()> {
    let line = match record.outcome.details() {
      Some(details) => format!(
        "{} ... {}: {details}",
        record.name,
        record.outcome.label()
      ),
      None => format!("{} ... {}", record.name, record.outcome.label()),
    };
    writeln!(self.out, "{line}").map_err(|err| RunnerError::Reporter(err.to_string()))
  }

  fn finish(&mut self, _summary: &RunSummary) -> Result<()> {
    self
      .out
      .flush()
      .map_err(|err| RunnerError::Reporter(err.to_string()))
  }
}

/// Writes `<dir>/<test>.json` per test. The directory is emptied when the
/// run starts.
#[derive(Debug, Clone)]
pub struct DirReporter {
  dir: PathBuf,
}

impl DirReporter {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn path_for(&self, name: &str) -> PathBuf {
    self.dir.join(report_file_name(name))
  }
}

impl Reporter for DirReporter {
  fn start_run(&mut self) -> Result<()> {
    recreate_dir(&self.dir).map_err(|err| RunnerError::Reporter(format!("{err:#}")))
  }

  fn report(&mut self, record: &TestRecord) -> Result<()> {
    write_json_report(&self.path_for(&record.name), record)
      .map_err(|err| RunnerError::Reporter(format!("{err:#}")))
  }
}

/// Keeps every record; used by tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryReporter {
  pub records: Vec<TestRecord>,
}

impl Reporter for MemoryReporter {
  fn report(&mut self, record: &TestRecord) -> Result<()> {
    self.records.push(record.clone());
    Ok(())
  }
}

/// Forwards to every inner reporter in order, stopping at the first error.
#[derive(Default)]
pub struct FanOut {
  reporters: Vec<Box<dyn Reporter>>,
}

impl FanOut {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, reporter: Box<dyn Reporter>) {
    self.reporters.push(reporter);
  }

  pub fn len(&self) -> usize {
    self.reporters.len()
  }

  pub fn is_empty(&self) -> bool {
    self.reporters.is_empty()
  }
}

impl Reporter for FanOut {
  fn start_run(&mut self) -> Result<()> {
    self.reporters.iter_mut().try_for_each(|r| r.start_run())
  }

  fn report(&mut self, record: &TestRecord) -> Result<()> {
    self.reporters.iter_mut().try_for_each(|r| r.report(record))
  }

  fn finish(&mut self, summary: &RunSummary) -> Result<()> {
    self.reporters.iter_mut().try_for_each(|r| r.finish(summary))
  }
}
