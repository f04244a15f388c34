use crate::supervisor::{ExecutionOutcome, TestRecord};
use serde::Serialize;
use std::fmt;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// A test that did not pass, as listed in the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonPassing {
  pub name: String,
  pub details: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
  pub total: usize,
  pub passed: usize,
  pub failed: usize,
  pub errors: usize,
  pub timeouts: usize,
  /// Reported by tests that declined to run; they still count as passed.
  pub skipped: usize,
  pub failures: Vec<NonPassing>,
  #[serde(rename = "errored")]
  pub error_list: Vec<NonPassing>,
  #[serde(rename = "timed_out")]
  pub timeout_list: Vec<NonPassing>,
}

impl RunSummary {
  /// No failures, errors or timeouts, and no skips when `fail_skipped` is
  /// set.
  pub fn success(&self, fail_skipped: bool) -> bool {
    self.failed == 0
      && self.errors == 0
      && self.timeouts == 0
      && !(fail_skipped && self.skipped > 0)
  }
}

impl fmt::Display for RunSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "Ran {} test(s): {} passed, {} failed, {} errors, {} timed out",
      self.total, self.passed, self.failed, self.errors, self.timeouts
    )?;
    if self.skipped > 0 {
      writeln!(f, "{} test(s) skipped", self.skipped)?;
    }
    if !self.failures.is_empty() || !self.error_list.is_empty() {
      writeln!(f, "Failed/errored tests:")?;
      for entry in self.failures.iter().chain(self.error_list.iter()) {
        writeln!(f, "  {}", entry.name)?;
      }
    }
    if !self.timeout_list.is_empty() {
      writeln!(f, "Timed out tests:")?;
      for entry in &self.timeout_list {
        writeln!(f, "  {}", entry.name)?;
      }
    }
    Ok(())
  }
}

/// Collects records in execution order.
#[derive(Debug, Default)]
pub struct Aggregator {
  records: Vec<TestRecord>,
}

impl Aggregator {
  pub fn record(&mut self, record: TestRecord) {
    self.records.push(record);
  }

  pub fn records(&self) -> &[TestRecord] {
    &self.records
  }

  pub fn finish(&self, skipped: usize) -> RunSummary {
    let mut summary = RunSummary {
      skipped,
      ..RunSummary::default()
    };
    for record in &self.records {
      summary.total += 1;
      let entry = |details: &str| NonPassing {
        name: record.name.clone(),
        details: details.to_string(),
      };
      match &record.outcome {
        ExecutionOutcome::Pass => summary.passed += 1,
        ExecutionOutcome::Fail { details } => {
          summary.failed += 1;
          summary.failures.push(entry(details));
        }
        ExecutionOutcome::Error { details } => {
          summary.errors += 1;
          summary.error_list.push(entry(details));
        }
        ExecutionOutcome::Timeout { details } => {
          summary.timeouts += 1;
          summary.timeout_list.push(entry(details));
        }
      }
    }
    summary
  }
}
