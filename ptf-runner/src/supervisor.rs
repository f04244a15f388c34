use crate::aggregate::Aggregator;
use crate::catalog::TestDescriptor;
use crate::config::RunConfig;
use crate::registry::{TestCase, TestError, TestRegistry};
use crate::reporter::Reporter;
use crate::session::Session;
use crate::{Result, RunnerError};
use ptf_harness::{CancelToken, TimeoutManager};
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
  Pass,
  Fail { details: String },
  Error { details: String },
  /// The per-test deadline passed before the test completed.
  Timeout { details: String },
}

impl ExecutionOutcome {
  pub fn is_pass(&self) -> bool {
    matches!(self, ExecutionOutcome::Pass)
  }

  pub fn details(&self) -> Option<&str> {
    match self {
      ExecutionOutcome::Pass => None,
      ExecutionOutcome::Fail { details }
      | ExecutionOutcome::Error { details }
      | ExecutionOutcome::Timeout { details } => Some(details),
    }
  }

  pub fn label(&self) -> &'static str {
    match self {
      ExecutionOutcome::Pass => "ok",
      ExecutionOutcome::Fail { .. } => "FAIL",
      ExecutionOutcome::Error { .. } => "ERROR",
      ExecutionOutcome::Timeout { .. } => "TIMEOUT",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRecord {
  pub name: String,
  pub outcome: ExecutionOutcome,
  pub duration_ms: u128,
}

pub struct RunnableTest {
  pub descriptor: Arc<TestDescriptor>,
  pub case: Box<dyn TestCase>,
}

impl RunnableTest {
  pub fn name(&self) -> &str {
    &self.descriptor.qualified_name
  }
}

/// Instantiates every descriptor through the registry, keeping order.
pub fn instantiate(
  tests: Vec<Arc<TestDescriptor>>,
  registry: &TestRegistry,
) -> Result<Vec<RunnableTest>> {
  tests
    .into_iter()
    .map(|descriptor| {
      let case = registry
        .instantiate(&descriptor.implementation)
        .ok_or_else(|| RunnerError::UnknownImpl {
          name: descriptor.qualified_name.clone(),
          implementation: descriptor.implementation.clone(),
        })?;
      Ok(RunnableTest { descriptor, case })
    })
    .collect()
}

/// Runs a shard's tests one after another against a shared session.
pub struct Supervisor<'a> {
  config: &'a RunConfig,
  timeouts: &'a TimeoutManager,
}

impl<'a> Supervisor<'a> {
  pub fn new(config: &'a RunConfig, timeouts: &'a TimeoutManager) -> Self {
    Self { config, timeouts }
  }

  /// The test's own override, else the global per-test timeout. Zero means
  /// no timeout.
  pub fn effective_timeout(&self, descriptor: &TestDescriptor) -> Option<Duration> {
    descriptor
      .timeout_override
      .or(self.config.test_case_timeout)
      .filter(|timeout| !timeout.is_zero())
  }

  /// Runs `tests` in order. With failfast, the first non-passing test ends
  /// the shard and the rest are neither run nor reported.
  pub fn run(
    &self,
    tests: Vec<RunnableTest>,
    session: &Session,
    reporter: &mut dyn Reporter,
    aggregator: &mut Aggregator,
  ) -> Result<()> {
    let total = tests.len();
    for (idx, mut test) in tests.into_iter().enumerate() {
      let record = self.run_one(&mut test, session)?;
      let passed = record.outcome.is_pass();
      reporter.report(&record)?;
      aggregator.record(record);
      if self.config.failfast && !passed {
        info!(
          test = test.name(),
          remaining = total - idx - 1,
          "failfast: stopping after first non-passing test"
        );
        break;
      }
    }
    Ok(())
  }

  /// Runs one test. Only watchdog misuse is an `Err`; whatever the test
  /// does is captured in the record.
  pub fn run_one(&self, test: &mut RunnableTest, session: &Session) -> Result<TestRecord> {
    let descriptor = Arc::clone(&test.descriptor);
    let name = descriptor.qualified_name.as_str();
    let _span = info_span!("test", name).entered();
    let timeout = self.effective_timeout(&descriptor);

    let guard = match timeout {
      Some(timeout) => Some(self.timeouts.arm(timeout)?),
      None => None,
    };
    let unbounded = CancelToken::never();
    let token = guard.as_ref().map(|guard| guard.token()).unwrap_or(&unbounded);

    let started = Instant::now();
    let ctx = session.context(self.config, name, token);
    let result = catch_unwind(AssertUnwindSafe(|| test.case.run(&ctx)));
    let elapsed = started.elapsed();
    let fired = token.is_cancelled();
    drop(guard);

    let outcome = classify(result, fired, timeout);
    match &outcome {
      ExecutionOutcome::Pass => info!(elapsed_ms = elapsed.as_millis() as u64, "test passed"),
      other => warn!(
        outcome = other.label(),
        details = other.details().unwrap_or_default(),
        "test did not pass"
      ),
    }

    // Leftover frames must not leak into the next test.
    session.dataplane().flush();

    Ok(TestRecord {
      name: name.to_string(),
      outcome,
      duration_ms: elapsed.as_millis(),
    })
  }
}

fn classify(
  result: std::thread::Result<std::result::Result<(), TestError>>,
  fired: bool,
  timeout: Option<Duration>,
) -> ExecutionOutcome {
  if let (true, Some(timeout)) = (fired, timeout) {
    let mut details = format!("test exceeded its timeout of {:.3}s", timeout.as_secs_f64());
    match &result {
      Ok(Err(TestError::Fail(message) | TestError::Error(message))) => {
        details.push_str(&format!(" ({message})"));
      }
      Err(payload) => details.push_str(&format!(" (panicked: {})", panic_message(&**payload))),
      _ => {}
    }
    return ExecutionOutcome::Timeout { details };
  }

  match result {
    Ok(Ok(())) => ExecutionOutcome::Pass,
    Ok(Err(TestError::Fail(details))) => ExecutionOutcome::Fail { details },
    Ok(Err(TestError::Error(details))) => ExecutionOutcome::Error { details },
    Ok(Err(TestError::Cancelled)) => ExecutionOutcome::Error {
      details: "test was cancelled without a deadline".to_string(),
    },
    Err(payload) => ExecutionOutcome::Error {
      details: format!("panicked: {}", panic_message(&*payload)),
    },
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::catalog::{Catalog, TestEntry, TestUnit};
  use crate::config::PlatformKind;
  use crate::loopback::{ConfiguredPlatform, LoopbackFactory};
  use crate::reporter::MemoryReporter;

  fn config() -> RunConfig {
    RunConfig {
      platform: PlatformKind::Loopback,
      test_case_timeout: Some(Duration::from_secs(10)),
      ..RunConfig::default()
    }
  }

  fn registry() -> TestRegistry {
    let mut registry = TestRegistry::new();
    registry
      .register_fn("m.Pass", |_| Ok(()))
      .register_fn("m.Fail", |_| Err(TestError::fail("expected 1, got 2")))
      .register_fn("m.Error", |_| Err(TestError::error("socket vanished")))
      .register_fn("m.Panic", |_| panic!("boom"))
      .register_fn("m.Block", |ctx| {
        // Blocks on the dataplane far longer than its own timeout.
        ctx
          .dataplane()
          .poll(0, 0, Duration::from_secs(5), ctx.cancel())?;
        Ok(())
      })
      .register_fn("m.Skip", |ctx| {
        ctx.skip("needs hardware");
        Ok(())
      });
    registry
  }

  fn runnable(names: &[(&str, Option<f64>)]) -> Vec<RunnableTest> {
    let registry = registry();
    let entries = names
      .iter()
      .map(|(name, timeout)| TestEntry {
        timeout_secs: *timeout,
        ..TestEntry::named(*name)
      })
      .collect();
    let catalog = Catalog::from_units(vec![TestUnit::new("m", entries)], &registry).unwrap();
    instantiate(catalog.tests().cloned().collect(), &registry).unwrap()
  }

  fn run(config: &RunConfig, tests: Vec<RunnableTest>) -> (Aggregator, MemoryReporter, usize) {
    let session = Session::open(config, &ConfiguredPlatform, &LoopbackFactory).unwrap();
    let timeouts = TimeoutManager::new().unwrap();
    let supervisor = Supervisor::new(config, &timeouts);
    let mut reporter = MemoryReporter::default();
    let mut aggregator = Aggregator::default();
    supervisor
      .run(tests, &session, &mut reporter, &mut aggregator)
      .unwrap();
    let skipped = session.skipped();
    (aggregator, reporter, skipped)
  }

  #[test]
  fn outcomes_are_captured_without_aborting_the_run() {
    let config = config();
    let tests = runnable(&[
      ("Pass", None),
      ("Fail", None),
      ("Error", None),
      ("Panic", None),
      ("Skip", None),
    ]);
    let (aggregator, reporter, skipped) = run(&config, tests);
    let labels: Vec<_> = reporter.records.iter().map(|r| r.outcome.label()).collect();
    assert_eq!(labels, vec!["ok", "FAIL", "ERROR", "ERROR", "ok"]);
    assert_eq!(
      reporter.records[3].outcome.details(),
      Some("panicked: boom")
    );
    assert_eq!(skipped, 1);

    let summary = aggregator.finish(skipped);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors, 2);
  }

  #[test]
  fn override_shorter_than_global_times_out_and_run_continues() {
    let config = config();
    let tests = runnable(&[("Block", Some(0.2)), ("Pass", None)]);
    let started = Instant::now();
    let (_, reporter, _) = run(&config, tests);
    assert!(started.elapsed() < Duration::from_secs(4));

    assert!(matches!(
      reporter.records[0].outcome,
      ExecutionOutcome::Timeout { .. }
    ));
    assert_eq!(reporter.records[1].outcome, ExecutionOutcome::Pass);
  }

  #[test]
  fn timeout_beyond_the_clock_runs_unbounded() {
    let config = RunConfig {
      test_case_timeout: Some(Duration::try_from_secs_f64(1e19).unwrap()),
      ..config()
    };
    let tests = runnable(&[("Pass", None), ("Fail", Some(1e18))]);
    let (_, reporter, _) = run(&config, tests);
    let labels: Vec<_> = reporter.records.iter().map(|r| r.outcome.label()).collect();
    assert_eq!(labels, vec!["ok", "FAIL"]);
  }

  #[test]
  fn failfast_stops_after_first_non_pass() {
    let config = RunConfig {
      failfast: true,
      ..config()
    };
    let tests = runnable(&[("Pass", None), ("Fail", None), ("Error", None)]);
    let (aggregator, reporter, _) = run(&config, tests);
    assert_eq!(reporter.records.len(), 2);
    assert_eq!(aggregator.finish(0).total, 2);
  }

  #[test]
  fn effective_timeout_prefers_override_and_zero_disables() {
    let config = config();
    let timeouts = TimeoutManager::new().unwrap();
    let supervisor = Supervisor::new(&config, &timeouts);
    let tests = runnable(&[("Pass", None), ("Fail", Some(1.0)), ("Error", Some(0.0))]);
    let timeouts: Vec<_> = tests
      .iter()
      .map(|t| supervisor.effective_timeout(&t.descriptor))
      .collect();
    assert_eq!(
      timeouts,
      vec![
        Some(Duration::from_secs(10)),
        Some(Duration::from_secs(1)),
        None
      ]
    );
  }

  #[test]
  fn cancelled_without_deadline_is_an_error() {
    let outcome = classify(Ok(Err(TestError::Cancelled)), false, None);
    assert!(matches!(outcome, ExecutionOutcome::Error { .. }));
    let outcome = classify(Ok(Ok(())), true, Some(Duration::from_secs(1)));
    assert!(matches!(outcome, ExecutionOutcome::Timeout { .. }));
  }
}
