//! Command-line surface and the end-to-end run pipeline.

use crate::aggregate::{Aggregator, RunSummary, REPORT_SCHEMA_VERSION};
use crate::catalog::{load_catalog, Catalog};
use crate::config::{ListMode, PlatformKind, PortSpec, RunConfig};
use crate::loopback::{ConfiguredPlatform, LoopbackFactory};
use crate::params::TestParams;
use crate::registry::TestRegistry;
use crate::reporter::{ConsoleReporter, DirReporter, FanOut, Reporter};
use crate::selection::{parse_tokens, read_selection_file, resolve};
use crate::session::{DataplaneFactory, Platform, Session};
use crate::supervisor::{instantiate, Supervisor};
use crate::{Result, RunnerError};
use clap::Parser;
use ptf_harness::report::{write_json_report, write_json_report_to_writer, ReportRef};
use ptf_harness::{apply_order, apply_shard, ShardSpec, TestOrder, TimeoutManager};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ptf", version, about = "Run dataplane conformance tests", long_about = None)]
pub struct Cli {
  /// Test names or groups to run; prefix with `^` to exclude
  #[arg(value_name = "TOKEN")]
  pub tokens: Vec<String>,

  /// Read selection tokens from a file, one per line
  #[arg(long, value_name = "PATH")]
  pub test_file: Option<PathBuf>,

  /// Directory holding the test manifests
  #[arg(long, value_name = "DIR", default_value = "tests")]
  pub test_dir: PathBuf,

  #[arg(long, value_enum, default_value = "default")]
  pub test_order: TestOrder,

  /// Seed for `--test-order rand` (decimal or 0x-prefixed hex)
  #[arg(long, value_parser = parse_seed, default_value = "0xaba")]
  pub test_order_seed: u64,

  #[arg(long, default_value_t = 1)]
  pub num_shards: usize,

  /// Zero-based shard to run
  #[arg(long, default_value_t = 0)]
  pub shard_id: usize,

  /// Stop after the first test that does not pass
  #[arg(long)]
  pub failfast: bool,

  /// Treat skipped tests as a failed run
  #[arg(long)]
  pub fail_skipped: bool,

  /// Dataplane poll timeout in seconds
  #[arg(long, value_name = "SECS", default_value_t = 2.0)]
  pub default_timeout: f64,

  /// Poll timeout in seconds for checks that expect no packet
  #[arg(long, value_name = "SECS", default_value_t = 0.1)]
  pub default_negative_timeout: f64,

  /// Per-test timeout in seconds; 0 disables it
  #[arg(long, value_name = "SECS", default_value_t = 0.0)]
  pub test_case_timeout: f64,

  #[arg(long, value_enum, default_value = "static")]
  pub platform: PlatformKind,

  /// Number of ports for `--platform loopback`
  #[arg(long, default_value_t = 4)]
  pub loopback_ports: u32,

  /// Port mapping `[device-]port@interface`; repeatable
  #[arg(short = 'i', long = "interface", value_name = "SPEC")]
  pub interfaces: Vec<PortSpec>,

  /// Test parameters as `key=value;key=value`
  #[arg(long, value_name = "PARAMS")]
  pub test_params: Option<String>,

  /// Write one JSON record per test into this directory
  #[arg(long, value_name = "DIR")]
  pub report_dir: Option<PathBuf>,

  /// Write the run report as JSON (`-` for stdout)
  #[arg(long, value_name = "PATH")]
  pub json_report: Option<PathBuf>,

  /// List the catalog and its groups, then exit
  #[arg(long, conflicts_with = "list_test_names")]
  pub list: bool,

  /// List the names of the selected tests, then exit
  #[arg(long)]
  pub list_test_names: bool,

  /// Log at debug level
  #[arg(short, long, conflicts_with = "quiet")]
  pub verbose: bool,

  /// Only log warnings and errors
  #[arg(short, long)]
  pub quiet: bool,
}

impl Cli {
  /// Validates the arguments and freezes them into a [`RunConfig`].
  pub fn into_config(self) -> Result<RunConfig> {
    let shard =
      ShardSpec::new(self.shard_id, self.num_shards).map_err(RunnerError::InvalidShard)?;

    let mut selection = self.tokens;
    if let Some(path) = &self.test_file {
      selection.extend(read_selection_file(path)?);
    }

    let params = match &self.test_params {
      Some(raw) => TestParams::parse(raw)?,
      None => TestParams::default(),
    };

    let test_case_timeout = seconds("--test-case-timeout", self.test_case_timeout)?;
    let list = if self.list {
      ListMode::Catalog
    } else if self.list_test_names {
      ListMode::TestNames
    } else {
      ListMode::Run
    };

    Ok(RunConfig {
      test_dir: self.test_dir,
      selection,
      order: self.test_order,
      order_seed: self.test_order_seed,
      shard,
      failfast: self.failfast,
      fail_skipped: self.fail_skipped,
      default_timeout: seconds("--default-timeout", self.default_timeout)?,
      negative_timeout: seconds("--default-negative-timeout", self.default_negative_timeout)?,
      test_case_timeout: (!test_case_timeout.is_zero()).then_some(test_case_timeout),
      platform: self.platform,
      loopback_ports: self.loopback_ports,
      interfaces: self.interfaces,
      params,
      report_dir: self.report_dir,
      json_report: self.json_report,
      list,
    })
  }
}

fn seconds(flag: &str, raw: f64) -> Result<Duration> {
  Duration::try_from_secs_f64(raw)
    .map_err(|err| RunnerError::Config(format!("{flag} must be a non-negative number: {err}")))
}

fn parse_seed(raw: &str) -> std::result::Result<u64, String> {
  let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
    Some(hex) => u64::from_str_radix(hex, 16),
    None => raw.parse(),
  };
  parsed.map_err(|err| format!("invalid seed `{raw}`: {err}"))
}

/// What a pipeline invocation ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
  /// A list mode printed its output; nothing ran.
  Listed,
  Completed(RunSummary),
}

impl RunStatus {
  pub fn success(&self, fail_skipped: bool) -> bool {
    match self {
      RunStatus::Listed => true,
      RunStatus::Completed(summary) => summary.success(fail_skipped),
    }
  }

  pub fn summary(&self) -> Option<&RunSummary> {
    match self {
      RunStatus::Listed => None,
      RunStatus::Completed(summary) => Some(summary),
    }
  }
}

/// Console output plus a per-test directory when `--report-dir` is set.
pub fn build_reporter(config: &RunConfig) -> FanOut {
  let mut reporter = FanOut::new();
  reporter.push(Box::new(ConsoleReporter::stderr()));
  if let Some(dir) = &config.report_dir {
    reporter.push(Box::new(DirReporter::new(dir)));
  }
  reporter
}

/// Load, select, shard, order, run and summarize.
///
/// Listings and the final summary go to `out`; per-test lines go to
/// `reporter`.
pub fn execute(
  config: &RunConfig,
  registry: &TestRegistry,
  platform: &dyn Platform,
  factory: &dyn DataplaneFactory,
  reporter: &mut dyn Reporter,
  out: &mut dyn Write,
) -> Result<RunStatus> {
  let catalog = load_catalog(&config.test_dir, registry)?;
  if config.list == ListMode::Catalog {
    print_catalog(&catalog, out)?;
    return Ok(RunStatus::Listed);
  }

  let tokens = parse_tokens(&config.selection)?;
  let suite = resolve(&tokens, &catalog)?;
  if config.list == ListMode::TestNames {
    for name in suite.names() {
      writeln!(out, "{name}")?;
    }
    return Ok(RunStatus::Listed);
  }

  let selected = suite.len();
  let mut tests = apply_shard(suite.into_tests(), config.shard);
  apply_order(&mut tests, config.order, config.order_seed, |test| {
    test.qualified_name.as_str()
  });
  info!(
    shard = %config.shard,
    selected,
    running = tests.len(),
    order = config.order.as_str(),
    "starting run"
  );
  let tests = instantiate(tests, registry)?;

  reporter.start_run()?;
  let mut session = Session::open(config, platform, factory)?;
  let timeouts = TimeoutManager::new()?;
  let mut aggregator = Aggregator::default();
  let ran = Supervisor::new(config, &timeouts).run(tests, &session, reporter, &mut aggregator);
  let skipped = session.skipped();
  let closed = session.close();
  if let Err(err) = ran {
    // Tests that finished before the abort are still summarized.
    let partial = aggregator.finish(skipped);
    if let Err(write_err) = write!(out, "{partial}") {
      warn!(%write_err, "failed to print partial summary");
    }
    if let Err(close_err) = closed {
      warn!(%close_err, "dataplane teardown failed");
    }
    return Err(err);
  }
  closed?;

  let summary = aggregator.finish(skipped);
  reporter.finish(&summary)?;
  write!(out, "{summary}")?;
  if let Some(path) = &config.json_report {
    let report = ReportRef::new(REPORT_SCHEMA_VERSION, &summary, aggregator.records());
    write_report(path, &report, out)?;
  }
  info!(success = summary.success(config.fail_skipped), "run finished");
  Ok(RunStatus::Completed(summary))
}

fn write_report<T: serde::Serialize>(
  path: &Path,
  report: &T,
  mut out: &mut dyn Write,
) -> Result<()> {
  let written = if path == Path::new("-") {
    write_json_report_to_writer(&mut out, report)
  } else {
    write_json_report(path, report)
  };
  written.map_err(|err| RunnerError::Reporter(format!("{err:#}")))
}

fn print_catalog(catalog: &Catalog, out: &mut dyn Write) -> Result<()> {
  for module in catalog.modules() {
    match &module.info.doc {
      Some(doc) => writeln!(out, "{}: {}", module.name, doc.trim())?,
      None => writeln!(out, "{}", module.name)?,
    }
    for test in &module.tests {
      writeln!(out, "  {} [{}]", test.qualified_name, test.groups.join(", "))?;
    }
  }
  let groups: Vec<_> = catalog.groups().into_iter().collect();
  writeln!(out, "groups: {}", groups.join(", "))?;
  writeln!(out, "{} test(s) in {} module(s)", catalog.len(), catalog.modules().len())?;
  Ok(())
}

pub fn init_tracing(verbose: bool, quiet: bool) {
  let level = if verbose {
    "debug"
  } else if quiet {
    "warn"
  } else {
    "info"
  };
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  let builder = fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr);
  if let Err(err) = builder.try_init() {
    eprintln!("failed to install tracing subscriber: {err}");
  }
}

/// Binary entry point: parse, run with the in-memory collaborators, and map
/// the result onto the exit code.
pub fn main_with(registry: TestRegistry) -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose, cli.quiet);
  match try_main(cli, &registry) {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::from(1),
    Err(err) => {
      eprintln!("error: {err:#}");
      ExitCode::from(1)
    }
  }
}

fn try_main(cli: Cli, registry: &TestRegistry) -> anyhow::Result<bool> {
  let config = cli.into_config()?;
  let mut reporter = build_reporter(&config);
  let stdout = io::stdout();
  let mut out = stdout.lock();
  let status = execute(
    &config,
    registry,
    &ConfiguredPlatform,
    &LoopbackFactory,
    &mut reporter,
    &mut out,
  )?;
  out.flush()?;
  Ok(status.success(config.fail_skipped))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cli(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("ptf").chain(args.iter().copied())).unwrap()
  }

  #[test]
  fn defaults_match_documented_values() {
    let config = cli(&[]).into_config().unwrap();
    assert_eq!(config.order, TestOrder::Default);
    assert_eq!(config.order_seed, 0xaba);
    assert_eq!(config.shard, ShardSpec::default());
    assert_eq!(config.default_timeout, Duration::from_secs(2));
    assert_eq!(config.negative_timeout, Duration::from_millis(100));
    assert_eq!(config.test_case_timeout, None);
    assert!(config.selection.is_empty());
    assert_eq!(config.list, ListMode::Run);
  }

  #[test]
  fn flags_flow_into_config() {
    let config = cli(&[
      "mod1",
      "^mod1.T2",
      "--test-order",
      "rand",
      "--test-order-seed",
      "42",
      "--num-shards",
      "3",
      "--shard-id",
      "2",
      "--test-case-timeout",
      "1.5",
      "-i",
      "1-2@veth2",
      "--test-params",
      "mtu=1500;name='a;b'",
      "--failfast",
      "--list-test-names",
    ])
    .into_config()
    .unwrap();
    assert_eq!(config.selection, vec!["mod1", "^mod1.T2"]);
    assert_eq!(config.order, TestOrder::Rand);
    assert_eq!(config.order_seed, 42);
    assert_eq!(config.shard, ShardSpec::new(2, 3).unwrap());
    assert_eq!(config.test_case_timeout, Some(Duration::from_millis(1500)));
    assert_eq!(config.interfaces[0].interface, "veth2");
    assert_eq!(config.params.get("mtu").and_then(|v| v.as_i64()), Some(1500));
    assert_eq!(config.params.get("name").and_then(|v| v.as_str()), Some("a;b"));
    assert!(config.failfast);
    assert_eq!(config.list, ListMode::TestNames);
  }

  #[test]
  fn invalid_shard_and_timeouts_are_rejected() {
    let err = cli(&["--num-shards", "2", "--shard-id", "2"])
      .into_config()
      .unwrap_err();
    assert!(matches!(err, RunnerError::InvalidShard(_)));

    let err = cli(&["--num-shards", "0"]).into_config().unwrap_err();
    assert!(matches!(err, RunnerError::InvalidShard(_)));

    let err = cli(&["--default-timeout=-1"]).into_config().unwrap_err();
    assert!(matches!(err, RunnerError::Config(_)));
  }

  #[test]
  fn seeds_accept_hex() {
    assert_eq!(parse_seed("0xaba"), Ok(0xaba));
    assert_eq!(parse_seed("2746"), Ok(2746));
    assert!(parse_seed("0xzz").is_err());
  }

  #[test]
  fn test_file_tokens_follow_positional_tokens() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("selection.txt");
    std::fs::write(&path, "# smoke\nmod2\n\n^mod2.Slow  # flaky\n").unwrap();
    let config = cli(&["mod1", "--test-file", path.to_str().unwrap()])
      .into_config()
      .unwrap();
    assert_eq!(config.selection, vec!["mod1", "mod2", "^mod2.Slow"]);
  }
}
