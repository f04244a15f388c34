use crate::params::TestParams;
use crate::session::{DeviceId, PortId};
use clap::ValueEnum;
use ptf_harness::{ShardSpec, TestOrder, DEFAULT_ORDER_SEED};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_NEGATIVE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListMode {
  #[default]
  Run,
  /// Enumerate the catalog with its groups.
  Catalog,
  /// Enumerate the names of the resolved suite.
  TestNames,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum PlatformKind {
  /// Ports come from `--interface` only.
  #[default]
  Static,
  /// In-memory loopback ports `0-0..0-(n-1)`.
  Loopback,
}

/// `[device-]port@interface`; the device defaults to 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
  pub device: DeviceId,
  pub port: PortId,
  pub interface: String,
}

impl std::str::FromStr for PortSpec {
  type Err = String;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    let Some((ids, interface)) = raw.split_once('@') else {
      return Err(format!("interface `{raw}` must look like [device-]port@name"));
    };
    if interface.is_empty() {
      return Err(format!("interface `{raw}` has an empty name"));
    }
    let (device, port) = match ids.split_once('-') {
      Some((device, port)) => (device, port),
      None => ("0", ids),
    };
    let device = device
      .parse()
      .map_err(|err| format!("invalid device id in `{raw}`: {err}"))?;
    let port = port
      .parse()
      .map_err(|err| format!("invalid port id in `{raw}`: {err}"))?;
    Ok(Self {
      device,
      port,
      interface: interface.to_string(),
    })
  }
}

/// Immutable run configuration, built once at startup and shared by
/// reference with every component.
#[derive(Debug, Clone)]
pub struct RunConfig {
  pub test_dir: PathBuf,
  /// Raw selection tokens in the order given.
  pub selection: Vec<String>,
  pub order: TestOrder,
  pub order_seed: u64,
  pub shard: ShardSpec,
  pub failfast: bool,
  pub fail_skipped: bool,
  /// Poll timeout handed to dataplane calls.
  pub default_timeout: Duration,
  /// Poll timeout for checks that expect no packet.
  pub negative_timeout: Duration,
  /// Global per-test timeout; `None` disables it.
  pub test_case_timeout: Option<Duration>,
  pub platform: PlatformKind,
  pub loopback_ports: u32,
  pub interfaces: Vec<PortSpec>,
  pub params: TestParams,
  pub report_dir: Option<PathBuf>,
  pub json_report: Option<PathBuf>,
  pub list: ListMode,
}

impl Default for RunConfig {
  fn default() -> Self {
    Self {
      test_dir: PathBuf::from("tests"),
      selection: Vec::new(),
      order: TestOrder::Default,
      order_seed: DEFAULT_ORDER_SEED,
      shard: ShardSpec::default(),
      failfast: false,
      fail_skipped: false,
      default_timeout: DEFAULT_TIMEOUT,
      negative_timeout: DEFAULT_NEGATIVE_TIMEOUT,
      test_case_timeout: None,
      platform: PlatformKind::Static,
      loopback_ports: 4,
      interfaces: Vec::new(),
      params: TestParams::default(),
      report_dir: None,
      json_report: None,
      list: ListMode::Run,
    }
  }
}
