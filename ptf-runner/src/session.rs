//! Collaborator seams and the per-run test session.

use crate::config::RunConfig;
use crate::params::TestParams;
use crate::{Result, RunnerError};
use ptf_harness::CancelToken;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type DeviceId = u32;
pub type PortId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataplaneError {
  #[error("unknown port {device}-{port}")]
  UnknownPort { device: DeviceId, port: PortId },
  #[error("dataplane operation cancelled")]
  Cancelled,
  #[error("dataplane has been shut down")]
  Closed,
  #[error("{0}")]
  Transport(String),
}

impl From<ptf_harness::Cancelled> for DataplaneError {
  fn from(_: ptf_harness::Cancelled) -> Self {
    DataplaneError::Cancelled
  }
}

/// `(device, port) -> interface name`, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap {
  ports: BTreeMap<(DeviceId, PortId), String>,
}

impl PortMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, device: DeviceId, port: PortId, interface: impl Into<String>) {
    self.ports.insert((device, port), interface.into());
  }

  pub fn get(&self, device: DeviceId, port: PortId) -> Option<&str> {
    self.ports.get(&(device, port)).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (DeviceId, PortId, &str)> {
    self
      .ports
      .iter()
      .map(|((device, port), interface)| (*device, *port, interface.as_str()))
  }

  pub fn len(&self) -> usize {
    self.ports.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ports.is_empty()
  }
}

/// Host-side setup that yields the port map.
pub trait Platform {
  fn port_map(&self, config: &RunConfig) -> Result<PortMap>;
}

/// Packet I/O collaborator. Every blocking call takes the caller's cancel
/// token and must return [`DataplaneError::Cancelled`] once it fires.
pub trait Dataplane: Send + Sync {
  fn add_port(
    &self,
    device: DeviceId,
    port: PortId,
    interface: &str,
  ) -> std::result::Result<(), DataplaneError>;

  fn start_capture(&self) -> std::result::Result<(), DataplaneError>;

  fn stop_capture(&self) -> std::result::Result<(), DataplaneError>;

  fn send(
    &self,
    device: DeviceId,
    port: PortId,
    packet: &[u8],
  ) -> std::result::Result<(), DataplaneError>;

  /// Waits up to `timeout` for a packet on the port.
  fn poll(
    &self,
    device: DeviceId,
    port: PortId,
    timeout: Duration,
    cancel: &CancelToken,
  ) -> std::result::Result<Option<Vec<u8>>, DataplaneError>;

  /// Drops anything queued on every port.
  fn flush(&self);

  fn kill(&self);
}

pub trait DataplaneFactory {
  fn create(&self, config: &RunConfig, ports: &PortMap) -> Result<Box<dyn Dataplane>>;
}

/// Tests that voluntarily declined to run.
#[derive(Debug, Default)]
pub struct SkipCounter(AtomicUsize);

impl SkipCounter {
  pub fn increment(&self) {
    self.0.fetch_add(1, Ordering::Relaxed);
  }

  pub fn get(&self) -> usize {
    self.0.load(Ordering::Relaxed)
  }
}

/// Owns the dataplane for the duration of a run.
pub struct Session {
  dataplane: Box<dyn Dataplane>,
  port_map: PortMap,
  skipped: SkipCounter,
  closed: bool,
}

impl Session {
  /// Brings up the dataplane: port map, ports, capture. Any failure here is
  /// fatal and happens before the first test.
  pub fn open(
    config: &RunConfig,
    platform: &dyn Platform,
    factory: &dyn DataplaneFactory,
  ) -> Result<Self> {
    let port_map = platform.port_map(config)?;
    if port_map.is_empty() {
      return Err(RunnerError::MissingPortMap);
    }

    let dataplane = factory.create(config, &port_map)?;
    // From here on the session owns teardown, including on the error paths.
    let session = Session {
      dataplane,
      port_map,
      skipped: SkipCounter::default(),
      closed: false,
    };
    for (device, port, interface) in session.port_map.iter() {
      debug!(device, port, interface, "adding port");
      session
        .dataplane
        .add_port(device, port, interface)
        .map_err(|err| RunnerError::Dataplane(err.to_string()))?;
    }
    session
      .dataplane
      .start_capture()
      .map_err(|err| RunnerError::Dataplane(err.to_string()))?;
    info!(ports = session.port_map.len(), "dataplane session started");
    Ok(session)
  }

  pub fn port_map(&self) -> &PortMap {
    &self.port_map
  }

  pub fn dataplane(&self) -> &dyn Dataplane {
    self.dataplane.as_ref()
  }

  pub fn skipped(&self) -> usize {
    self.skipped.get()
  }

  pub fn context<'a>(
    &'a self,
    config: &'a RunConfig,
    name: &'a str,
    cancel: &'a CancelToken,
  ) -> TestContext<'a> {
    TestContext {
      name,
      config,
      dataplane: self.dataplane.as_ref(),
      port_map: &self.port_map,
      skipped: &self.skipped,
      cancel,
    }
  }

  /// Stops capture and kills the dataplane. Runs at most once.
  pub fn close(&mut self) -> Result<()> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    let stopped = self.dataplane.stop_capture();
    self.dataplane.kill();
    info!("dataplane session closed");
    stopped.map_err(|err| RunnerError::Dataplane(err.to_string()))
  }
}

impl Drop for Session {
  fn drop(&mut self) {
    if let Err(err) = self.close() {
      warn!(%err, "dataplane teardown failed");
    }
  }
}

/// Everything a test body may touch. Shared by reference; tests never own
/// the dataplane.
pub struct TestContext<'a> {
  name: &'a str,
  config: &'a RunConfig,
  dataplane: &'a dyn Dataplane,
  port_map: &'a PortMap,
  skipped: &'a SkipCounter,
  cancel: &'a CancelToken,
}

impl<'a> TestContext<'a> {
  pub fn name(&self) -> &str {
    self.name
  }

  pub fn config(&self) -> &RunConfig {
    self.config
  }

  pub fn params(&self) -> &TestParams {
    &self.config.params
  }

  pub fn dataplane(&self) -> &dyn Dataplane {
    self.dataplane
  }

  pub fn port_map(&self) -> &PortMap {
    self.port_map
  }

  pub fn cancel(&self) -> &CancelToken {
    self.cancel
  }

  /// The configured poll timeout, never past this test's deadline.
  pub fn default_timeout(&self) -> Duration {
    self.cancel.clamp(self.config.default_timeout)
  }

  pub fn negative_timeout(&self) -> Duration {
    self.cancel.clamp(self.config.negative_timeout)
  }

  pub fn send(
    &self,
    device: DeviceId,
    port: PortId,
    packet: &[u8],
  ) -> std::result::Result<(), DataplaneError> {
    self.cancel.check()?;
    self.dataplane.send(device, port, packet)
  }

  /// Polls with [`TestContext::default_timeout`].
  pub fn poll(
    &self,
    device: DeviceId,
    port: PortId,
  ) -> std::result::Result<Option<Vec<u8>>, DataplaneError> {
    self
      .dataplane
      .poll(device, port, self.default_timeout(), self.cancel)
  }

  /// Records that this test declined to run. The test should return
  /// `Ok(())` afterwards.
  pub fn skip(&self, reason: &str) {
    self.skipped.increment();
    info!(test = self.name, reason, "test skipped");
  }
}
