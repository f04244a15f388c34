//! In-memory collaborators: a configured platform and a loopback dataplane
//! where every frame sent on a port is received back on the same port.

use crate::config::{PlatformKind, RunConfig};
use crate::session::{Dataplane, DataplaneError, DataplaneFactory, DeviceId, Platform, PortId, PortMap};
use crate::Result;
use ptf_harness::CancelToken;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Upper bound on how long a poll parks before re-checking its token.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Builds the port map from `--interface` or, for the loopback platform,
/// synthesizes `loopback_ports` ports on device 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredPlatform;

impl Platform for ConfiguredPlatform {
  fn port_map(&self, config: &RunConfig) -> Result<PortMap> {
    let mut ports = PortMap::new();
    if config.platform == PlatformKind::Loopback {
      for port in 0..config.loopback_ports {
        ports.insert(0, port, format!("lo{port}"));
      }
    }
    for spec in &config.interfaces {
      ports.insert(spec.device, spec.port, spec.interface.clone());
    }
    Ok(ports)
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackFactory;

impl DataplaneFactory for LoopbackFactory {
  fn create(&self, _config: &RunConfig, _ports: &PortMap) -> Result<Box<dyn Dataplane>> {
    Ok(Box::new(LoopbackDataplane::new()))
  }
}

#[derive(Debug, Default)]
struct LoopState {
  ports: BTreeMap<(DeviceId, PortId), VecDeque<Vec<u8>>>,
  capturing: bool,
  captured: usize,
  closed: bool,
}

#[derive(Debug, Default)]
pub struct LoopbackDataplane {
  state: Mutex<LoopState>,
  cv: Condvar,
}

impl LoopbackDataplane {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, LoopState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Frames seen while capture was on.
  pub fn captured(&self) -> usize {
    self.lock().captured
  }

  pub fn is_closed(&self) -> bool {
    self.lock().closed
  }
}

impl Dataplane for LoopbackDataplane {
  fn add_port(
    &self,
    device: DeviceId,
    port: PortId,
    interface: &str,
  ) -> std::result::Result<(), DataplaneError> {
    let mut state = self.lock();
    if state.closed {
      return Err(DataplaneError::Closed);
    }
    state.ports.entry((device, port)).or_default();
    debug!(device, port, interface, "loopback port up");
    Ok(())
  }

  fn start_capture(&self) -> std::result::Result<(), DataplaneError> {
    self.lock().capturing = true;
    Ok(())
  }

  fn stop_capture(&self) -> std::result::Result<(), DataplaneError> {
    self.lock().capturing = false;
    Ok(())
  }

  fn send(
    &self,
    device: DeviceId,
    port: PortId,
    packet: &[u8],
  ) -> std::result::Result<(), DataplaneError> {
    let mut state = self.lock();
    if state.closed {
      return Err(DataplaneError::Closed);
    }
    if state.capturing {
      state.captured += 1;
    }
    state
      .ports
      .get_mut(&(device, port))
      .ok_or(DataplaneError::UnknownPort { device, port })?
      .push_back(packet.to_vec());
    self.cv.notify_all();
    Ok(())
  }

  fn poll(
    &self,
    device: DeviceId,
    port: PortId,
    timeout: Duration,
    cancel: &CancelToken,
  ) -> std::result::Result<Option<Vec<u8>>, DataplaneError> {
    let until = Instant::now().checked_add(timeout);
    let mut state = self.lock();
    loop {
      if state.closed {
        return Err(DataplaneError::Closed);
      }
      let queue = state
        .ports
        .get_mut(&(device, port))
        .ok_or(DataplaneError::UnknownPort { device, port })?;
      if let Some(packet) = queue.pop_front() {
        return Ok(Some(packet));
      }
      cancel.check()?;
      let wait = match until {
        Some(until) => {
          let now = Instant::now();
          if now >= until {
            return Ok(None);
          }
          (until - now).min(POLL_SLICE)
        }
        None => POLL_SLICE,
      };
      state = self
        .cv
        .wait_timeout(state, wait)
        .unwrap_or_else(PoisonError::into_inner)
        .0;
    }
  }

  fn flush(&self) {
    for queue in self.lock().ports.values_mut() {
      queue.clear();
    }
  }

  fn kill(&self) {
    let mut state = self.lock();
    state.closed = true;
    state.ports.clear();
    self.cv.notify_all();
  }
}
