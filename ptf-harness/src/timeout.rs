use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Returned by cancellation-aware waits once the token has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("operation cancelled by watchdog")
  }
}

impl std::error::Error for Cancelled {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
  /// A second deadline was armed while another test still holds one.
  AlreadyActive,
  /// The watchdog thread could not be started.
  Spawn,
}

impl fmt::Display for TimeoutError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TimeoutError::AlreadyActive => f.write_str("a test timeout is already in flight"),
      TimeoutError::Spawn => f.write_str("failed to start timeout watchdog"),
    }
  }
}

impl std::error::Error for TimeoutError {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cooperative cancellation handle passed into blocking dataplane calls.
///
/// The watchdog never interrupts a thread. It flips the token and wakes
/// anything parked in [`CancelToken::wait_timeout`]; code that blocks must
/// either wait through the token or poll [`CancelToken::check`].
#[derive(Debug, Clone)]
pub struct CancelToken {
  inner: Arc<TokenState>,
}

#[derive(Debug)]
struct TokenState {
  deadline: Option<Instant>,
  fired: Mutex<bool>,
  cv: Condvar,
}

impl CancelToken {
  /// A token that only fires through [`CancelToken::cancel`].
  pub fn never() -> Self {
    Self::build(None)
  }

  pub fn with_deadline(deadline: Instant) -> Self {
    Self::build(Some(deadline))
  }

  fn build(deadline: Option<Instant>) -> Self {
    Self {
      inner: Arc::new(TokenState {
        deadline,
        fired: Mutex::new(false),
        cv: Condvar::new(),
      }),
    }
  }

  pub fn deadline(&self) -> Option<Instant> {
    self.inner.deadline
  }

  pub fn is_cancelled(&self) -> bool {
    *lock(&self.inner.fired)
  }

  pub fn check(&self) -> Result<(), Cancelled> {
    if self.is_cancelled() {
      Err(Cancelled)
    } else {
      Ok(())
    }
  }

  /// Time left before the deadline, `None` when the token has no deadline.
  pub fn remaining(&self) -> Option<Duration> {
    self
      .inner
      .deadline
      .map(|deadline| deadline.saturating_duration_since(Instant::now()))
  }

  /// Shortens `timeout` so that a wait never outlives the deadline.
  pub fn clamp(&self, timeout: Duration) -> Duration {
    match self.remaining() {
      Some(remaining) => timeout.min(remaining),
      None => timeout,
    }
  }

  pub fn cancel(&self) {
    let mut fired = lock(&self.inner.fired);
    *fired = true;
    self.inner.cv.notify_all();
  }

  /// Parks for up to `timeout`, returning early with [`Cancelled`] if the
  /// token fires in the meantime. A `timeout` past the end of the clock
  /// waits for the token alone.
  pub fn wait_timeout(&self, timeout: Duration) -> Result<(), Cancelled> {
    let until = Instant::now().checked_add(timeout);
    let mut fired = lock(&self.inner.fired);
    loop {
      if *fired {
        return Err(Cancelled);
      }
      fired = match until {
        Some(until) => {
          let now = Instant::now();
          if now >= until {
            return Ok(());
          }
          self
            .inner
            .cv
            .wait_timeout(fired, until - now)
            .unwrap_or_else(PoisonError::into_inner)
            .0
        }
        None => self.inner.cv.wait(fired).unwrap_or_else(PoisonError::into_inner),
      };
    }
  }
}

/// Owns the single watchdog thread of a run.
///
/// At most one deadline is armed at a time; tests run sequentially and
/// nested per-test timeouts are not supported.
pub struct TimeoutManager {
  inner: Arc<ManagerInner>,
  thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

struct ManagerInner {
  state: Mutex<ManagerState>,
  cv: Condvar,
}

struct ManagerState {
  active: Option<ArmedDeadline>,
  next_id: u64,
  shutdown: bool,
}

struct ArmedDeadline {
  id: u64,
  token: CancelToken,
  fired: bool,
}

/// Disarms the deadline when dropped.
pub struct TimeoutGuard {
  id: u64,
  token: CancelToken,
  inner: Arc<ManagerInner>,
}

impl TimeoutGuard {
  pub fn token(&self) -> &CancelToken {
    &self.token
  }
}

impl TimeoutManager {
  pub fn new() -> Result<Self, TimeoutError> {
    let inner = Arc::new(ManagerInner {
      state: Mutex::new(ManagerState {
        active: None,
        next_id: 1,
        shutdown: false,
      }),
      cv: Condvar::new(),
    });
    let thread_inner = Arc::clone(&inner);
    let handle = std::thread::Builder::new()
      .name("ptf-timeout".into())
      .spawn(move || watchdog(thread_inner))
      .map_err(|_| TimeoutError::Spawn)?;
    Ok(Self {
      inner,
      thread: Mutex::new(Some(handle)),
    })
  }

  /// Arms a deadline `timeout` from now and returns the guard whose token
  /// fires when it passes. A deadline the clock cannot represent is armed
  /// without one and never fires.
  pub fn arm(&self, timeout: Duration) -> Result<TimeoutGuard, TimeoutError> {
    let token = match Instant::now().checked_add(timeout) {
      Some(deadline) => CancelToken::with_deadline(deadline),
      None => CancelToken::never(),
    };
    let mut state = lock(&self.inner.state);
    if state.active.is_some() {
      return Err(TimeoutError::AlreadyActive);
    }
    let id = state.next_id;
    state.next_id += 1;
    state.active = Some(ArmedDeadline {
      id,
      token: token.clone(),
      fired: false,
    });
    self.inner.cv.notify_one();
    Ok(TimeoutGuard {
      id,
      token,
      inner: Arc::clone(&self.inner),
    })
  }
}

impl Drop for TimeoutManager {
  fn drop(&mut self) {
    {
      let mut state = lock(&self.inner.state);
      state.shutdown = true;
      self.inner.cv.notify_one();
    }

    if let Some(handle) = lock(&self.thread).take() {
      let _ = handle.join();
    }
  }
}

impl Drop for TimeoutGuard {
  fn drop(&mut self) {
    let mut state = lock(&self.inner.state);
    if state.active.as_ref().map(|armed| armed.id) == Some(self.id) {
      state.active = None;
    }
    self.inner.cv.notify_one();
  }
}

fn watchdog(inner: Arc<ManagerInner>) {
  let mut guard = lock(&inner.state);
  loop {
    if guard.shutdown {
      return;
    }

    let now = Instant::now();
    let mut wait_for: Option<Duration> = None;
    if let Some(armed) = guard.active.as_mut() {
      if let (false, Some(deadline)) = (armed.fired, armed.token.deadline()) {
        if now >= deadline {
          armed.fired = true;
          armed.token.cancel();
          tracing::debug!(id = armed.id, "test deadline expired");
        } else {
          wait_for = Some(deadline - now);
        }
      }
    }

    guard = match wait_for {
      Some(wait_for) => {
        inner
          .cv
          .wait_timeout(guard, wait_for)
          .unwrap_or_else(PoisonError::into_inner)
          .0
      }
      None => inner.cv.wait(guard).unwrap_or_else(PoisonError::into_inner),
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn armed_deadline_fires_token() {
    let manager = TimeoutManager::new().unwrap();
    let guard = manager.arm(Duration::from_millis(20)).unwrap();
    let token = guard.token().clone();
    assert_eq!(token.wait_timeout(Duration::from_secs(5)), Err(Cancelled));
    assert!(token.is_cancelled());
    assert_eq!(token.check(), Err(Cancelled));
  }

  #[test]
  fn token_waits_out_short_timeouts() {
    let manager = TimeoutManager::new().unwrap();
    let guard = manager.arm(Duration::from_secs(30)).unwrap();
    assert_eq!(guard.token().wait_timeout(Duration::from_millis(10)), Ok(()));
    assert!(!guard.token().is_cancelled());
    assert!(guard.token().clamp(Duration::from_secs(60)) <= Duration::from_secs(30));
  }

  #[test]
  fn only_one_deadline_in_flight() {
    let manager = TimeoutManager::new().unwrap();
    let guard = manager.arm(Duration::from_secs(30)).unwrap();
    assert_eq!(
      manager.arm(Duration::from_secs(1)).err(),
      Some(TimeoutError::AlreadyActive)
    );
    drop(guard);
    assert!(manager.arm(Duration::from_secs(1)).is_ok());
  }

  #[test]
  fn disarmed_guard_never_fires() {
    let manager = TimeoutManager::new().unwrap();
    let token = {
      let guard = manager.arm(Duration::from_millis(30)).unwrap();
      guard.token().clone()
    };
    std::thread::sleep(Duration::from_millis(80));
    assert!(!token.is_cancelled());
  }

  #[test]
  fn deadline_past_the_clock_never_fires() {
    let manager = TimeoutManager::new().unwrap();
    let guard = manager.arm(Duration::MAX).unwrap();
    assert_eq!(guard.token().deadline(), None);
    std::thread::sleep(Duration::from_millis(30));
    assert!(!guard.token().is_cancelled());
    drop(guard);
    assert!(manager.arm(Duration::from_secs(1)).is_ok());
  }

  #[test]
  fn overlong_wait_still_returns_on_cancel() {
    let token = CancelToken::never();
    let waiter = token.clone();
    let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::MAX));
    std::thread::sleep(Duration::from_millis(10));
    token.cancel();
    assert_eq!(handle.join().unwrap(), Err(Cancelled));
  }

  #[test]
  fn unbounded_token_only_fires_on_cancel() {
    let token = CancelToken::never();
    assert_eq!(token.remaining(), None);
    assert_eq!(token.clamp(Duration::from_secs(3)), Duration::from_secs(3));
    let waiter = token.clone();
    let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
    std::thread::sleep(Duration::from_millis(10));
    token.cancel();
    assert_eq!(handle.join().unwrap(), Err(Cancelled));
  }
}
