//! Start-time registration of test implementations.
//!
//! Test units refer to implementations by key; the registry is the only
//! way a key becomes an instantiable test. Nothing is discovered by
//! inspecting types at runtime.

use crate::session::{DataplaneError, TestContext};
use ptf_harness::Cancelled;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// How a test body ends when it does not pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestError {
  /// Assertion-style mismatch.
  Fail(String),
  /// Unexpected fault while running the body.
  Error(String),
  /// The body observed its cancel token firing.
  Cancelled,
}

impl TestError {
  pub fn fail(message: impl Into<String>) -> Self {
    TestError::Fail(message.into())
  }

  pub fn error(message: impl Into<String>) -> Self {
    TestError::Error(message.into())
  }
}

impl fmt::Display for TestError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TestError::Fail(message) => write!(f, "failure: {message}"),
      TestError::Error(message) => write!(f, "error: {message}"),
      TestError::Cancelled => f.write_str("cancelled"),
    }
  }
}

impl std::error::Error for TestError {}

impl From<Cancelled> for TestError {
  fn from(_: Cancelled) -> Self {
    TestError::Cancelled
  }
}

impl From<DataplaneError> for TestError {
  fn from(err: DataplaneError) -> Self {
    match err {
      DataplaneError::Cancelled => TestError::Cancelled,
      other => TestError::Error(other.to_string()),
    }
  }
}

/// A runnable test body.
pub trait TestCase: Send {
  fn run(&mut self, ctx: &TestContext<'_>) -> Result<(), TestError>;
}

struct FnTest<F>(Arc<F>);

impl<F> TestCase for FnTest<F>
where
  F: Fn(&TestContext<'_>) -> Result<(), TestError> + Send + Sync,
{
  fn run(&mut self, ctx: &TestContext<'_>) -> Result<(), TestError> {
    (self.0)(ctx)
  }
}

pub type TestCtor = Arc<dyn Fn() -> Box<dyn TestCase> + Send + Sync>;

#[derive(Clone, Default)]
pub struct TestRegistry {
  entries: BTreeMap<String, TestCtor>,
}

impl fmt::Debug for TestRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_set().entries(self.entries.keys()).finish()
  }
}

impl TestRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a constructor under `key`. A later registration with the
  /// same key replaces the earlier one.
  pub fn register<C>(&mut self, key: impl Into<String>, ctor: C) -> &mut Self
  where
    C: Fn() -> Box<dyn TestCase> + Send + Sync + 'static,
  {
    self.entries.insert(key.into(), Arc::new(ctor));
    self
  }

  /// Registers a stateless test body.
  pub fn register_fn<F>(&mut self, key: impl Into<String>, body: F) -> &mut Self
  where
    F: Fn(&TestContext<'_>) -> Result<(), TestError> + Send + Sync + 'static,
  {
    let body = Arc::new(body);
    self.register(key, move || {
      Box::new(FnTest(Arc::clone(&body))) as Box<dyn TestCase>
    })
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  pub fn instantiate(&self, key: &str) -> Option<Box<dyn TestCase>> {
    self.entries.get(key).map(|ctor| ctor())
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
