use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub mod aggregate;
pub mod builtin;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod loopback;
pub mod params;
pub mod registry;
pub mod reporter;
pub mod selection;
pub mod session;
pub mod supervisor;

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Fatal errors. Any of these aborts the run before or outside test
/// execution; per-test problems are recorded as outcomes instead.
#[derive(Debug, Error)]
pub enum RunnerError {
  #[error(transparent)]
  Io(#[from] io::Error),
  #[error("failed to load test unit {}: {message}", unit.display())]
  LoadUnit { unit: PathBuf, message: String },
  #[error("duplicate test name '{0}'")]
  DuplicateTest(String),
  #[error("test '{name}' uses unregistered implementation '{implementation}'")]
  UnknownImpl { name: String, implementation: String },
  #[error("malformed selection token '{0}'")]
  MalformedToken(String),
  #[error("test or group '{0}' not found")]
  UnmatchedToken(String),
  #[error("invalid shard parameters: {0}")]
  InvalidShard(String),
  #[error("platform produced no port map")]
  MissingPortMap,
  #[error("invalid test parameters: {0}")]
  Params(String),
  #[error("invalid configuration: {0}")]
  Config(String),
  #[error("reporter failed: {0}")]
  Reporter(String),
  #[error("dataplane failed: {0}")]
  Dataplane(String),
  #[error(transparent)]
  Timeout(#[from] ptf_harness::TimeoutError),
}

pub use aggregate::{Aggregator, RunSummary, REPORT_SCHEMA_VERSION};
pub use catalog::{load_catalog, Catalog, CatalogModule, ModuleInfo, TestDescriptor};
pub use config::RunConfig;
pub use params::{ParamValue, TestParams};
pub use registry::{TestCase, TestError, TestRegistry};
pub use selection::{resolve, ResolvedSuite, SelectionToken};
pub use session::{Dataplane, DataplaneFactory, PortMap, Session, TestContext};
pub use supervisor::{ExecutionOutcome, RunnableTest, Supervisor, TestRecord};
