use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Seed used by [`TestOrder::Rand`] when the operator does not pick one.
pub const DEFAULT_ORDER_SEED: u64 = 0xaba;

#[derive(Debug, Clone, Copy, Default, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestOrder {
  /// Declaration order of the resolved suite.
  #[default]
  Default,
  /// Ascending by qualified test name.
  Lexico,
  /// Seeded shuffle.
  Rand,
}

impl TestOrder {
  pub fn as_str(self) -> &'static str {
    match self {
      TestOrder::Default => "default",
      TestOrder::Lexico => "lexico",
      TestOrder::Rand => "rand",
    }
  }
}

impl std::str::FromStr for TestOrder {
  type Err = String;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    match raw {
      "default" => Ok(TestOrder::Default),
      "lexico" => Ok(TestOrder::Lexico),
      "rand" => Ok(TestOrder::Rand),
      other => Err(format!(
        "unknown test order `{other}` (expected default, lexico or rand)"
      )),
    }
  }
}

/// Reorders `items` in place.
///
/// `key` must return the qualified test name; it is only consulted for
/// [`TestOrder::Lexico`]. The same `seed` over the same input always yields
/// the same permutation.
pub fn apply_order<T>(items: &mut [T], order: TestOrder, seed: u64, key: impl Fn(&T) -> &str) {
  match order {
    TestOrder::Default => {}
    TestOrder::Lexico => items.sort_by(|a, b| key(a).cmp(key(b))),
    TestOrder::Rand => {
      let mut rng = StdRng::seed_from_u64(seed);
      items.shuffle(&mut rng);
    }
  }
  tracing::debug!(order = order.as_str(), seed, len = items.len(), "ordered tests");
}
