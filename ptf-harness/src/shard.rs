/// Round-robin sharding for resolved test lists.
///
/// Sharding is based on the *position in the resolved ordering*, so every
/// shard of the same run sees the same input list and the shards together
/// cover it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardSpec {
  pub index: usize,
  pub total: usize,
}

impl Default for ShardSpec {
  fn default() -> Self {
    Self { index: 0, total: 1 }
  }
}

impl ShardSpec {
  /// Validates `0 <= shard_id < num_shards`.
  pub fn new(shard_id: usize, num_shards: usize) -> Result<Self, String> {
    if num_shards == 0 {
      return Err("number of shards must be greater than zero".into());
    }
    if shard_id >= num_shards {
      return Err(format!(
        "shard id must be less than the number of shards ({shard_id} >= {num_shards})"
      ));
    }
    Ok(Self {
      index: shard_id,
      total: num_shards,
    })
  }

  /// Returns whether the shard includes the given 0-based index.
  pub fn includes(&self, idx: usize) -> bool {
    idx % self.total == self.index
  }
}

impl std::str::FromStr for ShardSpec {
  type Err = String;

  fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
    let Some((index_raw, total_raw)) = raw.split_once('/') else {
      return Err("shard must be in the form <index>/<total>".into());
    };
    let index: usize = index_raw
      .trim()
      .parse()
      .map_err(|err| format!("invalid shard index `{index_raw}`: {err}"))?;
    let total: usize = total_raw
      .trim()
      .parse()
      .map_err(|err| format!("invalid shard total `{total_raw}`: {err}"))?;
    Self::new(index, total)
  }
}

impl std::fmt::Display for ShardSpec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.index, self.total)
  }
}

/// Keeps the items whose position `i` satisfies `i % total == index`.
pub fn apply_shard<T>(items: impl IntoIterator<Item = T>, shard: ShardSpec) -> Vec<T> {
  items
    .into_iter()
    .enumerate()
    .filter(|(idx, _)| shard.includes(*idx))
    .map(|(_, item)| item)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn shard_parses() {
    let shard: ShardSpec = "0/2".parse().expect("parsed");
    assert_eq!(shard, ShardSpec { index: 0, total: 2 });

    let err = "2/2".parse::<ShardSpec>().unwrap_err();
    assert!(err.contains("less than the number of shards"));
    let err = "0/0".parse::<ShardSpec>().unwrap_err();
    assert!(err.contains("greater than zero"));
  }

  #[test]
  fn two_shards_stride_the_suite() {
    let suite = vec!["A", "B", "C", "D", "E"];
    let first = apply_shard(suite.clone(), ShardSpec::new(0, 2).unwrap());
    let second = apply_shard(suite, ShardSpec::new(1, 2).unwrap());
    assert_eq!(first, vec!["A", "C", "E"]);
    assert_eq!(second, vec!["B", "D"]);
  }

  #[test]
  fn single_shard_is_identity() {
    let suite: Vec<_> = (0..7).collect();
    assert_eq!(apply_shard(suite.clone(), ShardSpec::default()), suite);
  }

  #[test]
  fn more_shards_than_tests_leaves_some_empty() {
    let shard = ShardSpec::new(4, 5).unwrap();
    assert!(apply_shard(vec!["a", "b"], shard).is_empty());
  }

  proptest! {
    #[test]
    fn shards_cover_every_index_once(len in 0usize..64, total in 1usize..9) {
      let items: Vec<_> = (0..len).collect();
      let mut seen = vec![0usize; len];
      for index in 0..total {
        let shard = ShardSpec::new(index, total).unwrap();
        for item in apply_shard(items.clone(), shard) {
          seen[item] += 1;
        }
      }
      prop_assert!(seen.iter().all(|count| *count == 1));
    }
  }
}
