use ptf_runner::{TestError, TestRegistry};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Writes `(relative path, manifest)` pairs under a fresh directory.
pub fn write_manifests(files: &[(&str, &str)]) -> TempDir {
  let dir = tempfile::tempdir().expect("tempdir");
  for (path, contents) in files {
    let path = dir.path().join(path);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
  }
  dir
}

pub const MOD1: &str = r#"
[[test]]
name = "A"

[[test]]
name = "B"
"#;

pub const MOD2: &str = r#"
[[test]]
name = "C"
disabled = true
"#;

pub const SHARDED: &str = r#"
[[test]]
name = "A"
[[test]]
name = "B"
[[test]]
name = "C"
[[test]]
name = "D"
[[test]]
name = "E"
"#;

/// Registers a passing implementation for every `<module>.<name>` listed.
pub fn passing(registry: &mut TestRegistry, names: &[&str]) {
  for name in names {
    registry.register_fn(*name, |_| Ok(()));
  }
}

pub fn scenario_registry() -> TestRegistry {
  let mut registry = TestRegistry::new();
  passing(&mut registry, &["mod1.A", "mod1.B", "mod2.C"]);
  passing(
    &mut registry,
    &["sharded.A", "sharded.B", "sharded.C", "sharded.D", "sharded.E"],
  );
  registry
    .register_fn("slow.Blocks", |ctx| {
      ctx.cancel().wait_timeout(Duration::from_secs(5))?;
      Err(TestError::fail("deadline never fired"))
    })
    .register_fn("slow.After", |_| Ok(()));
  registry
}

#[allow(dead_code)]
pub fn demos_dir() -> std::path::PathBuf {
  Path::new(env!("CARGO_MANIFEST_DIR"))
    .join("..")
    .join("demos")
    .join("loopback")
}
