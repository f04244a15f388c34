use crate::registry::TestRegistry;
use crate::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use walkdir::{DirEntry, WalkDir};

pub const GROUP_STANDARD: &str = "standard";
pub const GROUP_ALL: &str = "all";
pub const GROUP_DISABLED: &str = "disabled";

const UNIT_EXTENSIONS: &[&str] = &["toml", "json"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TestDescriptor {
  pub module: String,
  pub name: String,
  /// `<module>.<name>`, unique within a catalog.
  pub qualified_name: String,
  /// Registry key of the implementation.
  pub implementation: String,
  pub groups: Vec<String>,
  pub disabled: bool,
  pub nonstandard: bool,
  pub timeout_override: Option<Duration>,
}

impl TestDescriptor {
  pub fn in_group(&self, group: &str) -> bool {
    self.groups.iter().any(|g| g == group)
  }

  /// Whether a selection token names this test, either exactly or by group.
  pub fn matches(&self, token: &str) -> bool {
    self.qualified_name == token || self.in_group(token)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
  pub path: Option<PathBuf>,
  pub doc: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogModule {
  pub name: String,
  pub info: ModuleInfo,
  pub tests: Vec<Arc<TestDescriptor>>,
}

/// Modules in load order, each with its tests in declaration order.
///
/// Built once per run and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
  modules: Vec<CatalogModule>,
}

impl Catalog {
  pub fn modules(&self) -> &[CatalogModule] {
    &self.modules
  }

  pub fn tests(&self) -> impl Iterator<Item = &Arc<TestDescriptor>> {
    self.modules.iter().flat_map(|module| module.tests.iter())
  }

  pub fn get(&self, qualified_name: &str) -> Option<&Arc<TestDescriptor>> {
    self.tests().find(|test| test.qualified_name == qualified_name)
  }

  pub fn len(&self) -> usize {
    self.modules.iter().map(|module| module.tests.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn groups(&self) -> BTreeSet<&str> {
    self
      .tests()
      .flat_map(|test| test.groups.iter().map(String::as_str))
      .collect()
  }

  /// Builds a catalog from already-parsed units, in the given order.
  pub fn from_units(units: Vec<TestUnit>, registry: &TestRegistry) -> Result<Self> {
    let mut catalog = Catalog::default();
    let mut seen_modules: HashSet<String> = HashSet::new();
    for unit in units {
      if !seen_modules.insert(unit.module.clone()) {
        let err = RunnerError::LoadUnit {
          unit: unit.info.path.clone().unwrap_or_else(|| unit.module.clone().into()),
          message: format!("module '{}' is defined more than once", unit.module),
        };
        error!(module = %unit.module, "failed to load test unit");
        return Err(err);
      }
      let module = unit.module.clone();
      match catalog_module(unit, registry) {
        Ok(Some(built)) => catalog.modules.push(built),
        Ok(None) => debug!(module = %module, "unit declares no runnable tests"),
        Err(err) => {
          error!(module = %module, "failed to load test unit");
          return Err(err);
        }
      }
    }
    Ok(catalog)
  }
}

/// One test-defining unit: a module name plus its declared entries.
#[derive(Debug, Clone)]
pub struct TestUnit {
  pub module: String,
  pub info: ModuleInfo,
  pub entries: Vec<TestEntry>,
}

impl TestUnit {
  pub fn new(module: impl Into<String>, entries: Vec<TestEntry>) -> Self {
    Self {
      module: module.into(),
      info: ModuleInfo::default(),
      entries,
    }
  }
}

/// A declared test. Unset attributes get their defaults during tagging.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestEntry {
  pub name: String,
  #[serde(default, rename = "impl")]
  pub implementation: Option<String>,
  #[serde(default)]
  pub groups: Option<Vec<String>>,
  #[serde(default)]
  pub disabled: Option<bool>,
  #[serde(default)]
  pub nonstandard: Option<bool>,
  #[serde(default)]
  pub timeout_secs: Option<f64>,
  /// Shared base declarations that are not runnable on their own.
  #[serde(default, rename = "abstract")]
  pub is_abstract: bool,
}

impl TestEntry {
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Self::default()
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitManifest {
  #[serde(default)]
  doc: Option<String>,
  #[serde(default, rename = "test")]
  tests: Vec<TestEntry>,
}

fn parse_unit(raw: &str) -> std::result::Result<UnitManifest, String> {
  match toml::from_str::<UnitManifest>(raw) {
    Ok(manifest) => Ok(manifest),
    Err(toml_err) => serde_json::from_str::<UnitManifest>(raw).map_err(|json_err| {
      format!("failed to parse unit as TOML ({toml_err}) or JSON ({json_err})")
    }),
  }
}

fn catalog_module(unit: TestUnit, registry: &TestRegistry) -> Result<Option<CatalogModule>> {
  let mut tests: Vec<Arc<TestDescriptor>> = Vec::new();
  let mut names: HashSet<String> = HashSet::new();
  for entry in unit.entries {
    if entry.is_abstract {
      continue;
    }
    let descriptor = tag(&unit.module, entry)?;
    if !registry.contains(&descriptor.implementation) {
      return Err(RunnerError::UnknownImpl {
        name: descriptor.qualified_name,
        implementation: descriptor.implementation,
      });
    }
    if !names.insert(descriptor.name.clone()) {
      return Err(RunnerError::DuplicateTest(descriptor.qualified_name));
    }
    tests.push(Arc::new(descriptor));
  }

  if tests.is_empty() {
    return Ok(None);
  }
  Ok(Some(CatalogModule {
    name: unit.module,
    info: unit.info,
    tests,
  }))
}

fn push_unique(groups: &mut Vec<String>, group: &str) {
  if !groups.iter().any(|g| g == group) {
    groups.push(group.to_string());
  }
}

/// Fills unset attributes and assigns the default group tags.
///
/// Exactly one of `{standard?, all}` or `{disabled}` ends up in the groups,
/// whatever custom groups the entry declared.
fn tag(module: &str, entry: TestEntry) -> Result<TestDescriptor> {
  let qualified_name = format!("{module}.{}", entry.name);
  if entry.name.is_empty() || entry.name.contains('.') || entry.name.starts_with('^') {
    return Err(RunnerError::LoadUnit {
      unit: module.into(),
      message: format!("invalid test name '{}'", entry.name),
    });
  }

  let disabled = entry.disabled.unwrap_or(false);
  let nonstandard = entry.nonstandard.unwrap_or(false);
  let timeout_override = match entry.timeout_secs {
    None => None,
    Some(secs) => Some(Duration::try_from_secs_f64(secs).map_err(|err| {
      RunnerError::LoadUnit {
        unit: module.into(),
        message: format!("test '{qualified_name}' has invalid timeout {secs}: {err}"),
      }
    })?),
  };

  let mut groups = entry.groups.unwrap_or_default();
  groups.retain(|g| g != GROUP_STANDARD && g != GROUP_ALL && g != GROUP_DISABLED);
  push_unique(&mut groups, module);
  if disabled {
    push_unique(&mut groups, GROUP_DISABLED);
  } else {
    push_unique(&mut groups, GROUP_ALL);
    if !nonstandard {
      push_unique(&mut groups, GROUP_STANDARD);
    }
  }

  Ok(TestDescriptor {
    module: module.to_string(),
    implementation: entry
      .implementation
      .unwrap_or_else(|| qualified_name.clone()),
    name: entry.name,
    qualified_name,
    groups,
    disabled,
    nonstandard,
    timeout_override,
  })
}

fn is_hidden(entry: &DirEntry) -> bool {
  entry.depth() > 0
    && entry
      .file_name()
      .to_str()
      .map(|name| name.starts_with('.'))
      .unwrap_or(false)
}

fn is_unit_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| UNIT_EXTENSIONS.contains(&ext))
    .unwrap_or(false)
}

/// Files of a directory are visited before its subdirectories, each group
/// sorted by name.
fn walk_order(a: &DirEntry, b: &DirEntry) -> Ordering {
  a.file_type()
    .is_dir()
    .cmp(&b.file_type().is_dir())
    .then_with(|| a.file_name().cmp(b.file_name()))
}

/// Walks `root` and loads every test unit it finds.
///
/// Any unit that fails to load aborts the whole catalog.
pub fn load_catalog(root: &Path, registry: &TestRegistry) -> Result<Catalog> {
  if !root.is_dir() {
    return Err(RunnerError::Config(format!(
      "test directory {} not found",
      root.display()
    )));
  }

  let mut units = Vec::new();
  let walker = WalkDir::new(root)
    .sort_by(walk_order)
    .into_iter()
    .filter_entry(|entry| !is_hidden(entry));
  for entry in walker {
    let entry = entry.map_err(|err| {
      let unit = err.path().unwrap_or(root).to_path_buf();
      error!(unit = %unit.display(), "failed to walk test directory");
      RunnerError::LoadUnit {
        unit,
        message: err.to_string(),
      }
    })?;
    if !entry.file_type().is_file() || !is_unit_file(entry.path()) {
      continue;
    }
    units.push(load_unit(entry.path())?);
  }

  let catalog = Catalog::from_units(units, registry)?;
  info!(
    root = %root.display(),
    modules = catalog.modules().len(),
    tests = catalog.len(),
    "loaded test catalog"
  );
  Ok(catalog)
}

fn load_unit(path: &Path) -> Result<TestUnit> {
  let fail = |message: String| {
    error!(unit = %path.display(), reason = %message, "failed to load test unit");
    RunnerError::LoadUnit {
      unit: path.to_path_buf(),
      message,
    }
  };

  let module = path
    .file_stem()
    .and_then(|stem| stem.to_str())
    .filter(|stem| !stem.is_empty() && !stem.contains('.'))
    .ok_or_else(|| fail("unit file name is not a valid module name".to_string()))?
    .to_string();
  let raw = fs::read_to_string(path).map_err(|err| fail(err.to_string()))?;
  let manifest = parse_unit(&raw).map_err(fail)?;
  debug!(unit = %path.display(), tests = manifest.tests.len(), "parsed test unit");

  Ok(TestUnit {
    module,
    info: ModuleInfo {
      path: Some(path.to_path_buf()),
      doc: manifest.doc,
    },
    entries: manifest.tests,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn registry(keys: &[&str]) -> TestRegistry {
    let mut registry = TestRegistry::new();
    for key in keys {
      registry.register_fn(*key, |_| Ok(()));
    }
    registry
  }

  #[test]
  fn default_tags_follow_disabled_and_nonstandard() {
    let units = vec![TestUnit::new(
      "mod1",
      vec![
        TestEntry::named("A"),
        TestEntry {
          nonstandard: Some(true),
          ..TestEntry::named("B")
        },
        TestEntry {
          disabled: Some(true),
          groups: Some(vec!["slow".into(), "standard".into()]),
          ..TestEntry::named("C")
        },
      ],
    )];
    let catalog =
      Catalog::from_units(units, &registry(&["mod1.A", "mod1.B", "mod1.C"])).unwrap();

    let a = catalog.get("mod1.A").unwrap();
    assert_eq!(a.groups, vec!["mod1", "all", "standard"]);
    let b = catalog.get("mod1.B").unwrap();
    assert_eq!(b.groups, vec!["mod1", "all"]);
    let c = catalog.get("mod1.C").unwrap();
    assert_eq!(c.groups, vec!["slow", "mod1", "disabled"]);
    assert!(!c.in_group(GROUP_STANDARD) && !c.in_group(GROUP_ALL));
    assert!(c.matches("mod1.C"));
  }

  #[test]
  fn tagging_is_idempotent() {
    let entry = TestEntry {
      groups: Some(vec!["mod1".into(), "all".into()]),
      ..TestEntry::named("A")
    };
    let tagged = tag("mod1", entry).unwrap();
    let again = tag(
      "mod1",
      TestEntry {
        groups: Some(tagged.groups.clone()),
        ..TestEntry::named("A")
      },
    )
    .unwrap();
    assert_eq!(tagged.groups, again.groups);
  }

  #[test]
  fn walk_is_sorted_files_before_subdirectories() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    fs::create_dir_all(root.join("a_sub")).unwrap();
    fs::create_dir_all(root.join(".hidden")).unwrap();
    fs::write(root.join("zeta.toml"), "[[test]]\nname = \"Z\"\n").unwrap();
    fs::write(root.join("alpha.toml"), "[[test]]\nname = \"A\"\n").unwrap();
    fs::write(root.join("a_sub/beta.toml"), "[[test]]\nname = \"B\"\n").unwrap();
    fs::write(root.join(".hidden/gamma.toml"), "[[test]]\nname = \"G\"\n").unwrap();
    fs::write(root.join("notes.txt"), "ignored").unwrap();

    let catalog = load_catalog(root, &registry(&["alpha.A", "zeta.Z", "beta.B"])).unwrap();
    let names: Vec<_> = catalog.tests().map(|t| t.qualified_name.as_str()).collect();
    assert_eq!(names, vec!["alpha.A", "zeta.Z", "beta.B"]);
  }

  #[test]
  fn json_units_and_overrides_load() {
    let temp = tempdir().unwrap();
    fs::write(
      temp.path().join("mod2.json"),
      r#"{"doc": "json unit", "test": [{"name": "C", "impl": "shared", "timeout_secs": 1.5}]}"#,
    )
    .unwrap();

    let catalog = load_catalog(temp.path(), &registry(&["shared"])).unwrap();
    let module = &catalog.modules()[0];
    assert_eq!(module.info.doc.as_deref(), Some("json unit"));
    let c = &module.tests[0];
    assert_eq!(c.implementation, "shared");
    assert_eq!(c.timeout_override, Some(Duration::from_millis(1500)));
  }

  #[test]
  fn abstract_entries_are_not_tests() {
    let units = vec![TestUnit::new(
      "base",
      vec![TestEntry {
        is_abstract: true,
        ..TestEntry::named("Base")
      }],
    )];
    let catalog = Catalog::from_units(units, &registry(&[])).unwrap();
    assert!(catalog.is_empty());
  }

  #[test]
  fn unit_that_fails_to_parse_is_fatal() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("good.toml"), "[[test]]\nname = \"A\"\n").unwrap();
    fs::write(temp.path().join("bad.toml"), "[[test]\nname = ").unwrap();

    let err = load_catalog(temp.path(), &registry(&["good.A"])).unwrap_err();
    match err {
      RunnerError::LoadUnit { unit, .. } => assert!(unit.ends_with("bad.toml")),
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[test]
  fn timeout_outside_duration_range_is_fatal() {
    for secs in [1e300, -1.0, f64::NAN, f64::INFINITY] {
      let entry = TestEntry {
        timeout_secs: Some(secs),
        ..TestEntry::named("A")
      };
      let units = vec![TestUnit::new("mod1", vec![entry])];
      let err = Catalog::from_units(units, &registry(&["mod1.A"])).unwrap_err();
      match err {
        RunnerError::LoadUnit { unit, message } => {
          assert_eq!(unit, PathBuf::from("mod1"));
          assert!(message.contains("invalid timeout"), "{message}");
        }
        other => panic!("unexpected error for {secs}: {other:?}"),
      }
    }
  }

  #[test]
  fn unregistered_implementation_is_fatal() {
    let units = vec![TestUnit::new("mod1", vec![TestEntry::named("Missing")])];
    let err = Catalog::from_units(units, &registry(&[])).unwrap_err();
    assert!(matches!(err, RunnerError::UnknownImpl { .. }));
  }

  #[test]
  fn duplicate_names_are_fatal() {
    let units = vec![TestUnit::new(
      "mod1",
      vec![TestEntry::named("A"), TestEntry::named("A")],
    )];
    let err = Catalog::from_units(units, &registry(&["mod1.A"])).unwrap_err();
    assert!(matches!(err, RunnerError::DuplicateTest(name) if name == "mod1.A"));
  }
}
