use crate::catalog::{Catalog, TestDescriptor, GROUP_STANDARD};
use crate::{Result, RunnerError};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const EXCLUDE_PREFIX: char = '^';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionToken {
  Include(String),
  Exclude(String),
}

impl SelectionToken {
  pub fn name(&self) -> &str {
    match self {
      SelectionToken::Include(name) | SelectionToken::Exclude(name) => name,
    }
  }
}

impl fmt::Display for SelectionToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SelectionToken::Include(name) => f.write_str(name),
      SelectionToken::Exclude(name) => write!(f, "{EXCLUDE_PREFIX}{name}"),
    }
  }
}

impl std::str::FromStr for SelectionToken {
  type Err = RunnerError;

  fn from_str(raw: &str) -> Result<Self> {
    let trimmed = raw.trim();
    let (negated, name) = match trimmed.strip_prefix(EXCLUDE_PREFIX) {
      Some(rest) => (true, rest),
      None => (false, trimmed),
    };
    if name.is_empty() || name.starts_with(EXCLUDE_PREFIX) || name.chars().any(char::is_whitespace)
    {
      return Err(RunnerError::MalformedToken(raw.to_string()));
    }
    Ok(if negated {
      SelectionToken::Exclude(name.to_string())
    } else {
      SelectionToken::Include(name.to_string())
    })
  }
}

/// Parses raw tokens in order. No tokens means the `standard` group.
pub fn parse_tokens<S: AsRef<str>>(raw: &[S]) -> Result<Vec<SelectionToken>> {
  if raw.is_empty() {
    return Ok(vec![SelectionToken::Include(GROUP_STANDARD.to_string())]);
  }
  raw.iter().map(|token| token.as_ref().parse()).collect()
}

/// One token per line; `#` starts a comment and blank lines are skipped.
pub fn parse_selection_lines(raw: &str) -> Vec<String> {
  raw
    .lines()
    .map(|line| match line.split_once('#') {
      Some((before, _)) => before,
      None => line,
    })
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .map(String::from)
    .collect()
}

pub fn read_selection_file(path: &Path) -> Result<Vec<String>> {
  let raw = fs::read_to_string(path).map_err(|err| {
    RunnerError::Config(format!("read selection file {}: {err}", path.display()))
  })?;
  Ok(parse_selection_lines(&raw))
}

/// Selected tests grouped by module, in first-selection order.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSuite {
  modules: Vec<(String, Vec<Arc<TestDescriptor>>)>,
}

impl ResolvedSuite {
  pub fn modules(&self) -> impl Iterator<Item = (&str, &[Arc<TestDescriptor>])> {
    self
      .modules
      .iter()
      .map(|(name, tests)| (name.as_str(), tests.as_slice()))
  }

  pub fn tests(&self) -> impl Iterator<Item = &Arc<TestDescriptor>> {
    self.modules.iter().flat_map(|(_, tests)| tests.iter())
  }

  pub fn names(&self) -> Vec<&str> {
    self.tests().map(|test| test.qualified_name.as_str()).collect()
  }

  pub fn len(&self) -> usize {
    self.modules.iter().map(|(_, tests)| tests.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.modules.is_empty()
  }

  /// Flattens the suite into execution order.
  pub fn into_tests(self) -> Vec<Arc<TestDescriptor>> {
    self
      .modules
      .into_iter()
      .flat_map(|(_, tests)| tests)
      .collect()
  }

  fn include(&mut self, test: &Arc<TestDescriptor>) -> bool {
    let existing = self.modules.iter().position(|(name, _)| *name == test.module);
    let slot = match existing {
      Some(idx) => &mut self.modules[idx].1,
      None => {
        self.modules.push((test.module.clone(), Vec::new()));
        let last = self.modules.len() - 1;
        &mut self.modules[last].1
      }
    };
    if slot.iter().any(|t| t.qualified_name == test.qualified_name) {
      return false;
    }
    slot.push(Arc::clone(test));
    true
  }

  fn exclude(&mut self, token: &str) -> usize {
    let mut removed = 0;
    for (_, tests) in self.modules.iter_mut() {
      let before = tests.len();
      tests.retain(|test| !test.matches(token));
      removed += before - tests.len();
    }
    self.modules.retain(|(_, tests)| !tests.is_empty());
    removed
  }
}

/// Applies `tokens` left to right against `catalog`.
///
/// Later tokens override earlier ones for the same test, so `A ^A B`
/// selects the same tests as `B`. An include that matches nothing is fatal;
/// an exclude that matches nothing is ignored.
pub fn resolve(tokens: &[SelectionToken], catalog: &Catalog) -> Result<ResolvedSuite> {
  let mut suite = ResolvedSuite::default();
  for token in tokens {
    match token {
      SelectionToken::Include(name) => {
        let mut matched = 0;
        let mut added = 0;
        for test in catalog.tests().filter(|test| test.matches(name)) {
          matched += 1;
          if suite.include(test) {
            added += 1;
          }
        }
        if matched == 0 {
          return Err(RunnerError::UnmatchedToken(name.clone()));
        }
        debug!(token = %token, matched, added, "applied selection token");
      }
      SelectionToken::Exclude(name) => {
        let removed = suite.exclude(name);
        debug!(token = %token, removed, "applied selection token");
      }
    }
  }
  Ok(suite)
}
