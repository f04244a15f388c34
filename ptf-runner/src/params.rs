//! `key=value[;key=value]*` test parameters.
//!
//! Values are literals only: booleans, integers, floats and strings. Nothing
//! is evaluated.

use crate::{Result, RunnerError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
}

impl ParamValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      ParamValue::Str(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      ParamValue::Int(value) => Some(*value),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      ParamValue::Float(value) => Some(*value),
      ParamValue::Int(value) => Some(*value as f64),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      ParamValue::Bool(value) => Some(*value),
      _ => None,
    }
  }
}

impl fmt::Display for ParamValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ParamValue::Bool(value) => write!(f, "{value}"),
      ParamValue::Int(value) => write!(f, "{value}"),
      ParamValue::Float(value) => write!(f, "{value}"),
      ParamValue::Str(value) => write!(f, "{value:?}"),
    }
  }
}

/// Read-only parameters shared by every test of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestParams {
  values: BTreeMap<String, ParamValue>,
}

impl TestParams {
  pub fn parse(raw: &str) -> Result<Self> {
    let mut values = BTreeMap::new();
    for entry in split_entries(raw)? {
      let entry = entry.trim();
      if entry.is_empty() {
        continue;
      }
      let Some((key, value)) = entry.split_once('=') else {
        return Err(RunnerError::Params(format!("missing `=` in `{entry}`")));
      };
      let key = key.trim();
      if !is_identifier(key) {
        return Err(RunnerError::Params(format!("invalid key `{key}`")));
      }
      values.insert(key.to_string(), parse_value(value.trim())?);
    }
    Ok(Self { values })
  }

  pub fn get(&self, key: &str) -> Option<&ParamValue> {
    self.values.get(key)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
    self.values.iter().map(|(key, value)| (key.as_str(), value))
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

/// Splits on `;` outside of quoted strings.
fn split_entries(raw: &str) -> Result<Vec<&str>> {
  let mut entries = Vec::new();
  let mut quote: Option<char> = None;
  let mut start = 0;
  for (idx, ch) in raw.char_indices() {
    match (quote, ch) {
      (Some(open), c) if c == open => quote = None,
      (Some(_), _) => {}
      (None, '\'' | '"') => quote = Some(ch),
      (None, ';') => {
        entries.push(&raw[start..idx]);
        start = idx + 1;
      }
      (None, _) => {}
    }
  }
  if quote.is_some() {
    return Err(RunnerError::Params(format!("unterminated string in `{raw}`")));
  }
  entries.push(&raw[start..]);
  Ok(entries)
}

fn is_identifier(key: &str) -> bool {
  let mut chars = key.chars();
  match chars.next() {
    Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
    _ => return false,
  }
  chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn parse_value(raw: &str) -> Result<ParamValue> {
  if raw.is_empty() {
    return Err(RunnerError::Params("empty value".to_string()));
  }
  for quote in ['\'', '"'] {
    if let Some(inner) = raw.strip_prefix(quote) {
      return match inner.strip_suffix(quote) {
        Some(inner) if !inner.contains(quote) => Ok(ParamValue::Str(inner.to_string())),
        _ => Err(RunnerError::Params(format!("malformed string `{raw}`"))),
      };
    }
  }
  match raw {
    "True" | "true" => return Ok(ParamValue::Bool(true)),
    "False" | "false" => return Ok(ParamValue::Bool(false)),
    _ => {}
  }
  if let Some(hex) = raw
    .strip_prefix("0x")
    .or_else(|| raw.strip_prefix("0X"))
  {
    return i64::from_str_radix(hex, 16)
      .map(ParamValue::Int)
      .map_err(|err| RunnerError::Params(format!("invalid hex `{raw}`: {err}")));
  }
  if let Ok(value) = raw.parse::<i64>() {
    return Ok(ParamValue::Int(value));
  }
  if raw.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+' || c == '.') {
    if let Ok(value) = raw.parse::<f64>() {
      return Ok(ParamValue::Float(value));
    }
  }
  Ok(ParamValue::Str(raw.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_typed_values() {
    let params =
      TestParams::parse("vlan=10; mac='00:11:22:33:44:55';ratio=0.5;strict=True;mask=0xff;mode=fast")
        .unwrap();
    assert_eq!(params.get("vlan"), Some(&ParamValue::Int(10)));
    assert_eq!(params.get("mac").and_then(ParamValue::as_str), Some("00:11:22:33:44:55"));
    assert_eq!(params.get("ratio").and_then(ParamValue::as_f64), Some(0.5));
    assert_eq!(params.get("strict").and_then(ParamValue::as_bool), Some(true));
    assert_eq!(params.get("mask"), Some(&ParamValue::Int(255)));
    assert_eq!(params.get("mode"), Some(&ParamValue::Str("fast".into())));
    assert_eq!(params.len(), 6);
  }

  #[test]
  fn quoted_values_may_contain_separators() {
    let params = TestParams::parse(r#"path="a;b=c";n=1"#).unwrap();
    assert_eq!(params.get("path").and_then(ParamValue::as_str), Some("a;b=c"));
    assert_eq!(params.get("n"), Some(&ParamValue::Int(1)));
  }

  #[test]
  fn empty_input_and_trailing_separator() {
    assert!(TestParams::parse("").unwrap().is_empty());
    assert_eq!(TestParams::parse("a=1;").unwrap().len(), 1);
  }

  #[test]
  fn last_duplicate_wins() {
    let params = TestParams::parse("a=1;a=2").unwrap();
    assert_eq!(params.get("a"), Some(&ParamValue::Int(2)));
  }

  #[test]
  fn rejects_malformed_entries() {
    for raw in ["novalue", "1bad=2", "a=", "s='open", "a=\"x\"y\""] {
      assert!(
        matches!(TestParams::parse(raw), Err(RunnerError::Params(_))),
        "expected error for {raw}"
      );
    }
  }
}
