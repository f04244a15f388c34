use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Top-level JSON report: a versioned summary followed by per-test results
/// in execution order.
#[derive(Debug, Serialize)]
pub struct ReportRef<'a, Summary, Result> {
  pub schema_version: u32,
  pub summary: &'a Summary,
  pub results: &'a [Result],
}

impl<'a, Summary, Result> ReportRef<'a, Summary, Result> {
  pub fn new(schema_version: u32, summary: &'a Summary, results: &'a [Result]) -> Self {
    Self {
      schema_version,
      summary,
      results,
    }
  }
}

/// Writes `report` as pretty JSON to `path`, creating parent directories.
pub fn write_json_report<T: Serialize>(path: &Path, report: &T) -> anyhow::Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
  }

  let file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
  let mut writer = BufWriter::new(file);
  write_json_report_to_writer(&mut writer, report)
    .with_context(|| format!("write report to {}", path.display()))?;
  writer
    .flush()
    .with_context(|| format!("flush {}", path.display()))
}

pub fn write_json_report_to_writer<W: Write, T: Serialize>(
  writer: &mut W,
  report: &T,
) -> anyhow::Result<()> {
  serde_json::to_writer_pretty(&mut *writer, report).context("write JSON report")?;
  writeln!(writer).context("write JSON report")
}

/// Removes `dir` if present and creates it empty.
pub fn recreate_dir(dir: &Path) -> anyhow::Result<()> {
  if dir.exists() {
    fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
  }
  fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))
}

/// `<name>.json` with path separators replaced, so every test name maps to
/// a single file inside the report directory.
pub fn report_file_name(name: &str) -> String {
  let mut file: String = name
    .chars()
    .map(|c| match c {
      '/' | '\\' | ':' => '_',
      c => c,
    })
    .collect();
  file.push_str(".json");
  file
}
