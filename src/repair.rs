//! Cleanup of raw source exports before import.
//!
//! Raw files arrive with arbitrary names, UTF-8 BOMs, Windows line endings
//! and ragged rows. Repair rewrites each file under its canonical name
//! (`law_YYYY.csv`, `report_YYYY_MM.csv`) with those defects fixed, and
//! verifies the classifier header is detectable. Running repair on an
//! already-clean directory changes nothing.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::source::find_header_row;

const BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum RepairError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    Laws,
    Reports,
}

impl RepairKind {
    fn canonical_name(&self, year: i32, month: Option<u8>) -> Option<String> {
        match (self, month) {
            (RepairKind::Laws, _) => Some(format!("law_{year}.csv")),
            (RepairKind::Reports, Some(m)) => Some(format!("report_{year}_{m:02}.csv")),
            (RepairKind::Reports, None) => None,
        }
    }
}

#[derive(Debug)]
pub struct RepairedFile {
    pub input: PathBuf,
    pub output: PathBuf,
    pub changes: Vec<&'static str>,
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub repaired: Vec<RepairedFile>,
    /// Files that could not be processed, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

/// Repairs every CSV file in `raw_dir` into `clean_dir` under its canonical
/// name. With `validate_only` nothing is written; the report still lists
/// what would change.
pub fn repair_directory(
    raw_dir: &Path,
    clean_dir: &Path,
    kind: RepairKind,
    validate_only: bool,
) -> Result<RepairReport, RepairError> {
    let mut report = RepairReport::default();

    let mut entries: Vec<PathBuf> = fs::read_dir(raw_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .collect();
    entries.sort();

    if !validate_only {
        fs::create_dir_all(clean_dir)?;
    }

    for input in entries {
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some((year, month)) = extract_period(&file_name) else {
            report
                .skipped
                .push((input, "no year in filename".to_string()));
            continue;
        };
        let Some(canonical) = kind.canonical_name(year, month) else {
            report
                .skipped
                .push((input, "no month in report filename".to_string()));
            continue;
        };

        let raw = fs::read_to_string(&input)?;
        let (cleaned, mut changes) = repair_content(&raw)?;
        let output = clean_dir.join(&canonical);
        if file_name != canonical {
            changes.push("renamed");
        }

        let cleaned_records = read_all(cleaned.as_bytes())?;
        if find_header_row(&cleaned_records).is_none() {
            report
                .skipped
                .push((input, "no classifier header row".to_string()));
            continue;
        }

        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            changes = ?changes,
            validate_only,
            "repaired source file"
        );
        if !validate_only {
            fs::write(&output, &cleaned)?;
        }
        report.repaired.push(RepairedFile {
            input,
            output,
            changes,
        });
    }
    Ok(report)
}

/// Normalizes one file's content. Fixes are applied in order: BOM strip,
/// line-ending normalization, ragged-row padding to the widest record.
pub fn repair_content(raw: &str) -> Result<(String, Vec<&'static str>), RepairError> {
    let mut changes = Vec::new();

    let without_bom = match raw.strip_prefix(BOM) {
        Some(rest) => {
            changes.push("bom");
            rest
        }
        None => raw,
    };

    let normalized = if without_bom.contains('\r') {
        changes.push("crlf");
        without_bom.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        without_bom.to_string()
    };

    let records = read_all(normalized.as_bytes())?;
    let width = records.iter().map(|r| r.len()).max().unwrap_or(0);
    let ragged = records.iter().any(|r| r.len() != width);
    if !ragged {
        return Ok((normalized, changes));
    }
    changes.push("ragged-rows");

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for record in &records {
        let mut padded: Vec<&str> = record.iter().collect();
        padded.resize(width, "");
        writer.write_record(&padded)?;
    }
    let bytes = writer.into_inner().map_err(|e| {
        RepairError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    let text = String::from_utf8(bytes).unwrap_or(normalized);
    Ok((text, changes))
}

fn read_all(bytes: &[u8]) -> Result<Vec<csv::StringRecord>, RepairError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record?);
    }
    Ok(records)
}

/// Finds the first four-digit year in a filename and, if present, a
/// two-digit month right after it.
fn extract_period(name: &str) -> Option<(i32, Option<u8>)> {
    let chars: Vec<char> = name.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 4 {
                let year: i32 = chars[start..i].iter().collect::<String>().parse().ok()?;
                let month = parse_month_after(&chars, i);
                return Some((year, month));
            }
        } else {
            i += 1;
        }
    }
    None
}

fn parse_month_after(chars: &[char], after: usize) -> Option<u8> {
    if after >= chars.len() || !matches!(chars[after], '-' | '_' | '.') {
        return None;
    }
    let digits: String = chars[after + 1..]
        .iter()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.len() != 2 {
        return None;
    }
    digits.parse::<u8>().ok().filter(|m| (1..=12).contains(m))
}
