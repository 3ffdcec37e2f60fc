//! Adapters from government spreadsheet exports (CSV form) to normalized
//! import documents.
//!
//! Budget files are named `law_YYYY.csv`, `draft_YYYY.csv` or
//! `report_YYYY_MM.csv` and carry the standard classifier columns
//! (Мин/Рз/ПР/ЦСР/ВР) after a preamble of arbitrary length. Totals files
//! hold one column per month and one row per functional section.

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;
use time::{Date, Month};

use crate::import::{BudgetDocument, ExpenseRow};
use crate::models::{
    write::{BudgetUpsert, RateWindowUpsert},
    BudgetScope, BudgetType, DimensionKind,
};
use crate::resolver::DimensionSpec;

/// Budget-file amounts are in thousands of the source currency.
const THOUSAND: f64 = 1_000.0;
/// Totals-file amounts are in billions.
const BILLION: f64 = 1_000_000_000.0;

/// Functional sections of the totals file map to budget chapters.
const FUNCTIONAL_SECTIONS: [(&str, &str); 14] = [
    ("2.1.", "01"),
    ("2.2.", "02"),
    ("2.3.", "03"),
    ("2.4.", "04"),
    ("2.5.", "05"),
    ("2.6.", "06"),
    ("2.7.", "07"),
    ("2.8.", "08"),
    ("2.9.", "09"),
    ("2.10.", "10"),
    ("2.11.", "11"),
    ("2.12.", "12"),
    ("2.13.", "13"),
    ("2.14.", "14"),
];

const RU_MONTHS: [(&str, u8); 12] = [
    ("янв", 1),
    ("фев", 2),
    ("мар", 3),
    ("апр", 4),
    ("май", 5),
    ("июн", 6),
    ("июл", 7),
    ("авг", 8),
    ("сен", 9),
    ("окт", 10),
    ("ноя", 11),
    ("дек", 12),
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("cannot tell budget type from filename: {0}")]
    UnknownFileType(String),
    #[error("no four-digit year in filename: {0}")]
    MissingYear(String),
    #[error("no header row found (expected Наименование plus classifier columns)")]
    HeaderNotFound,
    #[error("header row has no {0} column")]
    MissingColumn(&'static str),
    #[error("no month columns found in totals header")]
    NoMonthColumns,
    #[error("row {row}: {reason}")]
    InvalidRecord { row: usize, reason: String },
    #[error("invalid date in filename: {0}")]
    InvalidDate(String),
}

/// Builds the budget record from the filename alone. The file body only
/// contributes expense rows.
pub fn budget_from_filename(path: &Path) -> Result<BudgetUpsert, SourceError> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let (budget_type, title, scope) = if stem.starts_with("law") {
        (BudgetType::Law, "Federal Budget Law", BudgetScope::Yearly)
    } else if stem.starts_with("report") {
        (BudgetType::Report, "Federal Budget Report", BudgetScope::Quarterly)
    } else if stem.starts_with("draft") {
        (BudgetType::Draft, "Federal Budget Draft", BudgetScope::Yearly)
    } else {
        return Err(SourceError::UnknownFileType(stem));
    };

    let parts: Vec<&str> = stem.split('_').collect();
    let year_pos = parts
        .iter()
        .position(|p| p.len() == 4 && p.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| SourceError::MissingYear(stem.clone()))?;
    let year: i32 = parts[year_pos]
        .parse()
        .map_err(|_| SourceError::MissingYear(stem.clone()))?;

    // Reports carry a month segment after the year.
    let month: Option<u8> = if budget_type == BudgetType::Report {
        parts
            .get(year_pos + 1)
            .and_then(|p| p.parse::<u8>().ok())
            .filter(|m| (1..=12).contains(m))
    } else {
        None
    };

    let original_identifier = match month {
        Some(m) => format!("{}-{year}-{m:02}", budget_type.as_str()),
        None => format!("{}-{year}", budget_type.as_str()),
    };
    let description = match month {
        Some(m) => format!("{title} {year}-{m:02}"),
        None => format!("{title} {year}"),
    };
    let published_at = first_of_month(year, month.unwrap_or(1))
        .map_err(|_| SourceError::InvalidDate(stem.clone()))?;

    Ok(BudgetUpsert {
        original_identifier,
        name: title.to_string(),
        name_translated: None,
        description: Some(description),
        description_translated: None,
        budget_type,
        scope,
        published_at,
        planned_at: None,
    })
}

/// Parses one budget file into a complete import document: budget from the
/// filename, dimension definitions and expense rows from the body.
pub fn parse_budget_file(path: &Path) -> Result<BudgetDocument, SourceError> {
    let budget = budget_from_filename(path)?;
    let records = read_records(path)?;
    let header_idx = find_header_row(&records).ok_or(SourceError::HeaderNotFound)?;
    let columns = map_columns(&records[header_idx])?;
    let merged = merge_rows(&records[header_idx + 1..], &columns, THOUSAND);

    tracing::debug!(
        file = %path.display(),
        header_row = header_idx,
        merged_rows = merged.len(),
        "parsed budget file"
    );

    Ok(BudgetDocument {
        budget,
        dimensions: derive_dimensions(&merged),
        rows: build_expense_rows(&merged),
    })
}

/// Parses a monthly totals file into one TOTAL budget document per month
/// and flow direction. Chapter rows reference chapters defined by earlier
/// budget imports and never rename them.
pub fn parse_totals_file(
    path: &Path,
    start_year: i32,
) -> Result<Vec<BudgetDocument>, SourceError> {
    let records = read_records(path)?;

    let (header_idx, month_columns) = records
        .iter()
        .enumerate()
        .find_map(|(idx, record)| {
            let cols: Vec<(usize, Date)> = record
                .iter()
                .enumerate()
                .skip(2)
                .filter_map(|(col, cell)| parse_month_header(cell).map(|d| (col, d)))
                .collect();
            if cols.is_empty() {
                None
            } else {
                Some((idx, cols))
            }
        })
        .ok_or(SourceError::NoMonthColumns)?;

    let find_row = |indicator: &str| {
        records[header_idx + 1..]
            .iter()
            .position(|r| r.get(0).map(str::trim) == Some(indicator))
            .map(|i| header_idx + 1 + i)
    };
    let revenue_row = find_row("1");
    let expense_row = find_row("2");
    let section_rows: Vec<(&str, usize)> = FUNCTIONAL_SECTIONS
        .iter()
        .filter_map(|(indicator, chapter)| find_row(indicator).map(|idx| (*chapter, idx)))
        .collect();

    let cell = |row: usize, col: usize| -> Option<f64> {
        records[row]
            .get(col)
            .and_then(parse_value)
            .map(|v| v * BILLION)
    };

    let mut documents = Vec::new();
    for &(col, month_date) in &month_columns {
        if month_date.year() < start_year {
            continue;
        }
        let period = format!("{}-{:02}", month_date.year(), u8::from(month_date.month()));

        if let Some(revenue) = revenue_row.and_then(|row| cell(row, col)) {
            let identifier = format!("TOTAL-REVENUE-{period}");
            documents.push(BudgetDocument {
                budget: total_budget(
                    &identifier,
                    &format!("Total Federal Revenue {period}"),
                    month_date,
                ),
                dimensions: vec![],
                rows: vec![ExpenseRow {
                    original_identifier: identifier.clone(),
                    value: revenue,
                    dimensions: vec![],
                }],
            });
        }

        let total_expense = expense_row.and_then(|row| cell(row, col));
        let mut rows = Vec::new();
        let identifier = format!("TOTAL-EXPENSE-{period}");
        if let Some(value) = total_expense {
            rows.push(ExpenseRow {
                original_identifier: identifier.clone(),
                value,
                dimensions: vec![],
            });
        }
        for &(chapter, row_idx) in &section_rows {
            if let Some(value) = cell(row_idx, col) {
                rows.push(ExpenseRow {
                    original_identifier: format!("{identifier}-{chapter}"),
                    value,
                    dimensions: vec![DimensionSpec::reference(DimensionKind::Chapter, chapter)],
                });
            }
        }
        if !rows.is_empty() {
            documents.push(BudgetDocument {
                budget: total_budget(
                    &identifier,
                    &format!("Total Federal Expenses {period}"),
                    month_date,
                ),
                dimensions: vec![],
                rows,
            });
        }
    }

    tracing::debug!(file = %path.display(), budgets = documents.len(), "parsed totals file");
    Ok(documents)
}

/// Parses a conversion-rate file: `pair,rate,started_at,ended_at` with
/// empty bounds meaning unbounded.
pub fn parse_rates_file(path: &Path) -> Result<Vec<RateWindowUpsert>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut windows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let row = idx + 2;
        let invalid = |reason: String| SourceError::InvalidRecord { row, reason };

        let pair = record
            .get(0)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid("missing pair".to_string()))?
            .to_string();
        let rate: f64 = record
            .get(1)
            .unwrap_or("")
            .parse()
            .map_err(|_| invalid(format!("bad rate: {:?}", record.get(1).unwrap_or(""))))?;
        let started_at = parse_bound(record.get(2)).map_err(&invalid)?;
        let ended_at = parse_bound(record.get(3)).map_err(&invalid)?;

        windows.push(RateWindowUpsert {
            pair,
            rate,
            started_at,
            ended_at,
        });
    }
    Ok(windows)
}

fn parse_bound(cell: Option<&str>) -> Result<Option<Date>, String> {
    match cell.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_iso_date(s)
            .map(Some)
            .ok_or_else(|| format!("bad date: {s:?}")),
    }
}

fn total_budget(identifier: &str, name: &str, published_at: Date) -> BudgetUpsert {
    BudgetUpsert {
        original_identifier: identifier.to_string(),
        name: name.to_string(),
        name_translated: None,
        description: None,
        description_translated: None,
        budget_type: BudgetType::Total,
        scope: BudgetScope::Monthly,
        published_at,
        planned_at: None,
    }
}

fn read_records(path: &Path) -> Result<Vec<csv::StringRecord>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record?);
    }
    Ok(records)
}

/// The header row names the label column and at least the ministry
/// classifier; everything above it is preamble.
pub(crate) fn find_header_row(records: &[csv::StringRecord]) -> Option<usize> {
    records.iter().position(|record| {
        let joined = record.iter().collect::<Vec<_>>().join(" ");
        joined.contains("Наименование") && (joined.contains("Мін") || joined.contains("Мин"))
    })
}

#[derive(Debug, Default)]
struct ColumnMap {
    name: usize,
    ministry: Option<usize>,
    chapter: Option<usize>,
    subchapter: Option<usize>,
    program: Option<usize>,
    expense_type: Option<usize>,
    value: Option<usize>,
}

fn map_columns(header: &csv::StringRecord) -> Result<ColumnMap, SourceError> {
    let mut columns = ColumnMap::default();
    let mut has_name = false;

    for (idx, cell) in header.iter().enumerate() {
        let cell = cell.trim();
        if cell.to_lowercase().contains("наименование") {
            columns.name = idx;
            has_name = true;
        } else {
            match cell {
                "Мин" | "Мін" => columns.ministry = Some(idx),
                "Рз" => columns.chapter = Some(idx),
                "ПР" => columns.subchapter = Some(idx),
                "ЦСР" => columns.program = Some(idx),
                "ВР" => columns.expense_type = Some(idx),
                _ => {}
            }
        }
    }
    if !has_name {
        return Err(SourceError::MissingColumn("Наименование"));
    }
    // The value column follows the last classifier.
    columns.value = columns.expense_type.map(|idx| idx + 1);
    Ok(columns)
}

#[derive(Debug)]
struct MergedRow {
    name: String,
    ministry_code: Option<String>,
    chapter_code: Option<String>,
    subchapter_code: Option<String>,
    program_code: Option<String>,
    expense_type_code: Option<String>,
    value: Option<f64>,
}

/// Collapses the source's multi-line labels: rows without any classifier
/// code either continue the previous entry's name or accumulate into the
/// next one.
fn merge_rows(records: &[csv::StringRecord], columns: &ColumnMap, multiplier: f64) -> Vec<MergedRow> {
    let mut merged: Vec<MergedRow> = Vec::new();
    let mut accumulated = String::new();
    let mut first_data_row = true;

    for record in records {
        let raw_name = record.get(columns.name).unwrap_or("");
        let name = normalize_name(raw_name);
        if name.is_empty() {
            continue;
        }

        // The grand-total line sits right under the header.
        if first_data_row {
            first_data_row = false;
            if name.replace(' ', "").to_lowercase().contains("всего") {
                continue;
            }
        }

        let code_at = |idx: Option<usize>| idx.and_then(|i| record.get(i)).and_then(clean_code);
        let ministry_code = code_at(columns.ministry);
        let chapter_code = code_at(columns.chapter);
        let subchapter_code = code_at(columns.subchapter);
        let program_code = code_at(columns.program);
        let expense_type_code = code_at(columns.expense_type);

        let has_codes = [
            &ministry_code,
            &chapter_code,
            &subchapter_code,
            &program_code,
            &expense_type_code,
        ]
        .iter()
        .any(|c| c.is_some());

        if !has_codes {
            if let Some(prev) = merged.last_mut() {
                if prev.expense_type_code.is_some() && !prev.name.ends_with(')') {
                    prev.name.push(' ');
                    prev.name.push_str(&name);
                    continue;
                }
                if prev.expense_type_code.is_none() && name.ends_with('"') {
                    prev.name.push(' ');
                    prev.name.push_str(&name);
                    continue;
                }
            }
            if accumulated.is_empty() {
                accumulated = name;
            } else {
                accumulated.push(' ');
                accumulated.push_str(&name);
            }
            continue;
        }

        let full_name = if accumulated.is_empty() {
            name
        } else {
            let combined = format!("{accumulated} {name}");
            accumulated.clear();
            combined
        };

        let value = columns
            .value
            .and_then(|i| record.get(i))
            .and_then(parse_value)
            .map(|v| v * multiplier);

        merged.push(MergedRow {
            name: full_name,
            ministry_code,
            chapter_code,
            subchapter_code,
            program_code,
            expense_type_code,
            value,
        });
    }
    merged
}

/// Derives dimension definitions from merged rows in file order, parents
/// before children. Which kinds a row defines depends on which classifier
/// codes it carries.
fn derive_dimensions(merged: &[MergedRow]) -> Vec<DimensionSpec> {
    let mut specs: Vec<DimensionSpec> = Vec::new();
    let mut seen: HashSet<(DimensionKind, String)> = HashSet::new();

    let mut push = |specs: &mut Vec<DimensionSpec>, spec: DimensionSpec| {
        if seen.insert((spec.kind.clone(), spec.identifier.clone())) {
            specs.push(spec);
        }
    };

    for row in merged {
        if let Some(ministry) = &row.ministry_code {
            if row.chapter_code.is_none() && row.program_code.is_none() {
                push(
                    &mut specs,
                    DimensionSpec::new(DimensionKind::Ministry, ministry, &row.name),
                );
            }
        }

        if let Some(chapter) = &row.chapter_code {
            if row.subchapter_code.is_none() && row.program_code.is_none() {
                push(
                    &mut specs,
                    DimensionSpec::new(DimensionKind::Chapter, chapter, &row.name),
                );
            }
        }

        if let (Some(chapter), Some(sub)) = (&row.chapter_code, &row.subchapter_code) {
            if row.program_code.is_none() {
                push(
                    &mut specs,
                    DimensionSpec::new(
                        DimensionKind::SubChapter,
                        format!("{chapter}{sub}"),
                        &row.name,
                    )
                    .with_parent(DimensionKind::Chapter, chapter),
                );
            }
        }

        // Program codes nest by prefix in the source, but a dimension's
        // parent must be of a different kind, so programs stay flat and
        // nesting lives in the code itself.
        if let Some(program) = &row.program_code {
            if row.expense_type_code.is_none() {
                push(
                    &mut specs,
                    DimensionSpec::new(DimensionKind::Program, program, &row.name),
                );
            }
        }

        if let Some(expense_type) = &row.expense_type_code {
            push(
                &mut specs,
                DimensionSpec::new(
                    DimensionKind::ExpenseType,
                    expense_type,
                    extract_expense_type_name(&row.name),
                ),
            );

            // The most specific tag: a program narrowed by expense type.
            if let Some(program) = &row.program_code {
                push(
                    &mut specs,
                    DimensionSpec::new(
                        DimensionKind::Program,
                        format!("{program}-{expense_type}"),
                        &row.name,
                    ),
                );
            }
        }
    }
    specs
}

/// Rows carrying an expense-type code and a value become expenses; their
/// dimension tags reference the definitions derived above.
fn build_expense_rows(merged: &[MergedRow]) -> Vec<ExpenseRow> {
    let mut rows = Vec::new();
    for row in merged {
        let (Some(expense_type), Some(value)) = (&row.expense_type_code, row.value) else {
            continue;
        };

        let mut dimensions = Vec::new();
        let mut segments: Vec<&str> = Vec::new();

        if let Some(ministry) = &row.ministry_code {
            dimensions.push(DimensionSpec::reference(DimensionKind::Ministry, ministry));
            segments.push(ministry);
        }
        if let Some(chapter) = &row.chapter_code {
            dimensions.push(DimensionSpec::reference(DimensionKind::Chapter, chapter));
            segments.push(chapter);
            if let Some(sub) = &row.subchapter_code {
                dimensions.push(DimensionSpec::reference(
                    DimensionKind::SubChapter,
                    format!("{chapter}{sub}"),
                ));
                segments.push(sub);
            }
        }
        if let Some(program) = &row.program_code {
            dimensions.push(DimensionSpec::reference(
                DimensionKind::Program,
                format!("{program}-{expense_type}"),
            ));
            segments.push(program);
        }
        dimensions.push(DimensionSpec::reference(
            DimensionKind::ExpenseType,
            expense_type,
        ));
        segments.push(expense_type);

        rows.push(ExpenseRow {
            original_identifier: segments.join("-"),
            value,
            dimensions,
        });
    }
    rows
}

fn normalize_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_code(cell: &str) -> Option<String> {
    let cleaned: String = cell.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(cleaned)
    }
}

fn parse_value(cell: &str) -> Option<f64> {
    let cleaned: String = cell
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Expense-type labels carry the short name in the last parenthesis pair,
/// e.g. "Закупка товаров (Iной закупки товаров)".
fn extract_expense_type_name(full: &str) -> String {
    let chars: Vec<char> = full.chars().collect();
    let Some(last_close) = chars.iter().rposition(|&c| c == ')') else {
        return full.to_string();
    };

    let mut depth = 0usize;
    for i in (0..last_close).rev() {
        match chars[i] {
            ')' => depth += 1,
            '(' => {
                if depth == 0 {
                    return chars[i + 1..last_close].iter().collect::<String>().trim().to_string();
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    full.to_string()
}

/// Totals column headers are either ISO dates/months or Russian month
/// abbreviations like "янв.18".
fn parse_month_header(cell: &str) -> Option<Date> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }

    if let Some(date) = parse_iso_date(cell) {
        return first_of_month(date.year(), u8::from(date.month())).ok();
    }

    let parts: Vec<&str> = cell.split('-').collect();
    if parts.len() == 2 {
        if let (Ok(year), Ok(month)) = (parts[0].parse::<i32>(), parts[1].parse::<u8>()) {
            if parts[0].len() == 4 {
                return first_of_month(year, month).ok();
            }
        }
    }

    let lowered = cell.to_lowercase();
    for (abbr, month) in RU_MONTHS {
        if lowered.contains(abbr) {
            let year: i32 = lowered
                .rsplit('.')
                .next()
                .and_then(|y| y.trim().parse::<i32>().ok())
                .filter(|y| (0..=99).contains(y))
                .map(|y| 2000 + y)?;
            return first_of_month(year, month).ok();
        }
    }
    None
}

fn parse_iso_date(s: &str) -> Option<Date> {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    let year: i32 = parts[0].parse().ok()?;
    let month: u8 = parts[1].parse().ok()?;
    let day: u8 = parts[2].parse().ok()?;
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

fn first_of_month(year: i32, month: u8) -> Result<Date, time::error::ComponentRange> {
    Date::from_calendar_date(year, Month::try_from(month)?, 1)
}
