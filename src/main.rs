use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use budgetdb::config::{CliArgs, Command, Config, LoggingConfig};
use budgetdb::import::{ImportPipeline, ImportReport};
use budgetdb::models::{BudgetId, BudgetType};
use budgetdb::reconcile::ReconciliationEngine;
use budgetdb::repair::{repair_directory, RepairKind};
use budgetdb::source;
use budgetdb::storage::Upserted;
use budgetdb::translate::{apply_translations, TranslationCache};
use budgetdb::{SqliteStorage, StorageBackend};

type CliError = Box<dyn std::error::Error>;

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config = Config::load(&args);
    init_tracing(&config.logging);

    match run(args, &config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(args: CliArgs, config: &Config) -> Result<ExitCode, CliError> {
    match args.command {
        Command::Repair {
            raw_dir,
            reports,
            validate_only,
        } => {
            let kind = if reports {
                RepairKind::Reports
            } else {
                RepairKind::Laws
            };
            let report = repair_directory(&raw_dir, &config.data.dir, kind, validate_only)?;
            for (path, reason) in &report.skipped {
                tracing::warn!(file = %path.display(), reason, "file not repaired");
            }
            println!(
                "{} file(s) repaired, {} skipped",
                report.repaired.len(),
                report.skipped.len()
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::Budget { files, kind, year } => {
            let kind = kind
                .as_deref()
                .map(str::parse::<BudgetType>)
                .transpose()
                .map_err(CliError::from)?;
            let files = if files.is_empty() {
                discover_budget_files(&config.data.dir, kind, &year)?
            } else {
                files
            };
            if files.is_empty() {
                return Err("no budget files matched".into());
            }

            let store = SqliteStorage::new(&config.database.path)?;
            let pipeline = ImportPipeline::new(&store);
            let mut reports = Vec::new();
            for file in &files {
                let doc = source::parse_budget_file(file)?;
                reports.push(pipeline.import_budget(&doc)?);
            }
            for report in &reports {
                print_report(report);
            }
            Ok(batch_exit_code(&reports))
        }

        Command::Totals { file, start_year } => {
            let store = SqliteStorage::new(&config.database.path)?;
            let pipeline = ImportPipeline::new(&store);
            let mut reports = Vec::new();
            for doc in source::parse_totals_file(&file, start_year)? {
                reports.push(pipeline.import_budget(&doc)?);
            }
            for report in &reports {
                print_report(report);
            }
            Ok(batch_exit_code(&reports))
        }

        Command::Rates { file } => {
            let windows = source::parse_rates_file(&file)?;
            let store = SqliteStorage::new(&config.database.path)?;
            let tx = store.begin_transaction()?;
            let mut created = 0usize;
            for window in &windows {
                match store.upsert_rate_window(window) {
                    Ok(Upserted::Created) => created += 1,
                    Ok(_) => {}
                    Err(e) => {
                        store.rollback_transaction(tx)?;
                        return Err(e.into());
                    }
                }
            }
            store.commit_transaction(tx)?;
            println!("{} rate window(s) imported, {} new", windows.len(), created);
            Ok(ExitCode::SUCCESS)
        }

        Command::Translate {
            cache,
            add,
            dry_run,
            force,
        } => {
            let path = cache.unwrap_or_else(|| config.data.translations_file.clone());
            let mut cache = TranslationCache::load(&path)?;
            if !add.is_empty() {
                for entry in &add {
                    let (source, translated) = entry.split_once('=').ok_or_else(|| {
                        format!("bad cache entry {entry:?}, expected RUSSIAN=ENGLISH")
                    })?;
                    cache.insert(source.trim(), translated.trim());
                }
                cache.save(&path)?;
                println!("cache now holds {} entries", cache.len());
            }
            let store = SqliteStorage::new(&config.database.path)?;
            let outcome = apply_translations(&store, &cache, dry_run, force)?;
            println!(
                "{} name(s) translated ({} row(s)), {} missing from cache",
                outcome.applied,
                outcome.rows_updated,
                outcome.missing.len()
            );
            for name in &outcome.missing {
                println!("  missing: {name}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Reconcile { total, comparison } => {
            let store = SqliteStorage::new(&config.database.path)?;
            let total_id = budget_by_identifier(&store, &total)?;
            let comparison_id = budget_by_identifier(&store, &comparison)?;
            let report = ReconciliationEngine::new(&store).reconcile(total_id, comparison_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Per-row failures only fail the command when a whole batch produced
/// nothing but failures.
fn batch_exit_code(reports: &[ImportReport]) -> ExitCode {
    if reports.iter().any(|r| r.is_total_failure()) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_report(report: &ImportReport) {
    println!(
        "{}: {} created, {} updated, {} skipped, {} failed",
        report.budget_identifier, report.created, report.updated, report.skipped, report.failed
    );
    for failure in &report.failures {
        println!("  {}: {}", failure.identifier, failure.reason);
    }
}

/// Identifiers are unique within (type, scope) but the CLI takes a bare
/// identifier; refuse to guess when it matches more than one budget.
fn budget_by_identifier(
    store: &dyn StorageBackend,
    identifier: &str,
) -> Result<BudgetId, CliError> {
    let matches: Vec<BudgetId> = store
        .list_budgets(None)?
        .into_iter()
        .filter(|b| b.original_identifier == identifier)
        .map(|b| b.id)
        .collect();
    match matches.as_slice() {
        [] => Err(format!("no budget named {identifier}").into()),
        [id] => Ok(*id),
        _ => Err(format!(
            "identifier {identifier} matches {} budgets; disambiguate by re-importing with distinct identifiers",
            matches.len()
        )
        .into()),
    }
}

fn discover_budget_files(
    dir: &std::path::Path,
    kind: Option<BudgetType>,
    years: &[i32],
) -> Result<Vec<PathBuf>, CliError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e != "csv").unwrap_or(true) {
            continue;
        }
        let Ok(budget) = source::budget_from_filename(&path) else {
            continue;
        };
        if kind.is_some_and(|k| k != budget.budget_type) {
            continue;
        }
        if !years.is_empty() && !years.contains(&budget.published_at.year()) {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}
