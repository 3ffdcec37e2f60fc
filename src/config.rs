use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "budgetdb", about = "Normalized store and import pipeline for government budget data")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "budgetdb.toml")]
    pub config: String,

    /// Database path (overrides config file)
    #[arg(short, long)]
    pub database: Option<String>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Normalize raw source files into the clean data directory
    Repair {
        /// Directory with raw exports
        raw_dir: PathBuf,
        /// Treat files as monthly reports instead of yearly laws
        #[arg(long)]
        reports: bool,
        /// Report defects without writing anything
        #[arg(long)]
        validate_only: bool,
    },
    /// Import budget files (law/draft/report)
    Budget {
        /// Specific files; defaults to every budget file in the data directory
        files: Vec<PathBuf>,
        /// Only import files of this type (law, draft or report)
        #[arg(long, value_name = "TYPE")]
        kind: Option<String>,
        /// Only import these years
        #[arg(long)]
        year: Vec<i32>,
    },
    /// Import a monthly totals file
    Totals {
        file: PathBuf,
        /// Ignore months before this year
        #[arg(long, default_value_t = 2018)]
        start_year: i32,
    },
    /// Import conversion-rate windows
    Rates { file: PathBuf },
    /// Apply cached name translations to dimensions
    Translate {
        /// Translation cache path (overrides config file)
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Add a cache entry before the pass runs (repeatable)
        #[arg(long, value_name = "RUSSIAN=ENGLISH")]
        add: Vec<String>,
        /// Report without writing
        #[arg(long)]
        dry_run: bool,
        /// Re-apply every cache entry, not only missing translations
        #[arg(long)]
        force: bool,
    },
    /// Diff a TOTAL budget against a planned or published one
    Reconcile {
        /// Identifier of the TOTAL budget, e.g. TOTAL-EXPENSE-2024-01
        total: String,
        /// Identifier of the budget to compare against, e.g. LAW-2024
        comparison: String,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database")]
    pub database: DatabaseConfig,

    #[serde(default = "default_data")]
    pub data: DataConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    /// Directory holding repaired source files.
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_translations_file")]
    pub translations_file: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_database() -> DatabaseConfig {
    DatabaseConfig {
        path: default_database_path(),
    }
}

fn default_database_path() -> String {
    "budgetdb.sqlite".to_string()
}

fn default_data() -> DataConfig {
    DataConfig {
        dir: default_data_dir(),
        translations_file: default_translations_file(),
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/clean")
}

fn default_translations_file() -> PathBuf {
    PathBuf::from("data/translations/dimension_translations.csv")
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: default_database(),
            data: default_data(),
            logging: default_logging(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(ref database) = cli.database {
            config.database.path = database.clone();
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let cli = CliArgs::parse_from(["budgetdb", "--config", "/no/such/file.toml", "rates", "r.csv"]);
        let config = Config::load(&cli);
        assert_eq!(config.database.path, "budgetdb.sqlite");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: Config = toml::from_str(
            r#"
[logging]
level = "debug"
json = true
"#,
        )
        .unwrap();
        assert_eq!(parsed.logging.level, "debug");
        assert!(parsed.logging.json);
        assert_eq!(parsed.database.path, "budgetdb.sqlite");
    }

    #[test]
    fn translate_accepts_repeated_cache_entries() {
        let cli = CliArgs::parse_from([
            "budgetdb",
            "translate",
            "--add",
            "Оборона=Defense",
            "--add",
            "Культура=Culture",
            "--dry-run",
        ]);
        let Command::Translate { add, dry_run, .. } = cli.command else {
            panic!("expected translate command");
        };
        assert_eq!(add, vec!["Оборона=Defense", "Культура=Culture"]);
        assert!(dry_run);
    }

    #[test]
    fn cli_overrides_win() {
        let cli = CliArgs::parse_from([
            "budgetdb",
            "--database",
            "/tmp/other.sqlite",
            "--log-level",
            "trace",
            "rates",
            "r.csv",
        ]);
        let config = Config::load(&cli);
        assert_eq!(config.database.path, "/tmp/other.sqlite");
        assert_eq!(config.logging.level, "trace");
    }
}
