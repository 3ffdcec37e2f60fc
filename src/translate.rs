//! Applies cached name translations to dimension rows.
//!
//! Translations live in a `name_russian,name_english` CSV maintained
//! outside the import flow. The pass looks up every untranslated dimension
//! name in the cache and writes the hits back to the store; names without
//! a cache entry are reported so the cache can be extended and the pass
//! re-run. Re-running with an unchanged cache is a no-op.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::storage::{StorageBackend, StorageError};

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Source-name to translated-name map, persisted as CSV sorted by source
/// name so diffs stay stable.
#[derive(Debug, Default)]
pub struct TranslationCache {
    entries: BTreeMap<String, String>,
}

impl TranslationCache {
    /// Loads the cache; a missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self, TranslateError> {
        let mut entries = BTreeMap::new();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no translation cache yet");
            return Ok(Self { entries });
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)?;
        for record in reader.records() {
            let record = record?;
            let (Some(source), Some(translated)) = (record.get(0), record.get(1)) else {
                continue;
            };
            let source = source.trim();
            let translated = translated.trim();
            if !source.is_empty() && !translated.is_empty() {
                entries.insert(source.to_string(), translated.to_string());
            }
        }
        tracing::info!(path = %path.display(), entries = entries.len(), "loaded translation cache");
        Ok(Self { entries })
    }

    pub fn save(&self, path: &Path) -> Result<(), TranslateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["name_russian", "name_english"])?;
        for (source, translated) in &self.entries {
            writer.write_record([source.as_str(), translated.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.entries.get(source).map(String::as_str)
    }

    pub fn insert(&mut self, source: impl Into<String>, translated: impl Into<String>) {
        self.entries.insert(source.into(), translated.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sources(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[derive(Debug, Default)]
pub struct TranslateOutcome {
    /// Distinct names a translation was applied to.
    pub applied: usize,
    /// Dimension rows updated (several rows can share one name).
    pub rows_updated: usize,
    /// Untranslated names with no cache entry.
    pub missing: Vec<String>,
}

/// Runs one translation pass. `force` re-applies every cache entry instead
/// of only filling gaps; `dry_run` reports without writing.
pub fn apply_translations(
    store: &dyn StorageBackend,
    cache: &TranslationCache,
    dry_run: bool,
    force: bool,
) -> Result<TranslateOutcome, TranslateError> {
    let mut outcome = TranslateOutcome::default();

    if force {
        for source in cache.sources() {
            let translated = cache.get(source).unwrap_or_default();
            if !dry_run {
                outcome.rows_updated += store.set_dimension_translation(source, translated)?;
            }
            outcome.applied += 1;
        }
    } else {
        for name in store.untranslated_dimension_names()? {
            match cache.get(&name) {
                Some(translated) => {
                    if !dry_run {
                        outcome.rows_updated += store.set_dimension_translation(&name, translated)?;
                    }
                    outcome.applied += 1;
                }
                None => outcome.missing.push(name),
            }
        }
    }

    tracing::info!(
        applied = outcome.applied,
        rows_updated = outcome.rows_updated,
        missing = outcome.missing.len(),
        dry_run,
        force,
        "translation pass finished"
    );
    Ok(outcome)
}
