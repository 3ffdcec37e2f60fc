use thiserror::Error;
use time::Date;

use crate::storage::StorageBackend;

#[derive(Debug, Error)]
pub enum RateError {
    #[error("no conversion rate for {pair} on {on}")]
    NoApplicableRate { pair: String, on: Date },
    #[error("{matches} overlapping rate windows for {pair} on {on}; rate data is corrupt")]
    AmbiguousRate {
        pair: String,
        on: Date,
        matches: usize,
    },
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// Looks up the conversion rate valid for a currency pair at an instant.
///
/// Pair names are directional ("RUB_USD" converts RUB to USD); the resolver
/// never inverts a rate, callers wanting the reverse direction must ask for
/// the reverse pair. Overlapping windows are a data-integrity violation and
/// are surfaced, never resolved by picking one.
pub struct RateResolver<'a> {
    store: &'a dyn StorageBackend,
}

impl<'a> RateResolver<'a> {
    pub fn new(store: &'a dyn StorageBackend) -> Self {
        Self { store }
    }

    pub fn rate_at(&self, pair: &str, on: Date) -> Result<f64, RateError> {
        let mut windows = self.store.rate_windows_at(pair, on)?;
        match windows.len() {
            0 => Err(RateError::NoApplicableRate {
                pair: pair.to_string(),
                on,
            }),
            1 => Ok(windows.remove(0).rate),
            matches => Err(RateError::AmbiguousRate {
                pair: pair.to_string(),
                on,
                matches,
            }),
        }
    }

    /// Converts `value` along `pair` at the rate valid on `as_of`.
    pub fn convert(&self, value: f64, pair: &str, as_of: Date) -> Result<f64, RateError> {
        Ok(value * self.rate_at(pair, as_of)?)
    }
}
