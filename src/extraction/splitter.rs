use crate::data::Symbol;
use crate::error::{ExtractionError, Result};
use std::sync::Arc;

/// An immutable group of symbols submitted as one remote job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    symbols: Arc<[Symbol]>,
}

impl Batch {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols: symbols.into(),
        }
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Partitions `symbols` into consecutive batches of at most `batch_size`.
///
/// Batch `i` holds `symbols[i * batch_size..(i + 1) * batch_size]`, so the
/// concatenation of the batches is the input in order. An empty input
/// yields no batches.
///
/// # Errors
/// Returns `ExtractionError::InvalidConfig` if `batch_size` is zero
pub fn split(symbols: &[Symbol], batch_size: usize) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(ExtractionError::InvalidConfig(
            "batch size must be at least 1".to_string(),
        ));
    }

    Ok(symbols
        .chunks(batch_size)
        .map(|chunk| Batch::new(chunk.to_vec()))
        .collect())
}
