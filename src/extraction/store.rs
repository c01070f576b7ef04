//! Per-symbol, per-indicator result table shared by the scheduler and the
//! enrichment dispatcher.
//!
//! Poll results go through [`MergeStore::merge`] and normalization results
//! through [`MergeStore::complete_enrichment`]. Each applies its whole
//! read-modify-write under one short lock and never holds it across an
//! `await`. A `watch` channel carries a version number so the
//! dispatcher can react to changes.

use crate::data::{html_content, ContentKind, ItemKey, ResultItem, Symbol};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Tally of what one `merge` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub replaced: usize,
    /// Raw items dropped because the key already holds normalized content.
    pub discarded: usize,
    /// Items identical to what was already stored.
    pub unchanged: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted + self.replaced > 0
    }
}

/// Raw page content waiting for normalization.
///
/// `generation` is the store generation the content was read at; a
/// normalization result is only written back if the symbol has not been
/// invalidated since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentCandidate {
    pub key: ItemKey,
    pub content: String,
    pub generation: u64,
}

#[derive(Default)]
struct Table {
    items: HashMap<Symbol, Vec<ResultItem>>,
    generation: u64,
    invalidated_at: HashMap<Symbol, u64>,
    cleared_at: u64,
}

impl Table {
    /// Whether content of `symbol` read at `generation` is still current.
    fn is_current(&self, symbol: &str, generation: u64) -> bool {
        let invalidated_at = self.invalidated_at.get(symbol).copied().unwrap_or(0);
        self.cleared_at <= generation && invalidated_at <= generation
    }
}

pub struct MergeStore {
    table: Mutex<Table>,
    version: watch::Sender<u64>,
}

impl Default for MergeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            table: Mutex::new(Table::default()),
            version,
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| {
            warn!("Merge store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn bump_version(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Receives the store version after every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Merges `incoming` results for `symbol`.
    ///
    /// For each item, keyed by indicator name within the symbol:
    /// - an absent key is inserted, keeping arrival order
    /// - a raw item never overwrites a normalized one; it is discarded
    /// - otherwise the stored item is replaced
    ///
    /// Each item's `symbol` field is set to `symbol`. Merging the same item
    /// twice leaves the store as merging it once.
    ///
    /// # Arguments
    /// * `symbol`: The stock the items belong to
    /// * `incoming`: Items from a poll response
    ///
    /// # Returns
    /// What the merge did; the version is bumped only if something changed
    pub fn merge(&self, symbol: &str, incoming: Vec<ResultItem>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        {
            let mut table = self.lock_table();
            let items = table.items.entry(symbol.to_string()).or_default();

            for mut item in incoming {
                item.symbol = symbol.to_string();
                let existing = items
                    .iter_mut()
                    .find(|existing| existing.indicator_name == item.indicator_name);

                match existing {
                    None => {
                        items.push(item);
                        outcome.inserted += 1;
                    }
                    Some(existing)
                        if existing.is_normalized() && item.content_kind == ContentKind::Raw =>
                    {
                        outcome.discarded += 1;
                    }
                    Some(existing) if *existing == item => {
                        outcome.unchanged += 1;
                    }
                    Some(existing) => {
                        *existing = item;
                        outcome.replaced += 1;
                    }
                }
            }

            if items.is_empty() {
                table.items.remove(symbol);
            }
        }

        if outcome.changed() {
            debug!(
                symbol,
                inserted = outcome.inserted,
                replaced = outcome.replaced,
                discarded = outcome.discarded,
                "Merged results"
            );
            self.bump_version();
        }
        outcome
    }

    /// Writes the normalization result for `candidate`.
    ///
    /// The write only happens while the key still holds the raw content the
    /// candidate was read from and the symbol has not been invalidated since.
    ///
    /// # Returns
    /// Whether `item` was stored
    pub fn complete_enrichment(&self, candidate: &EnrichmentCandidate, item: ResultItem) -> bool {
        let key = &candidate.key;
        let stored = {
            let mut table = self.lock_table();
            if !table.is_current(&key.symbol, candidate.generation) {
                false
            } else {
                let existing = table.items.get_mut(&key.symbol).and_then(|items| {
                    items
                        .iter_mut()
                        .find(|existing| existing.indicator_name == key.indicator)
                });
                match existing {
                    Some(existing)
                        if existing.content_kind == ContentKind::Raw
                            && html_content(&existing.payload) == Some(candidate.content.as_str()) =>
                    {
                        *existing = ResultItem {
                            symbol: key.symbol.clone(),
                            ..item
                        };
                        true
                    }
                    _ => false,
                }
            }
        };

        if stored {
            self.bump_version();
        } else {
            debug!(
                symbol = %key.symbol,
                indicator = %key.indicator,
                "Dropped normalization result for replaced content"
            );
        }
        stored
    }

    pub fn get(&self, key: &ItemKey) -> Option<ResultItem> {
        self.lock_table().items.get(&key.symbol).and_then(|items| {
            items
                .iter()
                .find(|item| item.indicator_name == key.indicator)
                .cloned()
        })
    }

    /// Items for one symbol, in arrival order.
    pub fn items(&self, symbol: &str) -> Vec<ResultItem> {
        self.lock_table()
            .items
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<Symbol, Vec<ResultItem>> {
        self.lock_table().items.clone()
    }

    pub fn symbol_count(&self) -> usize {
        self.lock_table().items.len()
    }

    pub fn item_count(&self) -> usize {
        self.lock_table().items.values().map(Vec::len).sum()
    }

    /// Successful raw items whose payload is HTML page content.
    pub fn enrichment_candidates(&self) -> Vec<EnrichmentCandidate> {
        let table = self.lock_table();
        let mut candidates = Vec::new();
        for (symbol, items) in table.items.iter() {
            for item in items {
                if !item.success || item.content_kind != ContentKind::Raw {
                    continue;
                }
                if let Some(content) = html_content(&item.payload) {
                    candidates.push(EnrichmentCandidate {
                        key: ItemKey::new(symbol.clone(), item.indicator_name.clone()),
                        content: content.to_string(),
                        generation: table.generation,
                    });
                }
            }
        }
        candidates
    }

    /// Drops every result for the given symbols. Normalizations already
    /// running for them will not write back.
    pub fn invalidate_symbols(&self, symbols: &[Symbol]) -> usize {
        let removed = {
            let mut table = self.lock_table();
            table.generation += 1;
            let generation = table.generation;
            let mut removed = 0;
            for symbol in symbols {
                table.invalidated_at.insert(symbol.clone(), generation);
                if table.items.remove(symbol.as_str()).is_some() {
                    removed += 1;
                }
            }
            removed
        };
        if removed > 0 {
            self.bump_version();
        }
        removed
    }

    pub fn clear(&self) {
        let had_entries = {
            let mut table = self.lock_table();
            table.generation += 1;
            table.cleared_at = table.generation;
            table.invalidated_at.clear();
            let had_entries = !table.items.is_empty();
            table.items.clear();
            had_entries
        };
        if had_entries {
            self.bump_version();
        }
    }
}
