//! Second-stage normalization of raw HTML results.
//!
//! The dispatcher watches the merge store. Each time it changes, every
//! successful raw HTML item that is not already being normalized gets one
//! task. A key stays in the in-progress set until its task ends, whatever
//! the outcome, so a key never has two normalizations in flight.

use super::store::{EnrichmentCandidate, MergeStore};
use crate::data::{parse_normalized, ItemKey, Normalizer, ResultItem, TemplateBook};
use crate::error::ExtractionError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Shared {
    store: Arc<MergeStore>,
    normalizer: Arc<dyn Normalizer>,
    templates: TemplateBook,
    in_progress: Mutex<HashSet<ItemKey>>,
    in_flight: watch::Sender<usize>,
    permits: Option<Arc<Semaphore>>,
}

impl Shared {
    fn lock_in_progress(&self) -> MutexGuard<'_, HashSet<ItemKey>> {
        self.in_progress.lock().unwrap_or_else(|poisoned| {
            warn!("Enrichment in-progress mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Removes its key from the in-progress set when dropped.
struct InProgressGuard {
    shared: Arc<Shared>,
    key: ItemKey,
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        let mut in_progress = self.shared.lock_in_progress();
        in_progress.remove(&self.key);
        // Published under the lock so counts from racing drops stay ordered
        self.shared.in_flight.send_replace(in_progress.len());
    }
}

/// Dispatches normalization tasks for raw HTML results in a merge store.
#[derive(Clone)]
pub struct EnrichmentDispatcher {
    shared: Arc<Shared>,
}

impl EnrichmentDispatcher {
    /// Creates a dispatcher writing back into `store`.
    ///
    /// # Arguments
    /// * `store`: The merge store to scan and write normalized results to
    /// * `normalizer`: The normalization service
    /// * `templates`: Per-indicator transformation templates
    /// * `limit`: Optional bound on concurrent normalization calls
    pub fn new(
        store: Arc<MergeStore>,
        normalizer: Arc<dyn Normalizer>,
        templates: TemplateBook,
        limit: Option<usize>,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                store,
                normalizer,
                templates,
                in_progress: Mutex::new(HashSet::new()),
                in_flight,
                permits: limit.map(|n| Arc::new(Semaphore::new(n))),
            }),
        }
    }

    /// Number of keys with a normalization in flight.
    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.borrow()
    }

    pub fn subscribe_in_flight(&self) -> watch::Receiver<usize> {
        self.shared.in_flight.subscribe()
    }

    pub fn is_in_progress(&self, key: &ItemKey) -> bool {
        self.shared.lock_in_progress().contains(key)
    }

    fn claim(&self, key: &ItemKey) -> Option<InProgressGuard> {
        let mut in_progress = self.shared.lock_in_progress();
        if !in_progress.insert(key.clone()) {
            return None;
        }
        self.shared.in_flight.send_replace(in_progress.len());
        Some(InProgressGuard {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
        })
    }

    /// Starts a normalization task for every eligible item not already in
    /// progress.
    ///
    /// # Returns
    /// The number of tasks started
    pub fn dispatch_pending(&self) -> usize {
        let mut started = 0;
        for candidate in self.shared.store.enrichment_candidates() {
            let Some(guard) = self.claim(&candidate.key) else {
                continue;
            };
            // A task that finished after the scan may already have written
            // the normalized item
            let still_raw = self
                .shared
                .store
                .get(&candidate.key)
                .map(|item| !item.is_normalized())
                .unwrap_or(false);
            if !still_raw {
                continue;
            }
            tokio::spawn(enrich(self.clone(), candidate, guard));
            started += 1;
        }
        if started > 0 {
            debug!(started, in_flight = self.in_flight(), "Dispatched normalization tasks");
        }
        started
    }

    /// Runs the dispatcher until the returned task is aborted: one pass now,
    /// then one pass per store change.
    pub fn spawn(&self) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let mut changes = self.shared.store.subscribe();
        tokio::spawn(async move {
            dispatcher.dispatch_pending();
            while changes.changed().await.is_ok() {
                dispatcher.dispatch_pending();
            }
        })
    }
}

async fn enrich(dispatcher: EnrichmentDispatcher, candidate: EnrichmentCandidate, guard: InProgressGuard) {
    let shared = Arc::clone(&dispatcher.shared);
    let _permit = match &shared.permits {
        Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
        None => None,
    };

    let key = &candidate.key;
    let template = shared.templates.template_for(&key.indicator);

    let outcome = match shared
        .normalizer
        .normalize(&candidate.content, template, &key.indicator)
        .await
    {
        Ok(output) => parse_normalized(&output),
        Err(err) => Err(err),
    }
    .map_err(|err| ExtractionError::Normalization {
        symbol: key.symbol.clone(),
        indicator: key.indicator.clone(),
        message: err.to_string(),
    });

    let item = match outcome {
        Ok(value) => {
            info!(symbol = %key.symbol, indicator = %key.indicator, "Normalized result");
            ResultItem::normalized(key.symbol.clone(), key.indicator.clone(), value)
        }
        Err(err) => {
            warn!(
                symbol = %key.symbol,
                indicator = %key.indicator,
                error = %err,
                "Normalization failed"
            );
            ResultItem::normalization_failed(key.symbol.clone(), key.indicator.clone(), err.to_string())
        }
    };

    if !shared.store.complete_enrichment(&candidate, item) {
        // Content changed under the task; newer raw content of this key was
        // skipped while it was claimed
        drop(guard);
        dispatcher.dispatch_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw_html, FakeNormalizer};
    use serde_json::json;
    use std::time::Duration;

    fn dispatcher(
        normalizer: Arc<FakeNormalizer>,
        limit: Option<usize>,
    ) -> (Arc<MergeStore>, EnrichmentDispatcher) {
        let store = Arc::new(MergeStore::new());
        let dispatcher =
            EnrichmentDispatcher::new(store.clone(), normalizer, TemplateBook::default(), limit);
        (store, dispatcher)
    }

    async fn drain(dispatcher: &EnrichmentDispatcher) {
        let mut in_flight = dispatcher.subscribe_in_flight();
        tokio::time::timeout(Duration::from_secs(60), async {
            while *in_flight.borrow_and_update() > 0 {
                let _ = in_flight.changed().await;
            }
        })
        .await
        .expect("normalization tasks did not finish");
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_html_is_normalized() {
        let normalizer = Arc::new(FakeNormalizer::instant());
        let (store, dispatcher) = dispatcher(normalizer.clone(), None);
        store.merge("INFY", vec![ResultItem::raw("", "valuation", raw_html("INFY", "valuation"))]);

        assert_eq!(dispatcher.dispatch_pending(), 1);
        drain(&dispatcher).await;

        let item = store.get(&ItemKey::new("INFY", "valuation")).unwrap();
        assert!(item.is_normalized());
        assert!(item.success);
        assert_eq!(item.payload["indicator"], "valuation");
        assert!(store.enrichment_candidates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_recorded_and_not_retried() {
        let normalizer = Arc::new(FakeNormalizer::instant());
        let (store, dispatcher) = dispatcher(normalizer.clone(), None);
        store.merge("TCS", vec![ResultItem::raw("", "deals", json!("<p>broken</p>"))]);

        dispatcher.dispatch_pending();
        drain(&dispatcher).await;
        assert_eq!(dispatcher.dispatch_pending(), 0);

        let item = store.get(&ItemKey::new("TCS", "deals")).unwrap();
        assert!(item.is_normalized());
        assert!(!item.success);
        assert!(item.error.unwrap().contains("upstream model error"));
        assert_eq!(normalizer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_output_is_a_failure() {
        struct Chatty;

        #[async_trait::async_trait]
        impl Normalizer for Chatty {
            async fn normalize(
                &self,
                _content: &str,
                _template: &str,
                _indicator: &str,
            ) -> crate::error::Result<String> {
                Ok("Here is the table you asked for.".to_string())
            }
        }

        let store = Arc::new(MergeStore::new());
        let dispatcher =
            EnrichmentDispatcher::new(store.clone(), Arc::new(Chatty), TemplateBook::default(), None);
        store.merge("A", vec![ResultItem::raw("", "holdings", json!("<table/>"))]);

        dispatcher.dispatch_pending();
        drain(&dispatcher).await;

        let item = store.get(&ItemKey::new("A", "holdings")).unwrap();
        assert!(item.is_normalized());
        assert!(!item.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_task_per_key() {
        let normalizer = Arc::new(FakeNormalizer::new(Duration::from_millis(500)));
        let (store, dispatcher) = dispatcher(normalizer.clone(), None);
        let key = ItemKey::new("X", "PE");

        for round in 0..5 {
            // Redelivered raw content from later polls
            store.merge(
                "X",
                vec![ResultItem::raw("", "PE", raw_html("X", "PE"))],
            );
            let started = dispatcher.dispatch_pending();
            assert_eq!(started, usize::from(round == 0));
            assert!(dispatcher.is_in_progress(&key));
        }

        drain(&dispatcher).await;
        assert_eq!(normalizer.calls(), 1);
        assert_eq!(normalizer.peak_per_key(), 1);
        assert!(!dispatcher.is_in_progress(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_for_invalidated_content_is_dropped_and_redone() {
        let normalizer = Arc::new(FakeNormalizer::new(Duration::from_secs(5)));
        let (store, dispatcher) = dispatcher(normalizer.clone(), None);
        let key = ItemKey::new("X", "valuation");
        let raw = ResultItem::raw("", "valuation", raw_html("X", "valuation"));

        store.merge("X", vec![raw.clone()]);
        assert_eq!(dispatcher.dispatch_pending(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;

        store.invalidate_symbols(&["X".to_string()]);
        store.merge("X", vec![raw]);
        assert_eq!(dispatcher.dispatch_pending(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!store.get(&key).unwrap().is_normalized());
        assert!(dispatcher.is_in_progress(&key));

        drain(&dispatcher).await;
        assert_eq!(normalizer.calls(), 2);
        assert!(store.get(&key).unwrap().is_normalized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_bounds_concurrent_normalizations() {
        let normalizer = Arc::new(FakeNormalizer::new(Duration::from_millis(100)));
        let (store, dispatcher) = dispatcher(normalizer.clone(), Some(2));
        for symbol in ["A", "B", "C", "D", "E"] {
            store.merge(symbol, vec![ResultItem::raw("", "technicals", raw_html(symbol, "technicals"))]);
        }

        assert_eq!(dispatcher.dispatch_pending(), 5);
        assert_eq!(dispatcher.in_flight(), 5);
        drain(&dispatcher).await;

        assert_eq!(normalizer.calls(), 5);
        assert_eq!(normalizer.peak_active(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_dispatcher_reacts_to_merges() {
        let normalizer = Arc::new(FakeNormalizer::instant());
        let (store, dispatcher) = dispatcher(normalizer.clone(), None);
        let task = dispatcher.spawn();

        store.merge("WIPRO", vec![ResultItem::raw("", "financials", raw_html("WIPRO", "financials"))]);

        let key = ItemKey::new("WIPRO", "financials");
        tokio::time::timeout(Duration::from_secs(60), async {
            while !store.get(&key).map(|item| item.is_normalized()).unwrap_or(false) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dispatcher never normalized the item");

        task.abort();
        assert_eq!(normalizer.calls(), 1);
    }
}
