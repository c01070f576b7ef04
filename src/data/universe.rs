use super::models::Symbol;
use crate::error::{ExtractionError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Source of the master list of trackable symbols.
#[async_trait]
pub trait UniverseSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Symbol>>;
}

/// Fetches the master list as a JSON array of strings.
pub struct HttpUniverseSource {
    url: String,
    client: reqwest::Client,
}

impl HttpUniverseSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Creates a source from `SYMBOL_UNIVERSE_URL`.
    ///
    /// # Errors
    /// Returns `ExtractionError::InvalidConfig` if the variable is not set
    pub fn from_env() -> Result<Self> {
        let url = env::var("SYMBOL_UNIVERSE_URL").map_err(|_| {
            ExtractionError::InvalidConfig("SYMBOL_UNIVERSE_URL must be set".to_string())
        })?;
        Ok(Self::new(url))
    }
}

#[async_trait]
impl UniverseSource for HttpUniverseSource {
    async fn load(&self) -> Result<Vec<Symbol>> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(response.json::<Vec<Symbol>>().await?)
    }
}

/// Lazily loaded, memoized master list of symbols.
///
/// The first call to [`SymbolUniverse::symbols`] loads the list; later calls
/// share the same `Arc`. Concurrent first callers wait on a single load.
/// [`SymbolUniverse::invalidate`] forces the next call to reload. Failed
/// loads are not cached.
pub struct SymbolUniverse {
    source: Arc<dyn UniverseSource>,
    cached: Mutex<Option<Arc<Vec<Symbol>>>>,
}

impl SymbolUniverse {
    pub fn new(source: Arc<dyn UniverseSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Returns the master list, loading it on first use.
    ///
    /// # Errors
    /// Propagates the source's error when a load is needed and fails
    pub async fn symbols(&self) -> Result<Arc<Vec<Symbol>>> {
        let mut cached = self.cached.lock().await;
        if let Some(symbols) = cached.as_ref() {
            return Ok(Arc::clone(symbols));
        }

        let mut symbols = self.source.load().await?;
        let mut seen = HashSet::new();
        symbols.retain(|symbol| seen.insert(symbol.clone()));
        info!(count = symbols.len(), "Loaded symbol universe");

        let symbols = Arc::new(symbols);
        *cached = Some(Arc::clone(&symbols));
        Ok(symbols)
    }

    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }

    pub async fn is_loaded(&self) -> bool {
        self.cached.lock().await.is_some()
    }
}
