use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier of one tracked stock.
pub type Symbol = String;

/// Whether a result still holds extracted page content or has been
/// through the normalization stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Raw,
    Normalized,
}

/// Identity of a result inside the merge store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub symbol: Symbol,
    pub indicator: String,
}

impl ItemKey {
    pub fn new(symbol: impl Into<Symbol>, indicator: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            indicator: indicator.into(),
        }
    }
}

/// One indicator dataset extracted for one symbol.
///
/// The wire format is camelCase. Items nested under a symbol in a poll
/// response may omit `symbol`; the merge store fills it in from the key.
///
/// # Fields
/// * `symbol`: The stock the data belongs to
/// * `indicator_name`: Indicator family, e.g. "valuation" or "technicals"
/// * `success`: Whether extraction (or normalization) succeeded
/// * `content_kind`: Raw extracted content or normalized structured data
/// * `payload`: The content itself; raw HTML arrives as a JSON string
/// * `error`: Failure description when `success` is false
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    #[serde(default)]
    pub symbol: Symbol,
    pub indicator_name: String,
    pub success: bool,
    pub content_kind: ContentKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultItem {
    /// A successful extraction result that has not been normalized yet.
    pub fn raw(symbol: impl Into<Symbol>, indicator: impl Into<String>, payload: Value) -> Self {
        Self {
            symbol: symbol.into(),
            indicator_name: indicator.into(),
            success: true,
            content_kind: ContentKind::Raw,
            payload,
            error: None,
        }
    }

    /// A structured result produced by the normalization service.
    pub fn normalized(
        symbol: impl Into<Symbol>,
        indicator: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            indicator_name: indicator.into(),
            success: true,
            content_kind: ContentKind::Normalized,
            payload,
            error: None,
        }
    }

    /// A terminal normalization failure.
    ///
    /// Stored as `normalized` so the item is never picked up for
    /// normalization again and a display layer can render the failure.
    pub fn normalization_failed(
        symbol: impl Into<Symbol>,
        indicator: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            symbol: symbol.into(),
            indicator_name: indicator.into(),
            success: false,
            content_kind: ContentKind::Normalized,
            payload: serde_json::json!({ "error": message }),
            error: Some(message),
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.symbol.clone(), self.indicator_name.clone())
    }

    pub fn is_normalized(&self) -> bool {
        self.content_kind == ContentKind::Normalized
    }
}
