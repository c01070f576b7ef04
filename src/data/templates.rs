use crate::error::{ExtractionError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const DEFAULT_TEMPLATE: &str = "Extract every labelled figure from the HTML below into a flat JSON \
object. Use snake_case keys, numbers without units or thousands separators, and null for \
missing values. Respond with JSON only.";

const BUILT_IN: &[(&str, &str)] = &[
    (
        "valuation",
        "From the HTML valuation table, return JSON with keys pe_ratio, pb_ratio, \
         ev_to_ebitda, dividend_yield, market_cap and peer_median_pe. Numbers only, null \
         when absent. Respond with JSON only.",
    ),
    (
        "technicals",
        "From the HTML technical summary, return JSON with keys rsi_14, macd, macd_signal, \
         sma_50, sma_200, support_levels (array) and resistance_levels (array). Respond with \
         JSON only.",
    ),
    (
        "holdings",
        "From the HTML shareholding pattern, return JSON with an array `quarters`, each \
         entry holding period, promoters, fii, dii and public percentages. Respond with JSON \
         only.",
    ),
    (
        "deals",
        "From the HTML bulk and block deals table, return JSON with an array `deals`, each \
         entry holding date, client, side (buy|sell), quantity and price. Respond with JSON \
         only.",
    ),
    (
        "financials",
        "From the HTML financial statements, return JSON with an array `periods`, each \
         entry holding period, revenue, operating_profit, net_profit and eps. Respond with \
         JSON only.",
    ),
];

#[derive(Debug, Deserialize)]
struct TemplateFile {
    default: Option<String>,
    #[serde(flatten)]
    indicators: HashMap<String, String>,
}

/// Per-indicator transformation templates for the normalization service.
///
/// Lookups are case-insensitive and fall back to a generic template for
/// indicators without a dedicated one.
#[derive(Debug, Clone)]
pub struct TemplateBook {
    default: String,
    templates: HashMap<String, String>,
}

impl Default for TemplateBook {
    fn default() -> Self {
        Self {
            default: DEFAULT_TEMPLATE.to_string(),
            templates: BUILT_IN
                .iter()
                .map(|(name, template)| (name.to_string(), template.to_string()))
                .collect(),
        }
    }
}

impl TemplateBook {
    pub fn template_for(&self, indicator: &str) -> &str {
        self.templates
            .get(&indicator.to_lowercase())
            .map(String::as_str)
            .unwrap_or(&self.default)
    }

    pub fn insert(&mut self, indicator: &str, template: impl Into<String>) {
        self.templates
            .insert(indicator.to_lowercase(), template.into());
    }

    /// Applies overrides from TOML text on top of the built-in templates.
    ///
    /// The document is a flat table of `indicator = "template"` entries; a
    /// `default` key replaces the fallback template.
    ///
    /// # Errors
    /// Returns `ExtractionError::Parse` if the document is not such a table
    pub fn with_overrides(mut self, toml_text: &str) -> Result<Self> {
        let file: TemplateFile =
            toml::from_str(toml_text).map_err(|e| ExtractionError::Parse(e.to_string()))?;

        if let Some(default) = file.default {
            self.default = default;
        }
        for (indicator, template) in file.indicators {
            self.insert(&indicator, template);
        }
        Ok(self)
    }

    /// Loads the built-in templates plus overrides from a TOML file.
    ///
    /// # Errors
    /// Returns `ExtractionError::InvalidConfig` if the file cannot be read and
    /// `ExtractionError::Parse` if it is malformed
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExtractionError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::default().with_overrides(&text)
    }
}
