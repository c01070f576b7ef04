use crate::error::{ExtractionError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::env;

/// Second-stage service that turns raw extracted content into structured data.
#[async_trait]
pub trait Normalizer: Send + Sync {
    /// Transforms `content` according to `template`.
    ///
    /// Returns the service's output as a JSON document in text form.
    async fn normalize(&self, content: &str, template: &str, indicator: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NormalizeRequest<'a> {
    content: &'a str,
    template: &'a str,
    indicator_name: &'a str,
}

/// HTTP client for the normalization service (`POST {base}/normalize`).
pub struct HttpNormalizer {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpNormalizer {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Creates a client from `NORMALIZER_API_URL` and `NORMALIZER_API_KEY`.
    ///
    /// # Errors
    /// Returns `ExtractionError::InvalidConfig` if either variable is not set
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("NORMALIZER_API_URL").map_err(|_| {
            ExtractionError::InvalidConfig("NORMALIZER_API_URL must be set".to_string())
        })?;
        let api_key = env::var("NORMALIZER_API_KEY").map_err(|_| {
            ExtractionError::InvalidConfig("NORMALIZER_API_KEY must be set".to_string())
        })?;
        Ok(Self::new(base_url, api_key))
    }
}

#[async_trait]
impl Normalizer for HttpNormalizer {
    async fn normalize(&self, content: &str, template: &str, indicator: &str) -> Result<String> {
        let url = format!("{}/normalize", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&NormalizeRequest {
                content,
                template,
                indicator_name: indicator,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ExtractionError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(body)
    }
}

/// Returns the payload as HTML text if it is extracted page content.
///
/// Raw payloads arrive as JSON strings; page content is recognised by its
/// leading tag.
pub fn html_content(payload: &Value) -> Option<&str> {
    payload
        .as_str()
        .filter(|text| text.trim_start().starts_with('<'))
}

/// Parses the normalization service's output into structured data.
///
/// Model-backed services often wrap the document in a Markdown code fence,
/// which is stripped before parsing.
///
/// # Errors
/// Returns `ExtractionError::Parse` for empty or malformed output
pub fn parse_normalized(output: &str) -> Result<Value> {
    let trimmed = strip_code_fence(output.trim());
    if trimmed.is_empty() {
        return Err(ExtractionError::Parse(
            "normalization service returned no content".to_string(),
        ));
    }

    Ok(serde_json::from_str(trimmed)?)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") on the opening fence line
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_html_detection() {
        assert!(html_content(&json!("<html><body>PE 21.4</body></html>")).is_some());
        assert!(html_content(&json!("  \n<table></table>")).is_some());
        assert!(html_content(&json!("PE 21.4")).is_none());
        assert!(html_content(&json!({ "pe": 21.4 })).is_none());
        assert!(html_content(&Value::Null).is_none());
    }

    #[test]
    fn test_parse_plain_json() {
        let value = parse_normalized(r#"{"pe": 21.4, "pb": 3.1}"#).unwrap();
        assert_eq!(value["pe"], 21.4);
    }

    #[test]
    fn test_parse_fenced_json() {
        let output = "```json\n{\"rsi\": 61.2}\n```";
        let value = parse_normalized(output).unwrap();
        assert_eq!(value["rsi"], 61.2);
    }

    #[test]
    fn test_parse_rejects_empty_and_malformed_output() {
        assert!(matches!(
            parse_normalized("   "),
            Err(ExtractionError::Parse(_))
        ));
        assert!(matches!(
            parse_normalized("Sorry, I cannot help with that."),
            Err(ExtractionError::Parse(_))
        ));
    }
}
