//! Extraction requests and their results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::page_type::PageType;

/// One query to the extraction API. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    url: Url,
    page_type: PageType,
    extra: BTreeMap<String, Value>,
    full_html: bool,
}

impl ExtractionRequest {
    pub fn new(url: Url, page_type: PageType) -> Self {
        Self {
            url,
            page_type,
            extra: BTreeMap::new(),
            full_html: false,
        }
    }

    /// Adds extra query parameters. `url` and `pageType` can not be overridden.
    pub fn with_extra(mut self, extra: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.extra.extend(extra);
        self
    }

    /// Asks the API to also return the page html.
    pub fn with_full_html(mut self, full_html: bool) -> Self {
        self.full_html = full_html;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn extra(&self) -> &BTreeMap<String, Value> {
        &self.extra
    }

    pub fn full_html(&self) -> bool {
        self.full_html
    }

    /// Renders the query object sent to the API.
    pub fn to_query(&self) -> Value {
        let mut query = Map::new();
        for (key, value) in &self.extra {
            query.insert(key.clone(), value.clone());
        }
        query.insert("url".to_string(), Value::String(self.url.to_string()));
        query.insert(
            "pageType".to_string(),
            Value::String(self.page_type.as_str().to_string()),
        );
        if self.full_html {
            query.insert("fullHtml".to_string(), Value::Bool(true));
        }
        Value::Object(query)
    }
}

/// Structured data extracted for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub page_type: PageType,
    /// Document found under the page type key, an empty object when missing.
    pub payload: Value,
    pub raw_html: Option<String>,
    /// The query as echoed back by the API, or as sent when absent.
    pub query: Value,
}

impl ExtractionResult {
    /// Builds the result from one element of the API response array.
    pub fn from_api_result(request: &ExtractionRequest, mut result: Value) -> Self {
        let page_type = request.page_type();
        let payload = result
            .get_mut(page_type.as_str())
            .map(Value::take)
            .filter(|value| !value.is_null())
            .unwrap_or_else(|| Value::Object(Map::new()));
        let raw_html = result
            .get("html")
            .and_then(Value::as_str)
            .map(str::to_string);
        let query = result
            .get_mut("query")
            .map(Value::take)
            .unwrap_or_else(|| request.to_query());

        Self {
            page_type,
            payload,
            raw_html,
            query,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn article(url: &str) -> ExtractionRequest {
        ExtractionRequest::new(Url::parse(url).unwrap(), PageType::Article)
    }

    #[test]
    fn query_keeps_url_and_page_type_authoritative() {
        let request = article("https://example.com/a").with_extra([
            ("url".to_string(), json!("https://evil.example")),
            ("articleBodyRaw".to_string(), json!(false)),
        ]);
        assert_eq!(
            request.to_query(),
            json!({
                "articleBodyRaw": false,
                "pageType": "article",
                "url": "https://example.com/a",
            })
        );
    }

    #[test]
    fn full_html_is_part_of_the_query() {
        let query = article("https://example.com/a").with_full_html(true).to_query();
        assert_eq!(query["fullHtml"], json!(true));
    }

    #[test]
    fn result_takes_payload_and_html() {
        let request = article("https://example.com/a");
        let result = ExtractionResult::from_api_result(
            &request,
            json!({
                "query": {"id": "1", "userQuery": {"url": "https://example.com/a"}},
                "article": {"headline": "Hi"},
                "html": "<html></html>",
            }),
        );
        assert_eq!(result.payload, json!({"headline": "Hi"}));
        assert_eq!(result.raw_html.as_deref(), Some("<html></html>"));
        assert_eq!(result.query["id"], json!("1"));
    }

    #[test]
    fn missing_payload_becomes_empty_object() {
        let request = article("https://example.com/a");
        let result = ExtractionResult::from_api_result(&request, json!({"article": null}));
        assert_eq!(result.payload, json!({}));
        assert_eq!(result.raw_html, None);
        assert_eq!(result.query, request.to_query());
    }
}
