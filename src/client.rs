//! HTTP client for the extraction API.
//!
//! `ExtractionClient` is the seam between the decision core and the network:
//! one call is one attempt for one query. `HttpExtractionClient` implements it
//! with `reqwest`, mapping HTTP outcomes onto the error taxonomy (request-level
//! rejections, retryable throttling/server errors, network failures).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{Level, event, info, trace};
use url::Url;

use crate::config::AutoExtractConfig;
use crate::error::{AutoExtractError, Result};
use crate::query::ExtractionRequest;

pub const USER_AGENT: &str = concat!("spider-autoextract/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 2000;

/// Per-attempt options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the client's default timeout for this attempt.
    pub timeout: Option<Duration>,
    /// Extra headers sent along with the API call.
    pub headers: HeaderMap,
}

/// One attempt against the extraction API.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Sends `request` and returns the API result object for it.
    async fn extract(&self, request: &ExtractionRequest, options: &CallOptions) -> Result<Value>;
}

/// `ExtractionClient` talking to the API over HTTP.
///
/// Each call POSTs a one-query batch with basic auth (the API key as user, no
/// password) and returns the first result of the list the API answers with.
pub struct HttpExtractionClient {
    client: Client,
    api_url: Url,
    api_key: String,
    error_log_level: Level,
}

impl HttpExtractionClient {
    /// Builds the client for `config.api_url`, with `config.timeout` as the
    /// default per-call timeout.
    pub fn new(config: &AutoExtractConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AutoExtractError::ConfigurationError(e.to_string()))?;
        info!("Initializing HttpExtractionClient for {}", config.api_url);
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            error_log_level: config.response_error_log_level,
        })
    }

    fn log_response_error(&self, status: StatusCode, headers: &HeaderMap, body: &str) {
        let details = format!(
            "status={} headers={:?} content={}",
            status,
            headers,
            truncate_body(body)
        );
        let level = self.error_log_level;
        if level == Level::ERROR {
            event!(Level::ERROR, "AutoExtract response {}", details);
        } else if level == Level::WARN {
            event!(Level::WARN, "AutoExtract response {}", details);
        } else if level == Level::INFO {
            event!(Level::INFO, "AutoExtract response {}", details);
        } else if level == Level::DEBUG {
            event!(Level::DEBUG, "AutoExtract response {}", details);
        } else {
            event!(Level::TRACE, "AutoExtract response {}", details);
        }
    }
}

#[async_trait]
impl ExtractionClient for HttpExtractionClient {
    async fn extract(&self, request: &ExtractionRequest, options: &CallOptions) -> Result<Value> {
        let query = request.to_query();
        trace!("Sending AutoExtract query: {}", query);

        let mut builder = self
            .client
            .post(self.api_url.clone())
            .basic_auth(&self.api_key, Some(""))
            .headers(options.headers.clone())
            .json(&[query]);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            self.log_response_error(status, &headers, &body);
            return Err(AutoExtractError::ServerError {
                status: status.as_u16(),
                message: truncate_body(&body),
            });
        }

        if !status.is_success() {
            self.log_response_error(status, &headers, &body);
            let details: Option<Value> = serde_json::from_str(&body).ok();
            let error_type = details
                .as_ref()
                .and_then(|d| d.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let message = details
                .as_ref()
                .and_then(|d| d.get("title"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| truncate_body(&body));
            return Err(AutoExtractError::RequestError {
                status: status.as_u16(),
                error_type,
                message,
            });
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|_| {
            self.log_response_error(status, &headers, &body);
            AutoExtractError::InvalidResponse(format!(
                "Cannot parse JSON response from AutoExtract for {}: {}",
                request.url(),
                truncate_body(&body)
            ))
        })?;

        match parsed {
            Value::Array(mut results) if !results.is_empty() => Ok(results.swap_remove(0)),
            other => {
                self.log_response_error(status, &headers, &body);
                Err(AutoExtractError::InvalidResponse(format!(
                    "Received invalid response from AutoExtract for {}: {}",
                    request.url(),
                    other
                )))
            }
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let half = MAX_ERROR_BODY / 2;
    let head: String = body.chars().take(half).collect();
    let tail: String = body
        .chars()
        .rev()
        .take(half)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{head} [...] {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_type::PageType;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpExtractionClient {
        let config = AutoExtractConfig::builder()
            .api_key("apikey")
            .api_url(format!("{}/v1/extract", server.uri()))
            .build_with_env(|_| None)
            .unwrap();
        HttpExtractionClient::new(&config).unwrap()
    }

    fn article() -> ExtractionRequest {
        let url = Url::parse("http://quotes.toscrape.com/").unwrap();
        ExtractionRequest::new(url, PageType::Article)
    }

    #[tokio::test]
    async fn sends_query_and_returns_first_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/extract"))
            // "apikey:" in base64
            .and(header("authorization", "Basic YXBpa2V5Og=="))
            .and(header_exists("user-agent"))
            .and(body_json(json!([
                {"url": "http://quotes.toscrape.com/", "pageType": "article"}
            ])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"query": {}, "article": {"headline": "Quotes"}}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server)
            .extract(&article(), &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result["article"]["headline"], json!("Quotes"));
    }

    #[tokio::test]
    async fn extra_headers_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-crawlera-profile", "desktop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"query": {}}])))
            .expect(1)
            .mount(&server)
            .await;

        let mut options = CallOptions::default();
        options
            .headers
            .insert("x-crawlera-profile", "desktop".parse().unwrap());
        client_for(&server).extract(&article(), &options).await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_is_a_request_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "title": "No authentication token provided",
                "type": "http://errors.xod.scrapinghub.com/unauthorized.html"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .extract(&article(), &CallOptions::default())
            .await
            .unwrap_err();
        match err {
            AutoExtractError::RequestError { status, error_type, message } => {
                assert_eq!(status, 401);
                assert_eq!(
                    error_type.as_deref(),
                    Some("http://errors.xod.scrapinghub.com/unauthorized.html")
                );
                assert_eq!(message, "No authentication token provided");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn throttling_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .extract(&article(), &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AutoExtractError::ServerError { status: 429, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn non_list_body_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"oops": true})))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .extract(&article(), &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AutoExtractError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn attempt_timeout_is_a_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{}]))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let options = CallOptions {
            timeout: Some(Duration::from_millis(50)),
            ..CallOptions::default()
        };
        let err = client_for(&server).extract(&article(), &options).await.unwrap_err();
        assert!(matches!(err, AutoExtractError::Network { is_timeout: true, .. }));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = format!("{}{}", "a".repeat(1500), "b".repeat(1500));
        let truncated = truncate_body(&body);
        assert!(truncated.starts_with(&"a".repeat(1000)));
        assert!(truncated.ends_with(&"b".repeat(1000)));
        assert!(truncated.contains(" [...] "));
        assert_eq!(truncate_body("short"), "short");
    }
}
