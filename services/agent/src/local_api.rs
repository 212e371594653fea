//! Local API client: executes forwarded requests against the local HTTP API.
//!
//! `forward` is total: every request yields exactly one response with the
//! same request id. Transport failures, timeouts and bad method names become
//! the 500 `Agent Error` envelope.

use bridge_protocol::{ForwardedRequest, ForwardedResponse, NonJsonBody, ResponseData};
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LocalApiError {
    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("local API request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct LocalApiClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl LocalApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        LocalApiClient {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute `req` and normalize the answer. Never fails.
    pub async fn forward(&self, req: ForwardedRequest) -> ForwardedResponse {
        info!(
            request_id = %req.request_id,
            method = %req.method,
            path = %req.path,
            "forwarding api request"
        );

        let result = match tokio::time::timeout(self.timeout, self.execute(&req)).await {
            Ok(result) => result,
            Err(_) => Err(LocalApiError::Timeout(self.timeout)),
        };

        match result {
            Ok((status, data)) => {
                debug!(request_id = %req.request_id, status, "local API responded");
                ForwardedResponse {
                    request_id: req.request_id,
                    status,
                    data,
                }
            }
            Err(e) => {
                warn!(request_id = %req.request_id, error = %e, "error handling api request");
                ForwardedResponse::agent_error(req.request_id, e.to_string())
            }
        }
    }

    async fn execute(&self, req: &ForwardedRequest) -> Result<(u16, ResponseData), LocalApiError> {
        let method = Method::from_bytes(req.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| LocalApiError::InvalidMethod(req.method.clone()))?;
        let url = self.url_for(&req.path);

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .header(CONTENT_TYPE, "application/json");
        if carries_body(&method) {
            if let Some(body) = &req.body {
                builder = builder.json(body);
            }
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let text = response.text().await?;

        Ok((status, normalize_body(content_type.as_deref(), text)))
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

fn carries_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}

/// JSON when the content type says so and the text parses; the raw-text
/// envelope otherwise.
pub fn normalize_body(content_type: Option<&str>, text: String) -> ResponseData {
    match content_type {
        Some(ct) if ct.to_ascii_lowercase().contains("json") => {
            match serde_json::from_str(&text) {
                Ok(value) => ResponseData::Json(value),
                Err(e) => ResponseData::NonJson(NonJsonBody {
                    content: text,
                    content_type: ct.to_owned(),
                    is_non_json_response: true,
                    parse_error: Some(e.to_string()),
                }),
            }
        }
        other => ResponseData::NonJson(NonJsonBody {
            content: text,
            content_type: other.unwrap_or("text/plain").to_owned(),
            is_non_json_response: true,
            parse_error: None,
        }),
    }
}
