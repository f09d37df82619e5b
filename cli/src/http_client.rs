use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::CliError;

pub const API_PREFIX: &str = "/api/v1";

#[derive(Clone)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
    token: Option<String>,
    user_agent: String,
    retries: u32,
}

impl Client {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self> {
        Url::parse(base_url).context("Invalid base URL")?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            token,
            user_agent: format!("deployctl/{}", env!("CARGO_PKG_VERSION")),
            retries,
        })
    }

    /// `path` is relative to the API prefix unless it names `/health`.
    pub fn build_url(&self, path: &str) -> Result<Url> {
        let full = if path == "/health" {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}{}", self.base_url, API_PREFIX, path)
        };
        Url::parse(&full).with_context(|| format!("Failed to build URL from {}", full))
    }

    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        let bytes = self.send_json_bytes(method, path, headers, body).await?;
        print_bytes(&bytes)?;
        Ok(())
    }

    pub async fn send_json_bytes(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<u8>> {
        let url = self.build_url(path)?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut req = self.http.request(method.clone(), url.clone());
            req = req.header("user-agent", &self.user_agent);
            req = req.header("x-request-id", Uuid::new_v4().to_string());

            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            for (k, v) in headers.iter() {
                req = req.header(k, v);
            }
            if let Some(b) = &body {
                req = req.json(b);
            }

            debug!("HTTP {} {} (attempt {})", method, url, attempt);
            let resp = req.send().await.context("Request failed")?;
            let status = resp.status();

            if status.is_success() {
                let bytes = resp.bytes().await.context("Failed to read response")?;
                return Ok(bytes.to_vec());
            }

            if status == StatusCode::UNAUTHORIZED {
                return Err(CliError::Unauthorized.into());
            }

            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let bytes = resp.bytes().await.unwrap_or_default();

            if attempt <= self.retries && should_retry(&method, status) {
                tokio::time::sleep(retry_sleep(status, retry_after)).await;
                continue;
            }

            return Err(CliError::from_body(
                method.as_str(),
                url.as_str(),
                status.as_u16(),
                &bytes,
            )
            .into());
        }
    }

    pub async fn get_typed<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = self
            .send_json_bytes(Method::GET, path, HeaderMap::new(), None)
            .await?;
        serde_json::from_slice(&bytes).context("Unexpected response body")
    }

    pub async fn post_typed<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let bytes = self
            .send_json_bytes(Method::POST, path, HeaderMap::new(), Some(body))
            .await?;
        serde_json::from_slice(&bytes).context("Unexpected response body")
    }
}

/// 429 always; 5xx only for methods safe to repeat.
fn should_retry(method: &Method, status: StatusCode) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    if status.is_server_error() {
        return matches!(*method, Method::GET | Method::DELETE);
    }
    false
}

fn retry_sleep(status: StatusCode, retry_after: Option<u64>) -> Duration {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Duration::from_secs(retry_after.unwrap_or(1));
    }
    Duration::from_millis(300)
}

pub fn header_kv(k: &str, v: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(k.as_bytes()).context("Invalid header name")?;
    let value = HeaderValue::from_str(v).context("Invalid header value")?;
    Ok((name, value))
}

fn print_bytes(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        println!("{}", r#"{"success":true}"#);
        return Ok(());
    }
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(bytes) {
        println!("{}", serde_json::to_string_pretty(&v)?);
    } else {
        println!("{}", String::from_utf8_lossy(bytes));
    }
    Ok(())
}
