use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use url::Url;

use crate::config::StorageConfig;

use super::auth::{API_VERSION, SharedKey};

pub struct AzureBlobClient {
    http: reqwest::Client,
    endpoint: Url,
    credential: SharedKey,
}

impl AzureBlobClient {
    pub fn new(cfg: &StorageConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let endpoint = match &cfg.endpoint {
            Some(e) => e.clone(),
            None => format!("https://{}.blob.core.windows.net", cfg.account_name),
        };
        let endpoint =
            Url::parse(&endpoint).with_context(|| format!("Invalid storage endpoint: {endpoint}"))?;

        Ok(Self {
            http,
            endpoint,
            credential: SharedKey::new(&cfg.account_name, &cfg.access_key)?,
        })
    }

    /// URL of a blob, with each key segment percent-encoded.
    pub fn blob_url(&self, container: &str, key: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Storage endpoint cannot be a base URL: {}", self.endpoint))?
            .pop_if_empty()
            .push(container)
            .extend(key.split('/'));
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    pub fn request(&self, method: Method, url: Url) -> BlobRequest<'_> {
        BlobRequest {
            client: self,
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// A signed request that can be re-signed and re-sent on throttling.
pub struct BlobRequest<'a> {
    client: &'a AzureBlobClient,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl<'a> BlobRequest<'a> {
    pub fn header(mut self, key: &'static str, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("Invalid value for header {key}"))?;
        self.headers.insert(HeaderName::from_static(key), value);
        Ok(self)
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Send with Shared Key auth and retry on throttling (429/503).
    ///
    /// Successful responses and 404 are returned to the caller; anything else
    /// becomes an error carrying the service's `x-ms-error-code`.
    pub async fn send(self) -> Result<Response> {
        const MAX_RETRIES: u32 = 5;

        for attempt in 0..=MAX_RETRIES {
            let mut headers = self.headers.clone();
            let date = chrono::Utc::now()
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string();
            headers.insert("x-ms-date", HeaderValue::from_str(&date)?);
            headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));

            let content_length = self.body.as_ref().map_or(0, |b| b.len() as u64);
            let auth = self.client.credential.authorization(
                &self.method,
                &self.url,
                &headers,
                content_length,
            );
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&auth)?);

            let mut builder = self
                .client
                .http
                .request(self.method.clone(), self.url.clone())
                .headers(headers);
            if let Some(body) = &self.body {
                builder = builder.body(body.clone());
            }

            let resp = builder.send().await.context("HTTP request failed")?;

            match resp.status() {
                s if s.is_success() || s == StatusCode::NOT_FOUND => return Ok(resp),

                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
                    if attempt < MAX_RETRIES =>
                {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(2);
                    let wait = Duration::from_secs(retry_after) + jitter();
                    tracing::warn!(
                        status = %resp.status(),
                        retry_after,
                        attempt = attempt + 1,
                        "storage throttled, waiting {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                }

                status => {
                    let code = error_code(&resp);
                    let body = resp.text().await.unwrap_or_default();
                    anyhow::bail!("Azure Blob error ({status}, {code}): {body}");
                }
            }
        }

        anyhow::bail!("Storage throttled, exhausted {MAX_RETRIES} retries")
    }
}

pub fn request_id(resp: &Response) -> Option<String> {
    resp.headers()
        .get("x-ms-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

pub fn error_code(resp: &Response) -> String {
    resp.headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

fn jitter() -> Duration {
    let ms: u64 = rand::random::<u64>() % 1000;
    Duration::from_millis(ms)
}
