//! Transport seam between the worker and the origin server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use tracing::debug;

use super::{Request, Response};
use crate::error::{Result, WorkerError};

/// Anything that can turn a request into a response snapshot.
///
/// Non-2xx statuses are successful fetches; only transport failures are errors.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// `Network` backed by a shared `reqwest` client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                WorkerError::Unreachable(e.to_string())
            } else {
                WorkerError::Network(e)
            }
        })?;
        let status = response.status().as_u16();

        let headers = collect_headers(response.headers());
        let body = response.bytes().await?.to_vec();
        debug!(url = %request.url, status, bytes = body.len(), "Fetched from network");

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

/// Flatten response headers into one value per name. Repeated fields are
/// joined with ", " and bytes that are not UTF-8 are replaced, not dropped.
fn collect_headers(map: &HeaderMap) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes());
        headers
            .entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    headers
}
