//! Network access for the worker via reqwest.

use std::time::Duration;

use async_trait::async_trait;

use super::{CachedResponse, FetchRequest, Network};
use crate::types::{PerfError, PerfResult};

/// Fetches over HTTP. Non-2xx statuses are returned, not turned into errors.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new(timeout: Duration) -> PerfResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PerfError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> PerfResult<CachedResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| PerfError::Network(format!("bad method {}: {e}", request.method)))?;

        let response = self
            .client
            .request(method, &request.url)
            .send()
            .await
            .map_err(|e| PerfError::Network(format!("{}: {e}", request.url)))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| PerfError::Network(format!("{}: {e}", request.url)))?
            .to_vec();

        Ok(CachedResponse {
            status,
            content_type,
            body,
        })
    }
}
