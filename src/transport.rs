use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Raw exchange result. `url` is the final URL after redirects.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub body: String,
}

impl HttpResponse {
    /// Body as JSON, failing on anything but a 200 carrying valid JSON.
    pub fn json(&self) -> Result<Value> {
        if self.status != 200 {
            return Err(Error::MalformedResponse(format!(
                "status {} from {}",
                self.status, self.url
            )));
        }
        serde_json::from_str(&self.body).map_err(|e| {
            Error::MalformedResponse(format!("invalid JSON from {}: {e}", self.url))
        })
    }
}

/// Request/response client the engine talks through. The session cookie is
/// the implementation's business; `reset` drops it.
pub trait Transport: Send + Sync + 'static {
    fn get(&self, url: &str, timeout: Duration) -> impl Future<Output = Result<HttpResponse>> + Send;

    fn post(
        &self,
        url: &str,
        timeout: Duration,
        body: &Value,
    ) -> impl Future<Output = Result<HttpResponse>> + Send;

    fn reset(&self);
}

/// `reqwest` transport with a cookie store carrying the login session.
pub struct HttpTransport {
    client: RwLock<reqwest::Client>,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: RwLock::new(Self::build_client()?),
        })
    }

    fn build_client() -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder().cookie_store(true).build()?)
    }

    fn client(&self) -> reqwest::Client {
        match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn finish(resp: reqwest::Response) -> Result<HttpResponse> {
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let body = resp.text().await?;
        trace!(status, url = %url, len = body.len(), "response");
        Ok(HttpResponse { status, url, body })
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse> {
        debug!(url = %url, "GET");
        let resp = self.client().get(url).timeout(timeout).send().await?;
        Self::finish(resp).await
    }

    async fn post(&self, url: &str, timeout: Duration, body: &Value) -> Result<HttpResponse> {
        debug!(url = %url, "POST");
        let resp = self
            .client()
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        Self::finish(resp).await
    }

    fn reset(&self) {
        match Self::build_client() {
            Ok(fresh) => {
                let mut guard = match self.client.write() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *guard = fresh;
                debug!("HTTP session reset");
            }
            Err(e) => tracing::warn!("could not rebuild HTTP client: {e}"),
        }
    }
}

/// Source of fetch and submission timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
