//! Local proxy for replaying tunnelled requests

use burrow_shared::protocol::REQUEST_TIMEOUT;
use burrow_shared::{Error, Headers, RequestEnvelope, ResponseEnvelope, Result};
use reqwest::{redirect, Method};
use std::time::Duration;
use tracing::{info, warn};

/// The service on this machine that tunnelled requests are replayed against
#[derive(Clone)]
pub struct LocalService {
    host: String,
    port: u16,
    timeout: Duration,
    client: reqwest::Client,
}

impl LocalService {
    pub fn new(port: u16) -> Result<Self> {
        Self::with_host("localhost", port)
    }

    pub fn with_host(host: &str, port: u16) -> Result<Self> {
        Self::with_timeout(host, port, REQUEST_TIMEOUT)
    }

    /// `timeout` bounds the whole exchange, body included
    pub fn with_timeout(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        // Redirects and compression are the public client's business
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .no_proxy()
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Upstream(format!("Failed to build local HTTP client: {}", e)))?;
        Ok(Self {
            host: host.to_string(),
            port,
            timeout,
            client,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Replay a request and always produce a response envelope. Local
    /// failures become a 502, malformed envelopes a 400.
    pub async fn replay(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let id = request.id.clone();
        info!("Proxying {} {} to {}:{}", request.method, request.url, self.host, self.port);

        match self.forward(request).await {
            Ok(resp) => resp,
            Err(e @ Error::Upstream(_)) => {
                warn!("Request {}: {}", id, e);
                ResponseEnvelope::gateway_error(id, 502, &e.to_string())
            }
            Err(e) => {
                warn!("Request {} rejected: {}", id, e);
                ResponseEnvelope::gateway_error(id, 400, &e.to_string())
            }
        }
    }

    async fn forward(&self, request: RequestEnvelope) -> Result<ResponseEnvelope> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::Protocol(format!("invalid method: {}", request.method)))?;
        if !request.url.starts_with('/') {
            return Err(Error::Protocol(format!("invalid request target: {}", request.url)));
        }
        let body = request.decode_body()?;

        let mut headers = request.headers;
        headers.strip_hop_by_hop();

        let url = format!("http://{}:{}{}", self.host, self.port, request.url);
        let mut builder = self.client.request(method, &url);
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(|e| self.upstream_error(e))?;

        let status = resp.status().as_u16();
        let headers: Headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str(), val)))
            .collect();
        let body = resp.bytes().await.map_err(|e| self.upstream_error(e))?;

        Ok(ResponseEnvelope::new(request.id, status, headers, &body))
    }

    fn upstream_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Upstream(format!(
                "Local service at {}:{} did not respond within {}s",
                self.host,
                self.port,
                self.timeout.as_secs_f64()
            ))
        } else {
            Error::Upstream(format!(
                "Failed to reach local service at {}:{}: {}",
                self.host, self.port, e
            ))
        }
    }
}
