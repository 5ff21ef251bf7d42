//! Pooled HTTP client for upstream origins
//!
//! The router forwards every request through one shared [`UpstreamPool`], so
//! keep-alive connections to each origin are reused across requests. Plain
//! and TLS origins go through the same client.

use crate::config::RouterSettings;
use crate::error::{BoxError, ProxyBody};
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::{HeaderMap, Method, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for upstream requests
#[derive(Debug, Error)]
pub enum PoolError {
    /// No response headers within the request timeout
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
    /// Connect, TLS or protocol failure
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Statistics for the upstream pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent upstream
    pub total_requests: AtomicU64,
    /// Requests that ended in a connection or protocol error
    pub failed_requests: AtomicU64,
    /// Requests that hit the request timeout
    pub timeouts: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn get_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Bound on waiting for upstream response headers
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn from_settings(settings: &RouterSettings) -> Self {
        Self {
            max_idle_per_host: settings.pool_max_idle_per_host,
            idle_timeout: settings.pool_idle_timeout(),
            request_timeout: settings.request_timeout(),
        }
    }
}

/// Shared client for forwarding requests to origins
pub struct UpstreamPool {
    client: reqwest::Client,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl UpstreamPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .tcp_nodelay(true)
            // Redirects go back to the client untouched
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Upstream pool initialized"
        );

        Ok(Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `url` and stream the response back.
    ///
    /// Headers are sent as given; a `Host` header in `headers` wins over the
    /// one derived from `url`. The body may be a stream; it is not buffered.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: impl Into<reqwest::Body>,
    ) -> Result<Response<ProxyBody>, PoolError> {
        self.stats.record_request();

        let request = self.client.request(method, url).headers(headers).body(body);
        let upstream = match tokio::time::timeout(self.config.request_timeout, request.send()).await
        {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                self.stats.record_failure();
                return Err(PoolError::Upstream(e));
            }
            Err(_) => {
                self.stats.record_timeout();
                return Err(PoolError::Timeout(self.config.request_timeout));
            }
        };

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);

        let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        stats.record_timeout();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
        assert_eq!(stats.get_timeouts(), 1);
    }

    #[tokio::test]
    async fn test_send_streams_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_lowercase();
            let host_kept = request.contains("host: a.test");
            let body = if host_kept { "host-kept" } else { "host-lost" };
            let response = format!(
                "HTTP/1.1 201 Created\r\nX-Upstream: yes\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let pool = UpstreamPool::new(PoolConfig::default()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::HOST, "a.test".parse().unwrap());
        let response = pool
            .send(
                Method::GET,
                &format!("http://127.0.0.1:{}/path", port),
                headers,
                Bytes::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 201);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"host-kept");
        assert_eq!(pool.stats().get_total_requests(), 1);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = UpstreamPool::new(PoolConfig::default()).unwrap();
        let err = pool
            .send(
                Method::GET,
                &format!("http://127.0.0.1:{}/", port),
                HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Upstream(_)));
        assert_eq!(pool.stats().get_failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let pool = UpstreamPool::new(PoolConfig {
            request_timeout: Duration::from_millis(200),
            ..PoolConfig::default()
        })
        .unwrap();
        let err = pool
            .send(
                Method::GET,
                &format!("http://127.0.0.1:{}/", port),
                HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
        assert_eq!(pool.stats().get_timeouts(), 1);
    }
}
