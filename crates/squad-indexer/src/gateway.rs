//! Rate-limited request gateway for the indexer
//!
//! Every wire request goes through one FIFO queue drained by a single worker
//! task, which waits `request_delay` after each response before taking the
//! next job. Callers that want to survive throttling wrap their requests in
//! [`with_rate_limit_retry`].

use rand::Rng;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::constants;
use crate::error::{IndexerError, IndexerResult};

/// A GET request waiting in the gateway queue
#[derive(Debug, Clone)]
pub struct IndexerRequest {
    /// Path appended to the base URL (e.g. "/messages")
    pub endpoint: String,
    /// Query parameters; repeated keys are allowed
    pub query: Vec<(String, String)>,
}

impl IndexerRequest {
    pub fn get(endpoint: &str, query: Vec<(String, String)>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            query,
        }
    }
}

struct Job {
    request: IndexerRequest,
    respond: oneshot::Sender<IndexerResult<Value>>,
}

/// Handle to the serialized request queue
///
/// Cloning the handle shares the same queue and worker. The worker exits once
/// every handle is dropped.
#[derive(Clone)]
pub struct RequestGateway {
    jobs: mpsc::UnboundedSender<Job>,
}

impl RequestGateway {
    /// Spawn the queue worker. Must be called inside a tokio runtime.
    pub fn new(base_url: &str, api_key: Option<String>, request_delay: Duration) -> Self {
        let (jobs, queue) = mpsc::unbounded_channel();
        let worker = Worker {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            request_delay,
        };
        tokio::spawn(worker.run(queue));

        Self { jobs }
    }

    /// Queue a request and wait for its response
    pub async fn enqueue(&self, request: IndexerRequest) -> IndexerResult<Value> {
        let (respond, response) = oneshot::channel();
        self.jobs
            .send(Job { request, respond })
            .map_err(|_| IndexerError::GatewayClosed)?;

        response.await.map_err(|_| IndexerError::GatewayClosed)?
    }
}

struct Worker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    request_delay: Duration,
}

impl Worker {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = queue.recv().await {
            let result = self.execute(&job.request).await;
            // Caller may have given up; nothing to do then
            let _ = job.respond.send(result);

            sleep(self.request_delay).await;
        }
        debug!("request gateway drained and closed");
    }

    async fn execute(&self, request: &IndexerRequest) -> IndexerResult<Value> {
        let url = format!("{}{}", self.base_url, request.endpoint);
        let url = reqwest::Url::parse_with_params(&url, &request.query)
            .map_err(|e| IndexerError::Transport(format!("invalid url {}: {}", url, e)))?;

        let mut builder = self.client.get(url).header("Accept", "application/json");

        if let Some(key) = &self.api_key {
            builder = builder.header("X-API-Key", key);
        }

        debug!(endpoint = %request.endpoint, "indexer request");
        let response = builder.send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexerError::RateLimited(body));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), endpoint = %request.endpoint, "indexer error response");
            return Err(IndexerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

// =============================================================================
// Retry with exponential backoff
// =============================================================================

/// Backoff schedule for rate-limited requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Relative jitter (0.15 = ±15%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: constants::MAX_RETRIES,
            initial_delay: Duration::from_millis(constants::RETRY_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(constants::RETRY_MAX_DELAY_MS),
            factor: constants::RETRY_FACTOR,
            jitter: constants::RETRY_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    ///
    /// `spread` is a sample in [-1, 1] scaling the jitter; the result never
    /// exceeds `max_delay`.
    pub fn delay_for(&self, attempt: u32, spread: f64) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let jittered = base * (1.0 + self.jitter * spread.clamp(-1.0, 1.0));
        let capped = jittered.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

/// Run `op`, retrying with backoff while it fails with a rate-limit error.
///
/// Other errors are returned immediately. When attempts run out the last
/// error is returned.
pub async fn with_rate_limit_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> IndexerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IndexerResult<T>>,
{
    let attempts = policy.max_retries.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_rate_limit() => return Err(e),
            Err(e) if attempt + 1 >= attempts => {
                warn!(attempts, "giving up after repeated rate limiting: {}", e);
                return Err(e);
            }
            Err(e) => {
                let spread = rand::thread_rng().gen_range(-1.0..=1.0);
                let delay = policy.delay_for(attempt, spread);
                warn!(
                    "Retry {}/{} after {:?} (rate limited): {}",
                    attempt + 1,
                    attempts - 1,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
            jitter: 0.15,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(0, 0.0), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(1, 0.0), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(2, 0.0), Duration::from_millis(6000));
        assert_eq!(policy.delay_for(4, 0.0), Duration::from_millis(15000));
        assert_eq!(policy.delay_for(10, 1.0), Duration::from_millis(15000));
    }

    #[test]
    fn test_backoff_jitter_band() {
        let policy = RetryPolicy::default();

        let low = policy.delay_for(0, -1.0).as_secs_f64();
        let high = policy.delay_for(0, 1.0).as_secs_f64();
        assert!((low - 1.275).abs() < 1e-9);
        assert!((high - 1.725).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_rate_limit() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_rate_limit_retry(&fast_policy(5), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(IndexerError::RateLimited("slow down".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_other_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: IndexerResult<()> = with_rate_limit_retry(&fast_policy(5), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(IndexerError::Status {
                    status: 500,
                    body: "boom".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(IndexerError::Status { status: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: IndexerResult<()> = with_rate_limit_retry(&fast_policy(3), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(IndexerError::RateLimited(format!("attempt {}", n)))
            }
        })
        .await;

        match result {
            Err(IndexerError::RateLimited(msg)) => assert_eq!(msg, "attempt 2"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gateway_get_sends_query_and_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/messages"))
            .and(query_param("limit", "10"))
            .and(header("X-API-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = RequestGateway::new(&server.uri(), Some("secret".into()), Duration::ZERO);
        let value = gateway
            .enqueue(IndexerRequest::get(
                "/messages",
                vec![("limit".into(), "10".into())],
            ))
            .await
            .unwrap();

        assert_eq!(value["messages"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_gateway_maps_status_codes() {
        let server = MockServer::start().await;
        Mock::given(path("/throttled"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Ratelimit exceed"))
            .mount(&server)
            .await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let gateway = RequestGateway::new(&server.uri(), None, Duration::ZERO);

        let throttled = gateway
            .enqueue(IndexerRequest::get("/throttled", Vec::new()))
            .await
            .unwrap_err();
        assert!(throttled.is_rate_limit());

        let missing = gateway
            .enqueue(IndexerRequest::get("/missing", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(missing, IndexerError::Status { status: 404, .. }));
        assert!(!missing.is_rate_limit());
    }

    #[tokio::test]
    async fn test_gateway_serializes_requests_in_fifo_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let delay = Duration::from_millis(50);
        let gateway = RequestGateway::new(&server.uri(), None, delay);

        let start = Instant::now();
        let (a, b, c) = tokio::join!(
            gateway.enqueue(IndexerRequest::get("/first", Vec::new())),
            gateway.enqueue(IndexerRequest::get("/second", Vec::new())),
            gateway.enqueue(IndexerRequest::get("/third", Vec::new())),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        // Two full gaps must separate three requests
        assert!(start.elapsed() >= delay * 2);

        let paths: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(paths, vec!["/first", "/second", "/third"]);
    }
}
