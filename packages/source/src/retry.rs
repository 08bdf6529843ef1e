//! HTTP fetcher with bounded retry.
//!
//! Every collector goes through [`Fetcher::fetch`] instead of calling
//! `reqwest` directly, so all sources share the same timeout, retry, and
//! error semantics:
//!
//! - timeouts and transport failures (connect, request, body read) are
//!   retried with exponential backoff: `retry_delay`, `2×`, `4×`, ...
//! - any non-2xx status fails immediately; the source answered, and asking
//!   again will not change its mind
//! - a 2xx body that does not decode in the requested format is fatal

use std::time::Duration;

use seawatch_source_models::{HttpMethod, Payload, ResponseFormat, SourceRequest};

/// Maximum length of the response body preview carried in status errors.
const BODY_PREVIEW_LEN: usize = 500;

/// Timeout and retry settings for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub retry_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryOptions {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }

    /// Upper bound on wall time for one fetch: every attempt times out and
    /// every backoff is slept.
    #[must_use]
    pub fn worst_case_budget(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let waiting = (1..=self.max_retries)
            .map(|retry| self.backoff(retry))
            .fold(Duration::ZERO, Duration::saturating_add);
        self.timeout.saturating_mul(attempts).saturating_add(waiting)
    }
}

/// Errors returned by [`Fetcher::fetch`].
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Every attempt timed out.
    #[error("Request to {url} timed out after {attempts} attempts")]
    Timeout {
        /// Requested URL.
        url: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Transport failure persisted through every retry, or was not
    /// retryable.
    #[error("Request to {url} failed after {attempts} attempts: {message}")]
    Network {
        /// Requested URL.
        url: String,
        /// Attempts made.
        attempts: u32,
        /// Last transport error.
        message: String,
    },

    /// The source answered with a non-2xx status.
    #[error("HTTP {status} from {url}: {body}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// The body could not be decoded in the requested format.
    #[error("Could not decode response from {url}: {message}")]
    Decode {
        /// Requested URL.
        url: String,
        /// Decoder error.
        message: String,
    },

    /// The HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl FetchError {
    /// Returns the HTTP status for [`FetchError::Status`].
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

enum AttemptError {
    Transient(reqwest::Error),
    Fatal(FetchError),
}

/// Issues source requests. Holds no per-call state; one instance is shared
/// by every collector in an invocation.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    /// Creates a fetcher with a default client.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Client`] if the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("seawatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Sends `request`, retrying transient failures per `options`.
    ///
    /// # Errors
    ///
    /// * [`FetchError::Timeout`] / [`FetchError::Network`] once retries are
    ///   exhausted
    /// * [`FetchError::Status`] on the first non-2xx response
    /// * [`FetchError::Decode`] if a 2xx body does not parse
    pub async fn fetch(
        &self,
        request: &SourceRequest,
        options: &RetryOptions,
    ) -> Result<Payload, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt(request, options.timeout).await {
                Ok(text) => return decode(request, text),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => {
                    if attempt > options.max_retries {
                        log::error!(
                            "{} {} failed after {attempt} attempts: {e}",
                            request.method,
                            request.url
                        );
                        return Err(if e.is_timeout() {
                            FetchError::Timeout {
                                url: request.url.clone(),
                                attempts: attempt,
                            }
                        } else {
                            FetchError::Network {
                                url: request.url.clone(),
                                attempts: attempt,
                                message: e.to_string(),
                            }
                        });
                    }
                    let delay = options.backoff(attempt);
                    log::warn!(
                        "  retry {attempt}/{} for {} in {delay:?} ({e})",
                        options.max_retries,
                        request.url
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn build(&self, request: &SourceRequest, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        builder = builder.timeout(timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    async fn attempt(
        &self,
        request: &SourceRequest,
        timeout: Duration,
    ) -> Result<String, AttemptError> {
        let response = self
            .build(request, timeout)
            .send()
            .await
            .map_err(|e| classify(request, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("{} {} returned HTTP {status}", request.method, request.url);
            return Err(AttemptError::Fatal(FetchError::Status {
                url: request.url.clone(),
                status: status.as_u16(),
                body: preview(&body),
            }));
        }

        response.text().await.map_err(|e| classify(request, e))
    }
}

fn classify(request: &SourceRequest, e: reqwest::Error) -> AttemptError {
    if is_transient(&e) {
        AttemptError::Transient(e)
    } else {
        AttemptError::Fatal(FetchError::Network {
            url: request.url.clone(),
            attempts: 1,
            message: e.to_string(),
        })
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
}

fn preview(body: &str) -> String {
    if body.chars().count() > BODY_PREVIEW_LEN {
        let mut truncated: String = body.chars().take(BODY_PREVIEW_LEN).collect();
        truncated.push_str("...");
        truncated
    } else {
        body.to_string()
    }
}

fn decode(request: &SourceRequest, text: String) -> Result<Payload, FetchError> {
    match request.format {
        ResponseFormat::Text => Ok(Payload::Text(text)),
        ResponseFormat::Json => serde_json::from_str(&text)
            .map(Payload::Json)
            .map_err(|e| {
                log::error!(
                    "JSON parse failed for {}: {e} (received {} bytes, preview: {})",
                    request.url,
                    text.len(),
                    preview(&text)
                );
                FetchError::Decode {
                    url: request.url.clone(),
                    message: e.to_string(),
                }
            }),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path, query_param},
    };

    use super::*;

    fn quick() -> RetryOptions {
        RetryOptions {
            timeout: Duration::from_millis(200),
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn backoff_doubles() {
        let options = RetryOptions::default();
        assert_eq!(options.backoff(1), Duration::from_secs(1));
        assert_eq!(options.backoff(2), Duration::from_secs(2));
        assert_eq!(options.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn worst_case_budget_sums_timeouts_and_backoff() {
        // 4 attempts × 8s + (1 + 2 + 4)s
        assert_eq!(
            RetryOptions::default().worst_case_budget(),
            Duration::from_secs(39)
        );
        let none = RetryOptions {
            max_retries: 0,
            ..RetryOptions::default()
        };
        assert_eq!(none.worst_case_budget(), Duration::from_secs(8));
    }

    #[test]
    fn preview_truncates_long_bodies() {
        let body = "x".repeat(600);
        let shown = preview(&body);
        assert_eq!(shown.len(), BODY_PREVIEW_LEN + 3);
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn posts_json_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("origin", "https://portal.example"))
            .and(body_json(serde_json::json!({"page": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let request = SourceRequest::post(
            format!("{}/search", server.uri()),
            serde_json::json!({"page": 2}),
        )
        .with_header("origin", "https://portal.example");
        let payload = Fetcher::new().unwrap().fetch(&request, &quick()).await.unwrap();
        assert_eq!(payload, Payload::Json(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn sends_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let request = SourceRequest::get(format!("{}/feed", server.uri())).with_query("format", "json");
        let payload = Fetcher::new().unwrap().fetch(&request, &quick()).await.unwrap();
        assert_eq!(payload.as_json(), Some(&serde_json::json!([])));
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(1)
            .mount(&server)
            .await;

        let request = SourceRequest::get(server.uri());
        let err = Fetcher::new()
            .unwrap()
            .fetch(&request, &quick())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = Fetcher::new()
            .unwrap()
            .fetch(&SourceRequest::get(server.uri()), &quick())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn timeouts_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .expect(3)
            .mount(&server)
            .await;

        let err = Fetcher::new()
            .unwrap()
            .fetch(&SourceRequest::get(server.uri()), &quick())
            .await
            .unwrap_err();
        assert!(
            matches!(err, FetchError::Timeout { attempts: 3, .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn connection_refused_exhausts_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Fetcher::new()
            .unwrap()
            .fetch(&SourceRequest::get(format!("http://{addr}/")), &quick())
            .await
            .unwrap_err();
        assert!(
            matches!(err, FetchError::Network { attempts: 3, .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .expect(1)
            .mount(&server)
            .await;

        let err = Fetcher::new()
            .unwrap()
            .fetch(&SourceRequest::get(server.uri()), &quick())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[tokio::test]
    async fn text_responses_are_returned_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<table></table>"))
            .mount(&server)
            .await;

        let request = SourceRequest::get(server.uri()).expecting(ResponseFormat::Text);
        let payload = Fetcher::new().unwrap().fetch(&request, &quick()).await.unwrap();
        assert_eq!(payload.as_text(), Some("<table></table>"));
    }
}
