//! Sending composed queries to the search service.
//!
//! Hosts are tried in order, starting with the one that last answered. Each
//! host gets two attempts: a transient failure (no response, 5xx or 408) is
//! retried once after `retry_delay_ms`, a second one moves on to the next
//! host. Any other non-success status is the request's fault and is
//! returned at once.

use crate::config::ServiceConfig;
use crate::error::{Result, SearchError};
use crate::fallback::NativeSearch;
use crate::query::QueryRequest;
use crate::response::{ResponseSource, SearchResponse};
use crate::session::Session;
use async_trait::async_trait;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

pub const SESSION_HEADER: &str = "x-session-id";
pub const SESSION_PARAM: &str = "sessionId";
const ATTEMPTS_PER_HOST: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 5xx and 408 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        self.status >= 500 || self.status == 408
    }
}

/// No response at all: connection refused, DNS, timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportError {
    pub message: String,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// HTTP seam, so the retry and failover logic can run against fakes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Responses are requested and decoded with deflate compression.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SearchError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(request.body.clone().unwrap_or_default()),
        };
        let response = builder.send().await.map_err(|e| TransportError {
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|e| TransportError {
            message: format!("Failed to read response body: {}", e),
        })?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

struct Degraded {
    native: Box<dyn NativeSearch>,
    window: Duration,
}

pub struct Dispatcher {
    transport: Box<dyn Transport>,
    service: ServiceConfig,
    session: Rc<Session>,
    degraded: Option<Degraded>,
}

impl Dispatcher {
    pub fn new(transport: Box<dyn Transport>, service: ServiceConfig, session: Rc<Session>) -> Self {
        Self {
            transport,
            service,
            session,
            degraded: None,
        }
    }

    /// Fall back to `native` for `window` after the service fails outright.
    pub fn with_fallback(mut self, native: Box<dyn NativeSearch>, window: Duration) -> Self {
        self.degraded = Some(Degraded { native, window });
        self
    }

    pub fn session(&self) -> &Rc<Session> {
        &self.session
    }

    /// Configured hosts with the last successful one moved to the front.
    pub fn host_order(&self) -> Vec<String> {
        let mut hosts = self.service.hosts.clone();
        if let Some(sticky) = self.session.successful_host() {
            if let Some(index) = hosts.iter().position(|h| *h == sticky) {
                let host = hosts.remove(index);
                hosts.insert(0, host);
            }
        }
        hosts
    }

    /// The request that would be sent to `host`. GET carries the query as `q`;
    /// long queries, or all queries with `force_post`, go in a POST body.
    pub fn prepare(&self, host: &str, body: &str) -> HttpRequest {
        let endpoint = format!("{}{}", host.trim_end_matches('/'), self.service.path);
        let session_param = self
            .session
            .session_id()
            .map(|id| format!("{}={}", SESSION_PARAM, urlencoding::encode(&id)));

        let mut get_url = format!("{}?q={}", endpoint, urlencoding::encode(body));
        if let Some(param) = &session_param {
            get_url.push('&');
            get_url.push_str(param);
        }

        if !self.service.force_post && get_url.len() <= self.service.max_get_length {
            return HttpRequest {
                method: Method::Get,
                url: get_url,
                body: None,
            };
        }
        let url = match session_param {
            Some(param) => format!("{}?{}", endpoint, param),
            None => endpoint,
        };
        HttpRequest {
            method: Method::Post,
            url,
            body: Some(body.to_string()),
        }
    }

    pub async fn dispatch(&self, request: &QueryRequest) -> Result<SearchResponse> {
        if let Some(degraded) = &self.degraded {
            if self.session.is_degraded() {
                tracing::debug!("Degraded mode active, using native search");
                return degraded.native.search(request).await;
            }
        }

        let body = request.encode()?;
        match self.dispatch_primary(&body).await {
            Err(err) if err.is_transport() => match &self.degraded {
                Some(degraded) => {
                    tracing::warn!(
                        window_seconds = degraded.window.as_secs(),
                        "Search service unavailable, entering degraded mode: {}",
                        err
                    );
                    if let Err(e) = self.session.enter_degraded(degraded.window) {
                        tracing::warn!("Failed to persist degraded mode: {}", e);
                    }
                    degraded.native.search(request).await
                }
                None => Err(err),
            },
            other => other,
        }
    }

    async fn dispatch_primary(&self, body: &str) -> Result<SearchResponse> {
        let hosts = self.host_order();
        if hosts.is_empty() {
            return Err(SearchError::Config("no search hosts configured".to_string()));
        }

        let mut last_error = None;
        for host in &hosts {
            for attempt in 1..=ATTEMPTS_PER_HOST {
                let request = self.prepare(host, body);
                tracing::debug!(host = %host, attempt, method = ?request.method, "Sending query");

                let failure = match self.transport.send(&request).await {
                    Ok(response) if response.is_success() => {
                        return self.accept(host, response);
                    }
                    Ok(response) if response.is_transient() => SearchError::Transport {
                        host: host.clone(),
                        status: Some(response.status),
                        message: response.body,
                    },
                    Ok(response) => {
                        tracing::warn!(host = %host, status = response.status, "Query rejected");
                        return Err(SearchError::ClientRejection {
                            status: response.status,
                            body: response.body,
                        });
                    }
                    Err(e) => SearchError::Transport {
                        host: host.clone(),
                        status: None,
                        message: e.message,
                    },
                };

                if attempt < ATTEMPTS_PER_HOST {
                    tracing::info!(host = %host, attempt, "Transient failure, retrying: {}", failure);
                    tokio::time::sleep(self.service.retry_delay()).await;
                } else {
                    tracing::warn!(host = %host, "Host failed twice, failing over: {}", failure);
                }
                last_error = Some(failure);
            }
        }

        let err = last_error.unwrap_or_else(|| SearchError::Transport {
            host: String::new(),
            status: None,
            message: "no attempt made".to_string(),
        });
        tracing::error!(hosts = hosts.len(), "All search hosts failed: {}", err);
        Err(err)
    }

    fn accept(&self, host: &str, response: HttpResponse) -> Result<SearchResponse> {
        if let Some(id) = response.header(SESSION_HEADER) {
            if let Err(e) = self.session.set_session_id(id) {
                tracing::warn!("Failed to persist session id: {}", e);
            }
        }
        if let Err(e) = self.session.set_successful_host(host) {
            tracing::warn!("Failed to persist successful host: {}", e);
        }
        if self.session.degraded_until().is_some() {
            tracing::info!(host = %host, "Search service reachable again, leaving degraded mode");
            if let Err(e) = self.session.clear_degraded() {
                tracing::warn!("Failed to clear degraded mode: {}", e);
            }
        }

        let decoded = SearchResponse::decode(
            &response.body,
            ResponseSource::Service {
                host: host.to_string(),
            },
        )?;
        for warning in &decoded.warnings {
            tracing::warn!(host = %host, "Search service warning: {}", warning);
        }
        if self.service.strict_warnings && !decoded.warnings.is_empty() {
            return Err(SearchError::ServerWarning(decoded.warnings));
        }
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::store::{KeyValueStore, MemoryStore};
    use std::sync::Mutex;

    /// Replays canned outcomes and records every request.
    struct ScriptedTransport {
        outcomes: Mutex<Vec<std::result::Result<HttpResponse, TransportError>>>,
        sent: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn new(mut outcomes: Vec<std::result::Result<HttpResponse, TransportError>>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for std::sync::Arc<ScriptedTransport> {
        async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            self.sent.lock().unwrap().push(request.clone());
            self.outcomes.lock().unwrap().pop().unwrap_or_else(|| {
                Err(TransportError {
                    message: "script exhausted".to_string(),
                })
            })
        }
    }

    fn status(code: u16) -> std::result::Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status: code,
            headers: HashMap::new(),
            body: if code == 200 {
                r#"{"products": []}"#.to_string()
            } else {
                format!("error {}", code)
            },
        })
    }

    fn service(hosts: &[&str]) -> ServiceConfig {
        ServiceConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            retry_delay_ms: 0,
            ..ServiceConfig::default()
        }
    }

    fn scripted(
        hosts: &[&str],
        outcomes: Vec<std::result::Result<HttpResponse, TransportError>>,
    ) -> (Dispatcher, std::sync::Arc<ScriptedTransport>) {
        let transport = std::sync::Arc::new(ScriptedTransport::new(outcomes));
        let store: Rc<dyn KeyValueStore> = Rc::new(MemoryStore::new());
        let session = Rc::new(Session::load(store, None).unwrap());
        (
            Dispatcher::new(Box::new(transport.clone()), service(hosts), session),
            transport,
        )
    }

    fn request() -> QueryRequest {
        Query::new().vendor("Acme").unwrap().build().unwrap()
    }

    fn hosts_hit(transport: &ScriptedTransport) -> Vec<String> {
        transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.split("/query").next().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_single_transient_failure_retries_same_host() {
        let (dispatcher, transport) = scripted(&["https://a", "https://b"], vec![status(503), status(200)]);
        dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(hosts_hit(&transport), vec!["https://a", "https://a"]);
    }

    #[tokio::test]
    async fn test_second_transient_failure_rotates_host() {
        let (dispatcher, transport) =
            scripted(&["https://a", "https://b"], vec![status(503), status(408), status(200)]);
        let response = dispatcher.dispatch(&request()).await.unwrap();

        assert_eq!(hosts_hit(&transport), vec!["https://a", "https://a", "https://b"]);
        assert_eq!(
            response.source,
            ResponseSource::Service {
                host: "https://b".to_string()
            }
        );
        assert_eq!(dispatcher.host_order(), vec!["https://b", "https://a"]);
    }

    #[tokio::test]
    async fn test_exhausting_hosts_fails_once() {
        let (dispatcher, transport) = scripted(
            &["https://a", "https://b"],
            vec![
                status(500),
                Err(TransportError {
                    message: "connection refused".to_string(),
                }),
                status(502),
                status(503),
            ],
        );
        let err = dispatcher.dispatch(&request()).await.unwrap_err();

        assert_eq!(transport.sent.lock().unwrap().len(), 4);
        assert_eq!(
            err,
            SearchError::Transport {
                host: "https://b".to_string(),
                status: Some(503),
                message: "error 503".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (dispatcher, transport) = scripted(&["https://a", "https://b"], vec![status(422), status(200)]);
        let err = dispatcher.dispatch(&request()).await.unwrap_err();

        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert!(matches!(err, SearchError::ClientRejection { status: 422, .. }));
    }

    #[tokio::test]
    async fn test_session_id_captured_and_echoed_as_param() {
        let mut first = HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: r#"{"products": []}"#.to_string(),
        };
        first
            .headers
            .insert(SESSION_HEADER.to_string(), "abc 123".to_string());
        let (dispatcher, transport) = scripted(&["https://a"], vec![Ok(first), status(200)]);

        dispatcher.dispatch(&request()).await.unwrap();
        dispatcher.dispatch(&request()).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert!(!sent[0].url.contains(SESSION_PARAM));
        assert!(sent[1].url.ends_with("&sessionId=abc%20123"));
        assert_eq!(dispatcher.session().session_id().as_deref(), Some("abc 123"));
    }

    #[test]
    fn test_prepare_switches_to_post_for_long_queries() {
        let (mut dispatcher, _) = scripted(&["https://a/"], vec![]);
        let short = request().encode().unwrap();
        let get = dispatcher.prepare("https://a/", &short);
        assert_eq!(get.method, Method::Get);
        assert!(get.url.starts_with("https://a/query?q=%7B"));
        assert_eq!(get.body, None);

        let long = "x".repeat(dispatcher.service.max_get_length);
        let post = dispatcher.prepare("https://a/", &long);
        assert_eq!(post.method, Method::Post);
        assert_eq!(post.url, "https://a/query");
        assert_eq!(post.body.as_deref(), Some(long.as_str()));

        dispatcher.service.force_post = true;
        assert_eq!(dispatcher.prepare("https://a", &short).method, Method::Post);
    }

    #[tokio::test]
    async fn test_strict_warnings_become_errors() {
        let warned = Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: r#"{"products": [], "warnings": ["unknown field"]}"#.to_string(),
        });
        let (mut dispatcher, _) = scripted(&["https://a"], vec![warned.clone(), warned]);

        let response = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(response.warnings, vec!["unknown field"]);

        dispatcher.service.strict_warnings = true;
        let err = dispatcher.dispatch(&request()).await.unwrap_err();
        assert_eq!(err, SearchError::ServerWarning(vec!["unknown field".to_string()]));
    }
}
