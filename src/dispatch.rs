/// Remote action dispatch
///
/// The frame pipeline never talks to the network. It hands a
/// `DispatchRequest` to a bounded queue, and the `DispatchWorker` task
/// drains that queue and calls the configured `RemoteNotifier`. Failures are
/// logged and counted, never retried.

use crate::config::RemoteConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Remote action request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Remote action timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote action rejected: {0}")]
    Rejected(String),

    #[error("Remote notifier not configured: {0}")]
    NotConfigured(String),
}

/// Routing hints sent along with every trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchHints {
    pub language: String,
    pub device_id: Option<String>,
    pub channel_id: Option<String>,
}

impl Default for DispatchHints {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            device_id: None,
            channel_id: None,
        }
    }
}

impl From<&RemoteConfig> for DispatchHints {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            language: config.language.clone(),
            device_id: config.device_id.clone(),
            channel_id: config.channel_id.clone(),
        }
    }
}

/// One wake event waiting to be reported
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Index of the keyword that fired
    pub keyword_index: usize,

    pub hints: DispatchHints,

    /// Wall-clock time of the detection
    pub detected_at: SystemTime,
}

/// Downstream collaborator notified on every trigger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteNotifier: Send + Sync {
    async fn trigger(&self, request: &DispatchRequest) -> Result<(), DispatchError>;
}

/// Notifier that only logs, used when no remote server is configured
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl RemoteNotifier for LogNotifier {
    async fn trigger(&self, request: &DispatchRequest) -> Result<(), DispatchError> {
        info!(
            "Wake event (keyword #{}, language {}); no remote server configured",
            request.keyword_index, request.hints.language
        );
        Ok(())
    }
}

/// Remote action endpoint path, relative to the server base address
const REMOTE_ACTION_PATH: &str = "/assist/remote-action";

/// Hotkey that toggles the microphone on the remote client
const MICROPHONE_HOTKEY: &str = "F4";

/// Sends the "trigger microphone" hotkey action to a remote assistant server
pub struct HttpRemoteNotifier {
    client: reqwest::Client,
    timeout: Duration,
    endpoint: String,
    user_id: String,
    token: String,
    client_info: String,
}

impl HttpRemoteNotifier {
    pub fn new(config: &RemoteConfig) -> Result<Self, DispatchError> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| DispatchError::NotConfigured("missing host address".to_string()))?;
        let user_id = config
            .user_id
            .clone()
            .ok_or_else(|| DispatchError::NotConfigured("missing user ID".to_string()))?;
        let token = config
            .token
            .clone()
            .ok_or_else(|| DispatchError::NotConfigured(format!("no token for user {}", user_id)))?;

        let endpoint = format!("{}{}", normalize_host(host), REMOTE_ACTION_PATH);
        let timeout = config.timeout();
        info!("Remote actions will be sent to {} (timeout {:?})", endpoint, timeout);

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            timeout,
            endpoint,
            user_id,
            token,
            client_info: config.client_info.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, e: reqwest::Error) -> DispatchError {
        if e.is_timeout() {
            DispatchError::Timeout(self.timeout)
        } else {
            DispatchError::Transport(e)
        }
    }
}

#[async_trait]
impl RemoteNotifier for HttpRemoteNotifier {
    async fn trigger(&self, request: &DispatchRequest) -> Result<(), DispatchError> {
        let action = microphone_action(&request.hints.language);
        let key = format!("{};{}", self.user_id, self.token);
        let device = request.hints.device_id.as_deref().unwrap_or("");
        let channel = request.hints.channel_id.as_deref().unwrap_or("");

        let form = [
            ("type", "hotkey"),
            ("action", action.as_str()),
            ("client", self.client_info.as_str()),
            ("targetChannelId", channel),
            ("targetDeviceId", device),
            ("KEY", key.as_str()),
        ];

        let response = self
            .client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if remote_succeeded(&body) {
            Ok(())
        } else {
            Err(DispatchError::Rejected(body))
        }
    }
}

/// Prefix a scheme when missing and strip one trailing slash
pub fn normalize_host(host: &str) -> String {
    let mut address = if host.starts_with("http") {
        host.to_string()
    } else {
        format!("https://{}", host)
    };

    if address.ends_with('/') {
        address.pop();
    }

    address
}

/// JSON-encoded hotkey action for toggling the remote microphone
pub fn microphone_action(language: &str) -> String {
    let language = if language.is_empty() { "en" } else { language };
    serde_json::json!({ "key": MICROPHONE_HOTKEY, "language": language }).to_string()
}

/// Server replies `{"result": "success", ...}` on success
pub fn remote_succeeded(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("result")
                .and_then(|result| result.as_str())
                .map(|result| result == "success")
        })
        .unwrap_or(false)
}

/// Dispatch worker statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub succeeded: u64,
    pub failed: u64,
}

/// Background task draining the dispatch queue
pub struct DispatchWorker;

impl DispatchWorker {
    /// Spawn the worker on the current Tokio runtime
    pub fn spawn(
        notifier: Arc<dyn RemoteNotifier>,
        requests: mpsc::Receiver<DispatchRequest>,
    ) -> JoinHandle<DispatchStats> {
        tokio::spawn(Self::run(notifier, requests))
    }

    /// Process requests until every sender is dropped
    pub async fn run(
        notifier: Arc<dyn RemoteNotifier>,
        mut requests: mpsc::Receiver<DispatchRequest>,
    ) -> DispatchStats {
        let mut stats = DispatchStats::default();

        while let Some(request) = requests.recv().await {
            debug!("Remote action: sending (keyword #{})", request.keyword_index);

            match notifier.trigger(&request).await {
                Ok(()) => {
                    stats.succeeded += 1;
                    info!("Remote action: triggered microphone");
                }
                Err(DispatchError::Rejected(body)) => {
                    stats.failed += 1;
                    warn!("Remote action: trigger failed, server replied: {}", body);
                }
                Err(e) => {
                    stats.failed += 1;
                    error!("Remote action: trigger failed: {}", e);
                }
            }
        }

        debug!(
            "Dispatch worker finished: {} succeeded, {} failed",
            stats.succeeded, stats.failed
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(keyword_index: usize) -> DispatchRequest {
        DispatchRequest {
            keyword_index,
            hints: DispatchHints::default(),
            detected_at: SystemTime::now(),
        }
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("my.example.com/sepia"), "https://my.example.com/sepia");
        assert_eq!(normalize_host("http://localhost:20726/sepia/"), "http://localhost:20726/sepia");
        assert_eq!(normalize_host("https://a.b/"), "https://a.b");
    }

    #[test]
    fn test_microphone_action() {
        let action: serde_json::Value = serde_json::from_str(&microphone_action("de")).unwrap();
        assert_eq!(action["key"], "F4");
        assert_eq!(action["language"], "de");

        let fallback: serde_json::Value = serde_json::from_str(&microphone_action("")).unwrap();
        assert_eq!(fallback["language"], "en");
    }

    #[test]
    fn test_remote_succeeded() {
        assert!(remote_succeeded(r#"{"result":"success"}"#));
        assert!(!remote_succeeded(r#"{"result":"fail","error":"401"}"#));
        assert!(!remote_succeeded("<html>Bad Gateway</html>"));
        assert!(!remote_succeeded(""));
    }

    #[test]
    fn test_http_notifier_requires_token() {
        let config = RemoteConfig {
            host: Some("localhost:20726/sepia".to_string()),
            user_id: Some("uid1001".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            HttpRemoteNotifier::new(&config),
            Err(DispatchError::NotConfigured(_))
        ));

        let config = RemoteConfig {
            token: Some("secret".to_string()),
            ..config
        };
        let notifier = HttpRemoteNotifier::new(&config).unwrap();
        assert_eq!(notifier.endpoint(), "https://localhost:20726/sepia/assist/remote-action");
    }

    #[test]
    fn test_hints_from_remote_config() {
        let config = RemoteConfig {
            language: "de".to_string(),
            device_id: Some("o1".to_string()),
            ..Default::default()
        };
        let hints = DispatchHints::from(&config);
        assert_eq!(hints.language, "de");
        assert_eq!(hints.device_id.as_deref(), Some("o1"));
        assert_eq!(hints.channel_id, None);
    }

    #[tokio::test]
    async fn test_worker_counts_results() {
        let mut notifier = MockRemoteNotifier::new();
        notifier
            .expect_trigger()
            .withf(|request| request.keyword_index == 0)
            .times(1)
            .returning(|_| Ok(()));
        notifier
            .expect_trigger()
            .withf(|request| request.keyword_index == 1)
            .times(1)
            .returning(|_| Err(DispatchError::Rejected("{\"result\":\"fail\"}".to_string())));

        let (tx, rx) = mpsc::channel(4);
        let handle = DispatchWorker::spawn(Arc::new(notifier), rx);

        tx.send(request(0)).await.unwrap();
        tx.send(request(1)).await.unwrap();
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats, DispatchStats { succeeded: 1, failed: 1 });
    }

    /// Accepts connections and never answers
    async fn silent_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        format!("http://{}", addr)
    }

    fn silent_notifier(host: String) -> HttpRemoteNotifier {
        let config = RemoteConfig {
            host: Some(host),
            user_id: Some("uid1001".to_string()),
            token: Some("secret".to_string()),
            timeout_secs: 0.2,
            ..Default::default()
        };
        HttpRemoteNotifier::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_http_notifier_times_out_on_silent_server() {
        let notifier = silent_notifier(silent_server().await);

        let result = tokio::time::timeout(Duration::from_secs(5), notifier.trigger(&request(0)))
            .await
            .expect("trigger must not hang");
        assert!(matches!(result, Err(DispatchError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_worker_keeps_draining_past_silent_server() {
        let notifier = silent_notifier(silent_server().await);

        let (tx, rx) = mpsc::channel(4);
        let handle = DispatchWorker::spawn(Arc::new(notifier), rx);
        for i in 0..3 {
            tx.send(request(i)).await.unwrap();
        }
        drop(tx);

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker must not hang")
            .unwrap();
        assert_eq!(stats, DispatchStats { succeeded: 0, failed: 3 });
    }

    #[tokio::test]
    async fn test_worker_exits_when_queue_closes() {
        let (tx, rx) = mpsc::channel::<DispatchRequest>(1);
        drop(tx);

        let stats = DispatchWorker::run(Arc::new(LogNotifier), rx).await;
        assert_eq!(stats, DispatchStats::default());
    }
}
