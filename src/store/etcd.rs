//! etcd v2 keys API client.
//!
//! Every call is tried against the configured endpoints in order until one
//! answers at the HTTP level. Watches are long-polls that advance
//! `waitIndex` past each observed change.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::store::{ConfigStore, Result, WatchEvent, WatchStream};

const KEY_NOT_FOUND: u64 = 100;
const NODE_EXISTS: u64 = 105;
const EVENT_INDEX_CLEARED: u64 = 401;

/// Response header carrying the store's current modification index.
const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// Pause after a failed watch poll before trying again.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdNode {
    key: Option<String>,
    value: Option<String>,
    modified_index: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: Option<u64>,
}

/// [`ConfigStore`] backed by one or more etcd members.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    client: reqwest::Client,
    endpoints: Arc<Vec<String>>,
    request_timeout: Duration,
}

impl EtcdStore {
    /// Create a client for the given member URLs (e.g. `http://127.0.0.1:4001`).
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        let endpoints: Vec<String> = endpoints
            .into_iter()
            .map(|e| e.trim().trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .collect();

        if endpoints.is_empty() {
            return Err(StoreError::Config {
                reason: "no etcd endpoints configured".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::Config {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoints: Arc::new(endpoints),
            request_timeout: Duration::from_secs(5),
        })
    }

    /// Timeout for everything except watches.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The store's modification index as of a plain read of `key`.
    ///
    /// etcd reports it on misses too, so a missing prefix still anchors.
    async fn current_index(&self, key: &str) -> Option<u64> {
        let response = send(&self.client, &self.endpoints, |client, endpoint| {
            client
                .get(key_url(endpoint, key))
                .timeout(self.request_timeout)
        })
        .await
        .ok()?;

        response
            .headers()
            .get(ETCD_INDEX_HEADER)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }
}

#[async_trait]
impl ConfigStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<String> {
        let response = send(&self.client, &self.endpoints, |client, endpoint| {
            client
                .get(key_url(endpoint, key))
                .timeout(self.request_timeout)
        })
        .await?;

        decode(key, response)
            .await?
            .node
            .and_then(|node| node.value)
            .ok_or_else(|| StoreError::Malformed(format!("{} has no value", key)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl_secs(ttl).to_string()));
        }

        let response = send(&self.client, &self.endpoints, |client, endpoint| {
            client
                .put(key_url(endpoint, key))
                .form(&form)
                .timeout(self.request_timeout)
        })
        .await?;

        decode(key, response).await.map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = send(&self.client, &self.endpoints, |client, endpoint| {
            client
                .delete(key_url(endpoint, key))
                .timeout(self.request_timeout)
        })
        .await?;

        decode(key, response).await.map(|_| ())
    }

    async fn create_exclusive(&self, key: &str, ttl: Duration) -> Result<()> {
        let form = [("value", String::new()), ("ttl", ttl_secs(ttl).to_string())];

        let response = send(&self.client, &self.endpoints, |client, endpoint| {
            client
                .put(key_url(endpoint, key))
                .query(&[("prevExist", "false")])
                .form(&form)
                .timeout(self.request_timeout)
        })
        .await?;

        decode(key, response).await.map(|_| ())
    }

    async fn watch(&self, prefix: &str, cancel: CancellationToken) -> WatchStream {
        let wait_index = match self.current_index(prefix).await {
            Some(index) => Some(index + 1),
            None => {
                tracing::debug!(prefix, "No etcd index, watching from the next change");
                None
            }
        };

        let state = WatchState {
            client: self.client.clone(),
            endpoints: Arc::clone(&self.endpoints),
            prefix: prefix.to_string(),
            wait_index,
            cancel,
            pause: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            let cancel = state.cancel.clone();
            loop {
                if state.pause {
                    state.pause = false;
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                    }
                }

                let step = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    step = state.poll() => step,
                };

                match step {
                    WatchStep::Event(event) => return Some((Ok(event), state)),
                    WatchStep::Retry => continue,
                    WatchStep::Failed(err) => {
                        state.pause = true;
                        return Some((Err(err), state));
                    }
                }
            }
        })
        .boxed()
    }
}

struct WatchState {
    client: reqwest::Client,
    endpoints: Arc<Vec<String>>,
    prefix: String,
    wait_index: Option<u64>,
    cancel: CancellationToken,
    pause: bool,
}

enum WatchStep {
    Event(WatchEvent),
    Retry,
    Failed(StoreError),
}

impl WatchState {
    async fn poll(&mut self) -> WatchStep {
        let mut query = vec![("wait", "true".to_string()), ("recursive", "true".to_string())];
        if let Some(index) = self.wait_index {
            query.push(("waitIndex", index.to_string()));
        }

        let prefix = self.prefix.as_str();
        let response = match send(&self.client, &self.endpoints, |client, endpoint| {
            client.get(key_url(endpoint, prefix)).query(&query)
        })
        .await
        {
            Ok(response) => response,
            Err(e) => return WatchStep::Failed(e),
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return WatchStep::Failed(StoreError::Malformed(e.to_string())),
        };

        if !status.is_success() {
            if let Ok(err) = serde_json::from_slice::<EtcdErrorBody>(&body)
                && err.error_code == EVENT_INDEX_CLEARED
            {
                tracing::debug!(prefix, "Watch index cleared, resuming from current index");
                self.wait_index = err.index.map(|i| i + 1);
                return WatchStep::Retry;
            }
            return WatchStep::Failed(error_from_body(&self.prefix, status.as_u16(), &body));
        }

        let parsed: EtcdResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => return WatchStep::Failed(StoreError::Malformed(e.to_string())),
        };

        let Some(node) = parsed.node else {
            return WatchStep::Failed(StoreError::Malformed(
                "watch response without node".to_string(),
            ));
        };

        if let Some(index) = node.modified_index {
            self.wait_index = Some(index + 1);
        }

        let Some(key) = node.key else {
            return WatchStep::Failed(StoreError::Malformed(
                "watch response without key".to_string(),
            ));
        };

        let value = match parsed.action.as_str() {
            "delete" | "expire" | "compareAndDelete" => None,
            _ => node.value,
        };

        WatchStep::Event(WatchEvent { key, value })
    }
}

/// Send a request to the first endpoint that answers.
async fn send<F>(
    client: &reqwest::Client,
    endpoints: &[String],
    build: F,
) -> Result<reqwest::Response>
where
    F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
{
    let mut last_error = String::from("no endpoints");

    for endpoint in endpoints {
        match build(client, endpoint).send().await {
            Ok(response) => return Ok(response),
            Err(e) => {
                tracing::debug!(endpoint, error = %e, "etcd endpoint failed");
                last_error = e.to_string();
            }
        }
    }

    Err(StoreError::Unreachable { reason: last_error })
}

async fn decode(key: &str, response: reqwest::Response) -> Result<EtcdResponse> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| StoreError::Malformed(e.to_string()))?;

    if !status.is_success() {
        return Err(error_from_body(key, status.as_u16(), &body));
    }

    serde_json::from_slice(&body)
        .map_err(|e| StoreError::Malformed(format!("{}: {}", key, e)))
}

fn error_from_body(key: &str, status: u16, body: &[u8]) -> StoreError {
    match serde_json::from_slice::<EtcdErrorBody>(body) {
        Ok(err) => match err.error_code {
            KEY_NOT_FOUND => StoreError::NotFound {
                key: key.to_string(),
            },
            NODE_EXISTS => StoreError::AlreadyExists {
                key: key.to_string(),
            },
            code => StoreError::Api {
                code,
                key: key.to_string(),
                message: match err.cause {
                    Some(cause) => format!("{} ({})", err.message, cause),
                    None => err.message,
                },
            },
        },
        Err(_) => StoreError::Api {
            code: u64::from(status),
            key: key.to_string(),
            message: String::from_utf8_lossy(body).trim().to_string(),
        },
    }
}

fn key_url(endpoint: &str, key: &str) -> String {
    format!("{}/v2/keys/{}", endpoint, key.trim_start_matches('/'))
}

/// etcd TTLs are whole seconds; round sub-second TTLs up so they still expire.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> EtcdStore {
        EtcdStore::new(vec![server.uri()]).unwrap()
    }

    #[test]
    fn test_key_url_and_ttl() {
        assert_eq!(
            key_url("http://etcd:4001", "/forerunner/tag"),
            "http://etcd:4001/v2/keys/forerunner/tag"
        );
        assert_eq!(ttl_secs(Duration::from_secs(10)), 10);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
    }

    #[test]
    fn test_requires_an_endpoint() {
        let err = EtcdStore::new(vec![" ".to_string()]).unwrap_err();
        assert!(matches!(err, StoreError::Config { .. }));
    }

    #[tokio::test]
    async fn test_get_returns_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/forerunner/tag"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "action": "get",
                "node": {"key": "/forerunner/tag", "value": "v1", "modifiedIndex": 7}
            })))
            .mount(&server)
            .await;

        let value = store_for(&server).get("/forerunner/tag").await.unwrap();
        assert_eq!(value, "v1");
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/forerunner/env"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "errorCode": 100,
                "message": "Key not found",
                "cause": "/forerunner/env",
                "index": 12
            })))
            .mount(&server)
            .await;

        let err = store_for(&server).get("/forerunner/env").await.unwrap_err();
        assert!(err.is_not_found(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_set_sends_value_and_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/keys/vulcand/upstreams/api/endpoints/a1"))
            .and(body_string_contains("value=10.0.0.5%3A32768"))
            .and(body_string_contains("ttl=10"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "action": "set",
                "node": {"key": "/vulcand/upstreams/api/endpoints/a1", "value": "10.0.0.5:32768"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server)
            .set(
                "/vulcand/upstreams/api/endpoints/a1",
                "10.0.0.5:32768",
                Some(Duration::from_secs(10)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_exclusive_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/keys/forerunner/locks/api"))
            .and(query_param("prevExist", "false"))
            .respond_with(ResponseTemplate::new(412).set_body_json(serde_json::json!({
                "errorCode": 105,
                "message": "Key already exists",
                "cause": "/forerunner/locks/api",
                "index": 40
            })))
            .mount(&server)
            .await;

        let err = store_for(&server)
            .create_exclusive("/forerunner/locks/api", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.is_already_exists(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_unexpected_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/keys/forerunner/locks/api"))
            .respond_with(ResponseTemplate::new(500).set_body_string("raft down"))
            .mount(&server)
            .await;

        let err = store_for(&server)
            .delete("/forerunner/locks/api")
            .await
            .unwrap_err();
        match err {
            StoreError::Api { code, message, .. } => {
                assert_eq!(code, 500);
                assert_eq!(message, "raft down");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fails_over_to_next_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/forerunner/tag"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "action": "get",
                "node": {"key": "/forerunner/tag", "value": "v3"}
            })))
            .mount(&server)
            .await;

        // Nothing listens on port 1.
        let store = EtcdStore::new(vec!["http://127.0.0.1:1".to_string(), server.uri()])
            .unwrap()
            .with_request_timeout(Duration::from_secs(2));
        assert_eq!(store.get("/forerunner/tag").await.unwrap(), "v3");
    }

    #[tokio::test]
    async fn test_watch_yields_changes_until_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keys/forerunner/"))
            .and(query_param("wait", "true"))
            .and(query_param("recursive", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "action": "delete",
                "node": {"key": "/forerunner/tag", "modifiedIndex": 41}
            })))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let mut watch = store_for(&server).watch("/forerunner/", cancel.clone()).await;

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event, WatchEvent::removed("/forerunner/tag"));

        cancel.cancel();
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_sees_changes_made_before_first_poll() {
        let server = MockServer::start().await;
        // Plain read at watch time: the store is at index 41.
        Mock::given(method("GET"))
            .and(path("/v2/keys/forerunner/"))
            .respond_with(
                ResponseTemplate::new(404)
                    .insert_header(ETCD_INDEX_HEADER, "41")
                    .set_body_json(serde_json::json!({
                        "errorCode": 100,
                        "message": "Key not found",
                        "cause": "/forerunner",
                        "index": 41
                    })),
            )
            .mount(&server)
            .await;
        // The tag was written at 42, after the watch was set but before
        // anything polled it.
        Mock::given(method("GET"))
            .and(path("/v2/keys/forerunner/"))
            .and(query_param("wait", "true"))
            .and(query_param("waitIndex", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "action": "set",
                "node": {"key": "/forerunner/tag", "value": "v2", "modifiedIndex": 42}
            })))
            .with_priority(1)
            .expect(1..)
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let store = store_for(&server);
        let mut watch = store.watch("/forerunner/", cancel.clone()).await;

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event, WatchEvent::set("/forerunner/tag", "v2"));
        cancel.cancel();
    }
}
