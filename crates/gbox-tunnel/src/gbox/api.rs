use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::gbox::tunnel::profile::TunnelProfile;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("gbox api: no api key configured (set GBOX_API_KEY or [api].api_key)")]
    MissingApiKey,
    #[error("gbox api: no base url configured (set GBOX_BASE_URL or [api].base_url)")]
    MissingBaseUrl,
    #[error("gbox api: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gbox api: {op}: unexpected status {status}: {body}")]
    Status {
        op: &'static str,
        status: u16,
        body: String,
    },
    #[error("gbox api: decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("gbox api: response carried an empty tunnel url")]
    EmptyUrl,
    #[error("box {0} not found")]
    BoxNotFound(String),
    #[error("box {box_id} is not running (status: {state})")]
    BoxNotRunning { box_id: String, state: String },
}

/// Exchanges credentials for a short-lived tunnel URL.
#[async_trait]
pub trait TunnelUrlProvider: Send + Sync {
    async fn tunnel_url(&self, box_id: &str, ports: &[u16]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxStatus {
    Running,
    /// Exists but is not running; carries the reported state.
    NotRunning(String),
    NotFound,
}

impl BoxStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, BoxStatus::Running)
    }
}

/// Answers "does box X exist and is it running?".
#[async_trait]
pub trait BoxLookup: Send + Sync {
    async fn box_status(&self, box_id: &str) -> anyhow::Result<BoxStatus>;
}

/// Fails unless `box_id` exists and is running.
pub async fn ensure_running(lookup: &dyn BoxLookup, box_id: &str) -> anyhow::Result<()> {
    let status = lookup
        .box_status(box_id)
        .await
        .with_context(|| format!("check box {box_id}"))?;
    match status {
        BoxStatus::Running => Ok(()),
        BoxStatus::NotFound => Err(ApiError::BoxNotFound(box_id.to_string()).into()),
        BoxStatus::NotRunning(state) => Err(ApiError::BoxNotRunning {
            box_id: box_id.to_string(),
            state: if state.is_empty() { "unknown".to_string() } else { state },
        }
        .into()),
    }
}

#[derive(Debug, Serialize)]
struct PortForwardUrlRequest<'a> {
    ports: &'a [u16],
}

#[derive(Debug, Deserialize)]
struct PortForwardUrlResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct BoxResponse {
    #[serde(default)]
    status: String,
}

#[derive(Clone)]
pub struct GboxApi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    prefix: &'static str,
}

impl std::fmt::Debug for GboxApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GboxApi")
            .field("base_url", &self.base_url)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl GboxApi {
    pub fn new(
        base_url: &str,
        api_key: &str,
        profile: TunnelProfile,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ApiError::MissingBaseUrl);
        }
        let api_key = api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(ApiError::MissingApiKey);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
            prefix: profile.api_prefix(),
        })
    }

    fn box_url(&self, box_id: &str) -> String {
        format!("{}{}/boxes/{}", self.base_url, self.prefix, box_id)
    }

    pub async fn port_forward_url(&self, box_id: &str, ports: &[u16]) -> Result<String, ApiError> {
        let resp = self
            .http
            .post(format!("{}/port-forward-url", self.box_url(box_id)))
            .bearer_auth(&self.api_key)
            .json(&PortForwardUrlRequest { ports })
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if status != StatusCode::CREATED {
            return Err(ApiError::Status {
                op: "port-forward-url",
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let parsed: PortForwardUrlResponse = serde_json::from_str(&body)?;
        let url = parsed.url.trim().to_string();
        if url.is_empty() {
            return Err(ApiError::EmptyUrl);
        }
        Ok(url)
    }

    pub async fn get_box_status(&self, box_id: &str) -> Result<BoxStatus, ApiError> {
        let resp = self
            .http
            .get(self.box_url(box_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(BoxStatus::NotFound);
        }
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                op: "get box",
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let parsed: BoxResponse = serde_json::from_str(&body)?;
        let state = parsed.status.trim().to_ascii_lowercase();
        if state == "running" {
            Ok(BoxStatus::Running)
        } else {
            Ok(BoxStatus::NotRunning(state))
        }
    }
}

#[async_trait]
impl TunnelUrlProvider for GboxApi {
    async fn tunnel_url(&self, box_id: &str, ports: &[u16]) -> anyhow::Result<String> {
        Ok(self.port_forward_url(box_id, ports).await?)
    }
}

#[async_trait]
impl BoxLookup for GboxApi {
    async fn box_status(&self, box_id: &str) -> anyhow::Result<BoxStatus> {
        Ok(self.get_box_status(box_id).await?)
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 256;
    let body = body.trim();
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path},
    };

    use super::*;

    fn api(server: &MockServer, profile: TunnelProfile) -> GboxApi {
        GboxApi::new(&server.uri(), "k-123", profile, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn port_forward_url_posts_ports_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/boxes/b1/port-forward-url"))
            .and(header("authorization", "Bearer k-123"))
            .and(body_json(json!({"ports": [5555, 8080]})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"url": "wss://t.example/x?token=1"})))
            .expect(1)
            .mount(&server)
            .await;

        let url = api(&server, TunnelProfile::PortForward)
            .tunnel_url("b1", &[5555, 8080])
            .await
            .unwrap();
        assert_eq!(url, "wss://t.example/x?token=1");
    }

    #[tokio::test]
    async fn adb_profile_uses_versioned_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/boxes/b2/port-forward-url"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"url": "wss://adb"})))
            .expect(1)
            .mount(&server)
            .await;

        let url = api(&server, TunnelProfile::Adb)
            .port_forward_url("b2", &[5555])
            .await
            .unwrap();
        assert_eq!(url, "wss://adb");
    }

    #[tokio::test]
    async fn non_created_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"url": "wss://x"})))
            .mount(&server)
            .await;

        let err = api(&server, TunnelProfile::PortForward)
            .port_forward_url("b1", &[1])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 200, .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_or_empty_url_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/boxes/none/port-forward-url"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"other": 1})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/boxes/empty/port-forward-url"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"url": "  "})))
            .mount(&server)
            .await;

        let a = api(&server, TunnelProfile::PortForward);
        let err = a.port_forward_url("none", &[1]).await.unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
        assert!(err.to_string().contains("url"));

        let err = a.port_forward_url("empty", &[1]).await.unwrap_err();
        assert!(matches!(err, ApiError::EmptyUrl));
    }

    #[tokio::test]
    async fn box_status_maps_running_stopped_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boxes/up"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "up", "status": "Running"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/boxes/down"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "down", "status": "stopped"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/boxes/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let a = api(&server, TunnelProfile::PortForward);
        assert_eq!(a.box_status("up").await.unwrap(), BoxStatus::Running);
        assert_eq!(
            a.box_status("down").await.unwrap(),
            BoxStatus::NotRunning("stopped".into())
        );
        assert_eq!(a.box_status("gone").await.unwrap(), BoxStatus::NotFound);
    }

    #[tokio::test]
    async fn ensure_running_rejects_missing_and_stopped_boxes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/boxes/up"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "running"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/boxes/down"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "stopped"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/boxes/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/boxes/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let a = api(&server, TunnelProfile::Adb);
        ensure_running(&a, "up").await.unwrap();

        let err = ensure_running(&a, "ghost").await.unwrap_err();
        assert_eq!(err.to_string(), "box ghost not found");

        let err = ensure_running(&a, "down").await.unwrap_err();
        assert_eq!(err.to_string(), "box down is not running (status: stopped)");

        let err = ensure_running(&a, "broken").await.unwrap_err();
        assert!(format!("{err:#}").starts_with("check box broken"), "{err:#}");
    }

    #[test]
    fn new_requires_key_and_base_url() {
        let t = Duration::from_secs(1);
        assert!(matches!(
            GboxApi::new("https://api", " ", TunnelProfile::Adb, t),
            Err(ApiError::MissingApiKey)
        ));
        assert!(matches!(
            GboxApi::new("", "k", TunnelProfile::Adb, t),
            Err(ApiError::MissingBaseUrl)
        ));
        let a = GboxApi::new("https://api.example/", "k", TunnelProfile::Adb, t).unwrap();
        assert_eq!(a.box_url("b"), "https://api.example/api/v1/boxes/b");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(300);
        let t = truncate(&s);
        assert!(t.ends_with("..."));
        assert!(t.len() <= 256 + 3);
    }
}
