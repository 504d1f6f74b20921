//! HTTP + SSE transport for the Spatia service.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::RawFrame;
use crate::queue::{ApiResponse, Dispatch, RequestSpec};
use crate::supervisor::{EventStreamConnector, HealthProbe, HealthReport};

pub const HEALTH_PATH: &str = "api/health";
pub const EVENTS_PATH: &str = "api/events";

/// Lifecycle signals of one event-stream connection. A stream ends after
/// yielding `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Opened,
    Frame(RawFrame),
    Failed(String),
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base: Url,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
    #[serde(default)]
    workspace: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        // No client-wide timeout: it would also cut the long-lived event stream.
        let http = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base: config.base()?,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn event_source(&self) -> SyncResult<EventSource> {
        let request = self.http.get(self.url(EVENTS_PATH)?);
        EventSource::new(request)
            .map_err(|err| SyncError::Config(format!("event stream request: {err:?}")))
    }

    fn url(&self, path: &str) -> SyncResult<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| SyncError::Config(format!("invalid request path {path}: {err}")))
    }
}

#[async_trait]
impl Dispatch for HttpTransport {
    async fn dispatch(&self, request: RequestSpec) -> SyncResult<ApiResponse> {
        let url = self.url(&request.path)?;
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .timeout(self.request_timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let res = builder.send().await?;
        let status = res.status();
        let text = res.text().await?;
        debug!(
            target: "spatia.http",
            method = %request.method,
            path = %request.path,
            status = status.as_u16(),
            "request completed"
        );

        if !status.is_success() {
            return Err(SyncError::from_status(status.as_u16(), &text));
        }
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|err| SyncError::InvalidResponse(err.to_string()))?
        };
        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpTransport {
    async fn probe(&self) -> SyncResult<HealthReport> {
        let res = self.http.get(self.url(HEALTH_PATH)?).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), &body));
        }
        let body: HealthBody = res
            .json()
            .await
            .map_err(|err| SyncError::InvalidResponse(err.to_string()))?;
        if body.status != "ok" {
            return Err(SyncError::UnexpectedStatus {
                status: status.as_u16(),
                body: format!("health status {}", body.status),
            });
        }
        Ok(HealthReport {
            workspace: body.workspace,
        })
    }
}

impl EventStreamConnector for HttpTransport {
    fn connect(&self) -> BoxStream<'static, StreamSignal> {
        let source = match self.event_source() {
            Ok(source) => source,
            Err(err) => {
                let failed = StreamSignal::Failed(err.to_string());
                return stream::iter(vec![failed]).boxed();
            }
        };

        stream::unfold(Some(source), |state| async move {
            let mut source = state?;
            match source.next().await {
                Some(Ok(Event::Open)) => Some((StreamSignal::Opened, Some(source))),
                Some(Ok(Event::Message(message))) => Some((
                    StreamSignal::Frame(RawFrame {
                        event: message.event,
                        data: message.data,
                    }),
                    Some(source),
                )),
                Some(Err(err)) => {
                    warn!(target: "spatia.http", error = %err, "event stream error");
                    source.close();
                    Some((StreamSignal::Failed(err.to_string()), None))
                }
                None => Some((StreamSignal::Failed("event stream ended".into()), None)),
            }
        })
        .boxed()
    }
}
