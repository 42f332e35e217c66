//! REST-backed hub client.
//!
//! Covers the hub's HTTP API: `/api/states`, `/api/services`, and
//! `POST /api/services/<domain>/<service>`. The event bus rides the hub's
//! WebSocket transport, which lives outside this crate; the transport
//! feeds events in through [`RestHub::event_sender`].

use tokio::sync::broadcast;

use crate::types::{CallServiceRequest, EntityState, HubEvent, ServiceCatalog, ServiceDef};
use crate::{HubClient, HubError};

/// Hub client over the hub's REST API.
pub struct RestHub {
    client: reqwest::Client,
    base_url: String,
    token: String,
    events: broadcast::Sender<HubEvent>,
}

impl RestHub {
    /// Create a client for the hub at `base_url` using a bearer token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            events,
        }
    }

    /// Sender half of the event bus, for the WebSocket transport to feed.
    pub fn event_sender(&self) -> broadcast::Sender<HubEvent> {
        self.events.clone()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, HubError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| HubError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(HubError::AuthFailed(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::RequestFailed(format!("HTTP {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| HubError::InvalidResponse(e.to_string()))
    }
}

/// Wire shape of one entry in `/api/services`.
#[derive(serde::Deserialize)]
struct ServiceDomainEntry {
    domain: String,
    services: std::collections::BTreeMap<String, ServiceDef>,
}

#[async_trait::async_trait]
impl HubClient for RestHub {
    async fn fetch_states(&self) -> Result<Vec<EntityState>, HubError> {
        self.get_json("/api/states").await
    }

    async fn fetch_services(&self) -> Result<ServiceCatalog, HubError> {
        let entries: Vec<ServiceDomainEntry> = self.get_json("/api/services").await?;
        Ok(entries
            .into_iter()
            .map(|e| (e.domain, e.services))
            .collect())
    }

    async fn call_service(
        &self,
        request: CallServiceRequest,
    ) -> Result<Option<serde_json::Value>, HubError> {
        let mut body = match request.service_data.clone() {
            Some(serde_json::Value::Object(map)) => map,
            Some(other) => {
                tracing::warn!(data = %other, "non-object service_data dropped");
                serde_json::Map::new()
            }
            None => serde_json::Map::new(),
        };
        if let Some(target) = &request.target {
            body.insert(
                "entity_id".into(),
                serde_json::to_value(&target.entity_id)
                    .map_err(|e| HubError::InvalidResponse(e.to_string()))?,
            );
        }

        let mut url = format!(
            "{}/api/services/{}/{}",
            self.base_url, request.domain, request.service
        );
        if request.return_response {
            url.push_str("?return_response");
        }

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| HubError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(HubError::UnknownService {
                domain: request.domain,
                service: request.service,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::RequestFailed(format!("HTTP {status}: {body}")));
        }

        if request.return_response {
            let value = response
                .json()
                .await
                .map_err(|e| HubError::InvalidResponse(e.to_string()))?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }
}
