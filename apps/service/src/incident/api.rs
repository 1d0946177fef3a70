use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::monitoring::types::MonitorId;

#[derive(Debug, Error)]
pub enum IncidentApiError {
    #[error("incident API request timed out after {0:?}")]
    Timeout(Duration),

    #[error("incident API request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("incident API answered {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("incident API response carried no incidentId")]
    MissingIncidentId,

    #[error("incident API endpoint not configured")]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    Identified,
    Investigating,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentImpact {
    Major,
}

/// Body sent to the external incident system, for both creation and updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<MonitorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,
    pub region: String,
    pub title: String,
    pub description: String,
    pub updated_by: String,
    pub incident_status: IncidentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_impact: Option<IncidentImpact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedIncident {
    incident_id: Option<serde_json::Value>,
}

/// External incident-management system
#[async_trait]
pub trait IncidentApi: Send + Sync {
    /// `false` when no endpoint is configured; callers then skip every call
    fn is_enabled(&self) -> bool;

    /// Open an incident and return its external id. Fails with
    /// [`IncidentApiError::Disabled`] when no endpoint is configured.
    async fn create_incident(&self, request: &IncidentRequest) -> Result<String, IncidentApiError>;

    /// Update (or resolve) an existing incident. Also fails with `Disabled`
    /// without an endpoint.
    async fn update_incident(&self, request: &IncidentRequest) -> Result<(), IncidentApiError>;
}

/// JSON-over-HTTP client: `POST` creates (201), `PUT` updates (200)
pub struct HttpIncidentApi {
    client: reqwest::Client,
    endpoint: Option<String>,
    timeout: Duration,
}

impl HttpIncidentApi {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Result<Self, IncidentApiError> {
        let client =
            reqwest::Client::builder().timeout(timeout).build().map_err(IncidentApiError::Transport)?;
        let endpoint = endpoint.filter(|url| !url.trim().is_empty());

        Ok(Self { client, endpoint, timeout })
    }

    fn map_error(&self, err: reqwest::Error) -> IncidentApiError {
        if err.is_timeout() { IncidentApiError::Timeout(self.timeout) } else { IncidentApiError::Transport(err) }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        expected: StatusCode,
    ) -> Result<String, IncidentApiError> {
        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_error(e))?;

        if status != expected {
            return Err(IncidentApiError::UnexpectedStatus { status: status.as_u16(), body });
        }

        Ok(body)
    }
}

#[async_trait]
impl IncidentApi for HttpIncidentApi {
    fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn create_incident(&self, request: &IncidentRequest) -> Result<String, IncidentApiError> {
        let Some(endpoint) = &self.endpoint else {
            debug!("Incident endpoint not configured, skipping create");
            return Err(IncidentApiError::Disabled);
        };

        let body = self.send(self.client.post(endpoint).json(request), StatusCode::CREATED).await?;
        let created: CreatedIncident =
            serde_json::from_str(&body).map_err(|_| IncidentApiError::MissingIncidentId)?;

        // Some deployments return the id as a number
        match created.incident_id {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id),
            Some(serde_json::Value::Number(id)) => Ok(id.to_string()),
            _ => Err(IncidentApiError::MissingIncidentId),
        }
    }

    async fn update_incident(&self, request: &IncidentRequest) -> Result<(), IncidentApiError> {
        let Some(endpoint) = &self.endpoint else {
            debug!("Incident endpoint not configured, skipping update");
            return Err(IncidentApiError::Disabled);
        };

        self.send(self.client.put(endpoint).json(request), StatusCode::OK).await?;
        Ok(())
    }
}
