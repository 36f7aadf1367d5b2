//! Serializable health snapshot of one session

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EndpointConfig;
use crate::coordinator::CoordinatorStatus;
use crate::hub::HubStatus;

const REDACTED: &str = "***REDACTED***";

/// Connection section of [`SessionDiagnostics`]
#[derive(Debug, Clone, Serialize)]
pub struct HubDiagnostics {
    pub host: String,
    pub port: u16,
    pub ams_net_id: String,
    #[serde(flatten)]
    pub status: HubStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub generated_at: DateTime<Utc>,
    pub hub: HubDiagnostics,
    pub coordinator: CoordinatorStatus,
}

impl SessionDiagnostics {
    pub fn new(endpoint: &EndpointConfig, hub: HubStatus, coordinator: CoordinatorStatus) -> Self {
        Self {
            generated_at: Utc::now(),
            hub: HubDiagnostics {
                host: endpoint.host.clone(),
                port: endpoint.port,
                ams_net_id: endpoint.ams_net_id.clone(),
                status: hub,
            },
            coordinator,
        }
    }

    /// Copy with the controller's network identity masked, for sharing
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.hub.host = REDACTED.to_string();
        copy.hub.ams_net_id = REDACTED.to_string();
        copy
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
