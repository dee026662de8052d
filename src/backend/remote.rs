//! Remote data API backend
//!
//! Talks to the tracker's data server:
//! - `GET /api/data` returns the four collections
//! - `POST /api/save` replaces them wholesale

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{Backend, BackendError};
use crate::types::{Snapshot, StoreData};

/// Snapshots above this size are refused before any request is made.
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

pub struct RemoteBackend {
    base_url: String,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl RemoteBackend {
    pub fn new(connection_string: &str, timeout: Duration) -> Self {
        let base_url = if connection_string.starts_with("http") {
            connection_string.to_string()
        } else {
            format!("http://{}", connection_string)
        };
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn read_body(response: ureq::Response) -> Result<String, BackendError> {
        response
            .into_string()
            .map_err(|e| BackendError::Transport(format!("Failed to read response: {}", e)))
    }
}

fn map_ureq_error(context: &str, error: ureq::Error) -> BackendError {
    match error {
        ureq::Error::Status(status, response) => BackendError::Status {
            status,
            message: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => {
            BackendError::Transport(format!("{}: {}", context, transport))
        }
    }
}

impl Backend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn load(&self) -> Result<Option<Snapshot>, BackendError> {
        let url = format!("{}/api/data", self.base_url);
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| map_ureq_error("Failed to load data", e))?;
        let text = Self::read_body(response)?;

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::Transport(format!("Malformed data response: {}", e)))?;
        if !body.is_object() {
            return Err(BackendError::Transport(
                "Data response is not a JSON object".to_string(),
            ));
        }

        // Missing or non-array collections read as empty.
        let data: StoreData = serde_json::from_value(body)
            .map_err(|e| BackendError::Transport(format!("Unreadable data response: {}", e)))?;
        if data.is_empty() {
            // A server that was never saved to answers with empty lists.
            debug!("server holds no data yet");
            return Ok(None);
        }
        info!(
            plans = data.plans.len(),
            projects = data.projects.len(),
            tasks = data.tasks.len(),
            records = data.records.len(),
            "loaded data from server"
        );
        Ok(Some(Snapshot {
            data,
            timestamp: None,
            version: None,
        }))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), BackendError> {
        let body = serde_json::to_string(&snapshot.data)?;
        if body.len() > MAX_PAYLOAD_BYTES {
            return Err(BackendError::PayloadTooLarge {
                size: body.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        let url = format!("{}/api/save", self.base_url);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|e| map_ureq_error("Failed to save data", e))?;
        let text = Self::read_body(response)?;

        let result: SaveResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::Transport(format!("Malformed save response: {}", e)))?;
        if result.status != "success" {
            return Err(BackendError::Rejected(
                result.message.unwrap_or(result.status),
            ));
        }
        debug!(bytes = body.len(), message = ?result.message, "saved data to server");
        Ok(())
    }
}
