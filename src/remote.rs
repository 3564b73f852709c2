//! HTTP client for the remote processing server.
//!
//! All calls treat the server as unreliable and map failures to explicit
//! outcome variants instead of bubbling raw errors into stage code.
#![allow(non_snake_case)]
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload of `POST /check_model`. Field names are the server's wire names.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CheckModelRequest {
    pub id_client: String,
    pub ManufacturerModelName: String,
    pub ReconstructionMethod: String,
    pub Iteraciones: i64,
    pub Subsets: i64,
    pub VoxelSpacing: String,
    pub SliceThickness: f64,
    pub Radiofarmaco: String,
    pub HalfLife: f64,
}

/// Processing metadata shipped with `POST /processing`.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ProcessingMetadata {
    pub ManufacturerModelName: String,
    pub ReconstructionMethod: String,
    pub Iteraciones: i64,
    pub Subsets: i64,
    pub VoxelSpacing: String,
    pub SliceThickness: f64,
    pub Radiofarmaco: String,
    pub HalfLife: f64,
    pub radiopharmaceutical_dose: f64,
    pub radiopharmaceutical_start: String,
    pub StudyInstanceUID: String,
    pub SeriesInstanceUID: String,
    pub StudyDate: String,
    pub SeriesTime: String,
    pub weight: i64,
    pub height: i64,
    pub age: i64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ProcessingRequest {
    pub input_file: String,
    pub client_port: u16,
    pub client_id: String,
    pub metadata: ProcessingMetadata,
}

#[derive(Debug, Deserialize)]
struct ProcessingResponse {
    response: String,
}

/// Outcome of the remote model check.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CheckModelOutcome {
    Accepted,
    Rejected { code: u16, message: String },
    ConnectionFailed(String),
    BadResponse(String),
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum NotifyError {
    #[error("no connection to the remote server: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("unexpected response from the remote server: {0}")]
    BadResponse(String),
}

/// Operator-facing explanation of a `/check_model` rejection code.
fn rejection_message(code: u16, radiopharmaceutical: &str) -> String {
    match code {
        405 => "You do not have an active license.".to_string(),
        406 => format!(
            "You do not have an active license for the radiopharmaceutical {radiopharmaceutical}."
        ),
        _ => "There is no trained processing algorithm for these reconstruction settings or \
              this radiopharmaceutical."
            .to_string(),
    }
}

#[derive(Clone)]
pub(crate) struct RemoteClient {
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Ask whether the server has a trained model for these recon settings.
    pub async fn check_model(
        &self,
        server_url: &str,
        request: &CheckModelRequest,
    ) -> CheckModelOutcome {
        let url = format!("http://{server_url}/check_model");
        let response = match self.http.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(e) => return CheckModelOutcome::ConnectionFailed(e.to_string()),
        };
        match response.status().as_u16() {
            200 => CheckModelOutcome::Accepted,
            code @ (405 | 406 | 407) => CheckModelOutcome::Rejected {
                code,
                message: rejection_message(code, &request.Radiofarmaco),
            },
            other => CheckModelOutcome::BadResponse(format!("unexpected status code {other}")),
        }
    }

    /// Announce an uploaded archive. The server answers `{"response":"Processing"}`.
    pub async fn notify_processing(
        &self,
        server_url: &str,
        request: &ProcessingRequest,
    ) -> Result<(), NotifyError> {
        let url = format!("http://{server_url}/processing");
        let response = self.http.post(&url).json(request).send().await?;
        let body: ProcessingResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::BadResponse(e.to_string()))?;
        if body.response == "Processing" {
            Ok(())
        } else {
            Err(NotifyError::BadResponse(body.response))
        }
    }

    /// Liveness probe with a 5 second deadline.
    pub async fn check_ping(&self, server_url: &str) -> bool {
        let url = format!("http://{server_url}/check_ping");
        match self.http.get(&url).timeout(PING_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("ping failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_messages() {
        assert!(rejection_message(405, "FDG").contains("active license"));
        assert!(rejection_message(406, "FDG").contains("FDG"));
        assert!(rejection_message(407, "FDG").contains("no trained processing algorithm"));
    }
}
