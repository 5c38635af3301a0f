//! Telnyx Call Control REST client.

use async_trait::async_trait;
use patient_sim_core::bridge::CallControl;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TelnyxError {
    #[error("Telnyx request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telnyx API returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

/// Parameters for originating an outbound call.
#[derive(Debug, Clone, Serialize)]
pub struct CreateCall<'a> {
    pub to: &'a str,
    pub from: &'a str,
    pub connection_id: &'a str,
    pub webhook_url: &'a str,
}

/// The parts of a created call the service keeps.
#[derive(Debug, Clone, Deserialize)]
pub struct CallInfo {
    pub call_control_id: String,
    #[serde(default)]
    pub call_leg_id: Option<String>,
    #[serde(default)]
    pub call_session_id: Option<String>,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug)]
pub struct TelnyxClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl TelnyxClient {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self, TelnyxError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, TelnyxError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "Telnyx request");
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, "Telnyx API error");
            return Err(TelnyxError::Api { status, body });
        }
        Ok(response.json().await?)
    }

    /// Places an outbound call.
    pub async fn create_call(&self, call: &CreateCall<'_>) -> Result<CallInfo, TelnyxError> {
        let envelope: DataEnvelope<CallInfo> = self.post("/calls", call).await?;
        Ok(envelope.data)
    }

    /// Starts bidirectional u-law streaming of the call to `stream_url`.
    pub async fn stream_start(
        &self,
        call_control_id: &str,
        stream_url: &str,
    ) -> Result<(), TelnyxError> {
        let path = format!("/calls/{call_control_id}/actions/streaming_start");
        let _: serde_json::Value = self.post(&path, &streaming_start_body(stream_url)).await?;
        Ok(())
    }

    pub async fn hangup(&self, call_control_id: &str) -> Result<(), TelnyxError> {
        let path = format!("/calls/{call_control_id}/actions/hangup");
        let _: serde_json::Value = self.post(&path, &json!({})).await?;
        Ok(())
    }
}

fn streaming_start_body(stream_url: &str) -> serde_json::Value {
    json!({
        "stream_url": stream_url,
        "stream_track": "inbound_track",
        "stream_bidirectional_mode": "rtp",
        "stream_bidirectional_codec": "PCMU",
    })
}

#[async_trait]
impl CallControl for TelnyxClient {
    async fn hangup(&self, call_id: &str) -> anyhow::Result<()> {
        TelnyxClient::hangup(self, call_id).await?;
        Ok(())
    }
}
