use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SharedConfig;
use crate::identity::DeviceId;
use crate::util::http::InvalidUriError;

/// Device-class tag sent with registration.
const DEVICE_TYPE: &str = "raspberry_pi_4";

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid endpoint URI: {0}")]
    InvalidEndpoint(#[from] InvalidUriError),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("cloud returned ({0}) {1}")]
    Status(StatusCode, String),
}

/// Client for the cloud API.
///
/// The endpoint base is read from the shared config on every call, so a
/// credentials write that changes `apiBaseUrl` takes effect for the
/// registration in the same write.
pub struct Remote {
    client: reqwest::Client,
    config: SharedConfig,
    identifier: DeviceId,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    #[serde(rename = "inviteCode")]
    invite_code: &'a str,
    identifier: &'a str,
    name: &'a str,
    #[serde(rename = "type")]
    device_type: &'a str,
}

#[derive(Serialize)]
struct HeartbeatRequest<'a> {
    identifier: &'a str,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    identifier: &'a str,
    #[serde(rename = "type")]
    device_type: &'a str,
    data: &'a Value,
    #[serde(rename = "gatewayIdentifier")]
    gateway_identifier: &'a str,
}

impl Remote {
    pub fn new(config: SharedConfig, identifier: DeviceId) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            identifier,
        }
    }

    /// Register this gateway against an invite code.
    ///
    /// Success is an explicit 200/201 from the cloud; anything else is an
    /// error carrying whatever the cloud had to say.
    pub async fn register(&self, invite_code: &str, name: &str) -> Result<(), RequestError> {
        let endpoint = self.endpoint("/gateways/register").await?;
        debug!("registering with {endpoint}");

        let response = self
            .client
            .post(endpoint.to_string())
            .timeout(REGISTER_TIMEOUT)
            .json(&RegisterRequest {
                invite_code,
                identifier: self.identifier.as_str(),
                name,
                device_type: DEVICE_TYPE,
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RequestError::Status(status, body))
            }
        }
    }

    /// Forward one discovery event, wrapped in the routing envelope the
    /// cloud expects: normalized identifier/type on top, the original
    /// payload complete under `data`, and this gateway as the routing key.
    pub async fn submit(
        &self,
        identifier: &str,
        device_type: &str,
        data: &Value,
    ) -> Result<(), RequestError> {
        let endpoint = self.endpoint("/devices").await?;

        let response = self
            .client
            .post(endpoint.to_string())
            .timeout(SUBMIT_TIMEOUT)
            .json(&SubmitRequest {
                identifier,
                device_type,
                data,
                gateway_identifier: self.identifier.as_str(),
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RequestError::Status(status, body))
            }
        }
    }

    /// Fire-and-forget liveness ping. Failures are logged and swallowed.
    pub async fn heartbeat(&self) {
        let endpoint = match self.endpoint("/gateways/heartbeat").await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!("heartbeat endpoint: {err}");
                return;
            }
        };

        let result = self
            .client
            .post(endpoint.to_string())
            .timeout(HEARTBEAT_TIMEOUT)
            .json(&HeartbeatRequest {
                identifier: self.identifier.as_str(),
            })
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => debug!("heartbeat sent"),
            Ok(response) => warn!("heartbeat rejected: {}", response.status()),
            Err(err) => warn!("heartbeat failed: {err}"),
        }
    }

    async fn endpoint(&self, path: &str) -> Result<crate::util::http::Uri, InvalidUriError> {
        self.config.snapshot().await.api_endpoint.join(path)
    }
}
