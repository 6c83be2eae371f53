use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SlackApiError {
    #[error("slack bot API token is not set")]
    MissingToken,
    #[error("slack API client setup failed: {0}")]
    Client(String),
    #[error("network error calling {method}: {message}")]
    Network { method: String, message: String },
}

/// Result of a Web API call. Slack reports most failures as HTTP 200 with
/// `ok: false`, so callers check [`ApiResponse::ok`] rather than the status.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: u16,
    data: Value,
}

impl ApiResponse {
    fn from_body(status: u16, body: &str) -> Self {
        let data = match serde_json::from_str::<Value>(body) {
            Ok(v) => v,
            Err(err) => {
                warn!(status, error = %err, "failed to parse slack API response");
                json!({"ok": false, "error": "invalid_json_response"})
            }
        };
        Self { status, data }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn ok(&self) -> bool {
        self.status == 200 && self.data.get("ok").and_then(Value::as_bool) == Some(true)
    }

    pub fn error(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// `view.id` of a views.* response.
    pub fn view_id(&self) -> Option<String> {
        self.data
            .pointer("/view/id")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    }
}

pub struct SlackApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl SlackApiClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, SlackApiError> {
        if token.trim().is_empty() {
            return Err(SlackApiError::MissingToken);
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SlackApiError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        })
    }

    pub async fn views_open(&self, trigger_id: &str, view: &Value) -> Result<ApiResponse, SlackApiError> {
        self.call("views.open", json!({"trigger_id": trigger_id, "view": view}))
            .await
    }

    pub async fn views_update(&self, view_id: &str, view: &Value) -> Result<ApiResponse, SlackApiError> {
        self.call("views.update", json!({"view_id": view_id, "view": view}))
            .await
    }

    pub async fn views_publish(&self, user_id: &str, view: &Value) -> Result<ApiResponse, SlackApiError> {
        self.call("views.publish", json!({"user_id": user_id, "view": view}))
            .await
    }

    pub async fn chat_post_message(
        &self,
        channel: &str,
        text: &str,
        blocks: Option<&Value>,
    ) -> Result<ApiResponse, SlackApiError> {
        let mut body = json!({"channel": channel, "text": text});
        if let Some(blocks) = blocks {
            body["blocks"] = blocks.clone();
        }
        self.call("chat.postMessage", body).await
    }

    async fn call(&self, method: &str, body: Value) -> Result<ApiResponse, SlackApiError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SlackApiError::Network {
                method: method.to_string(),
                message: e.to_string(),
            })?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| SlackApiError::Network {
            method: method.to_string(),
            message: e.to_string(),
        })?;
        debug!(method, status, "slack API call finished");
        Ok(ApiResponse::from_body(status, &text))
    }
}
