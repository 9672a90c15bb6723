//! Chat platform gateway.
//!
//! [`PlatformGateway`] is the only way to reach the platform's REST API:
//! the client type is private to this module and every call goes through
//! the dispatch queue. A 429 response surfaces as
//! [`AppError::RateLimited`]; retrying after the cooldown is up to the
//! caller.

use std::sync::Arc;
use std::time::Duration;

use proofbot_common::{AppError, AppResult, PlatformConfig};
use proofbot_queue::{DispatchQueue, TaskHandle};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Cooldown assumed when a 429 carries no usable hint.
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

/// A platform user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformUser {
    /// Snowflake id.
    pub id: String,
    /// Account name.
    pub username: String,
    /// Display name, when set.
    #[serde(default)]
    pub global_name: Option<String>,
}

/// A channel (guild channel or private thread).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Snowflake id.
    pub id: String,
}

/// A sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    /// Snowflake id.
    pub id: String,
    /// Channel the message was posted in.
    pub channel_id: String,
}

struct PlatformClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl PlatformClient {
    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> AppResult<T> {
        let response = builder
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|e| AppError::ExternalService(format!("Platform request failed: {e}")))?;

        let status = response.status();
        if let Some(err) = map_status(status, response.headers()) {
            return Err(err);
        }

        response
            .json()
            .await
            .map_err(|e| AppError::ExternalService(format!("Malformed platform response: {e}")))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base.trim_end_matches('/'))
    }

    async fn send_message(&self, channel_id: &str, content: &str) -> AppResult<MessageRef> {
        let builder = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/messages")))
            .json(&json!({ "content": content }));
        self.request(builder).await
    }

    async fn create_dm(&self, user_id: &str) -> AppResult<Channel> {
        let builder = self
            .http
            .post(self.url("/users/@me/channels"))
            .json(&json!({ "recipient_id": user_id }));
        self.request(builder).await
    }

    async fn fetch_user(&self, user_id: &str) -> AppResult<PlatformUser> {
        let builder = self.http.get(self.url(&format!("/users/{user_id}")));
        self.request(builder).await
    }
}

/// Map a non-success response to an error. `None` for success.
#[must_use]
pub fn map_status(status: StatusCode, headers: &HeaderMap) -> Option<AppError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_ms = headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map_or(DEFAULT_RETRY_AFTER_MS, |secs| (secs * 1000.0).ceil() as u64);
        warn!(retry_after_ms, "Platform rate limit hit");
        return Some(AppError::RateLimited { retry_after_ms });
    }
    if status == StatusCode::NOT_FOUND {
        return Some(AppError::NotFound("Platform resource".to_string()));
    }
    Some(AppError::ExternalService(format!(
        "Platform responded with {status}"
    )))
}

/// Rate-limited access to the chat platform.
#[derive(Clone)]
pub struct PlatformGateway {
    client: Arc<PlatformClient>,
    dispatch: DispatchQueue,
}

impl PlatformGateway {
    /// Build the gateway. Returns `None` when no token is configured.
    pub fn from_config(config: &PlatformConfig, dispatch: DispatchQueue) -> AppResult<Option<Self>> {
        let Some(token) = config.token.clone() else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("proofbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Some(Self {
            client: Arc::new(PlatformClient {
                http,
                api_base: config.api_base.clone(),
                token,
            }),
            dispatch,
        }))
    }

    /// Post a message to a channel.
    pub fn send_message(&self, channel_id: &str, content: &str) -> TaskHandle<MessageRef> {
        let client = self.client.clone();
        let channel_id = channel_id.to_string();
        let content = content.to_string();
        self.dispatch
            .submit(move || async move { client.send_message(&channel_id, &content).await })
    }

    /// Open (or fetch) the private channel with a user.
    pub fn create_dm(&self, user_id: &str) -> TaskHandle<Channel> {
        let client = self.client.clone();
        let user_id = user_id.to_string();
        self.dispatch
            .submit(move || async move { client.create_dm(&user_id).await })
    }

    /// Look up a user.
    pub fn fetch_user(&self, user_id: &str) -> TaskHandle<PlatformUser> {
        let client = self.client.clone();
        let user_id = user_id.to_string();
        self.dispatch
            .submit(move || async move { client.fetch_user(&user_id).await })
    }
}
