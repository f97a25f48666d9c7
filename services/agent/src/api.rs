//! Authenticated REST client.
//!
//! Thin typed wrapper over `reqwest`. Every call carries the
//! `Access-Token` header and a 10 s overall timeout; failures leave this
//! module only as classified [`AgentError`] kinds.

use pb_protocol::{
    ApiErrorBody, Chat, ChatList, Device, DeviceList, DeviceRegistration, NicknameUpdate,
    OutgoingPush, Push, PushList, User,
};
use tracing::debug;

use crate::error::AgentError;

const ACCESS_TOKEN_HEADER: &str = "Access-Token";

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub fn new(api_base: &str, http_timeout_ms: u64) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(http_timeout_ms))
            .build()
            .map_err(AgentError::internal)?;
        Ok(Self {
            http,
            base: api_base.trim_end_matches('/').to_owned(),
        })
    }

    // -----------------------------------------------------------------------
    // Endpoints
    // -----------------------------------------------------------------------

    pub async fn get_user(&self, token: &str) -> Result<User, AgentError> {
        self.get_json(token, "/users/me").await
    }

    /// Active devices only. The server filters via `?active=true`; the
    /// client filters again because tombstones have been observed in the
    /// wild.
    pub async fn list_devices(&self, token: &str) -> Result<Vec<Device>, AgentError> {
        let list: DeviceList = self.get_json(token, "/devices?active=true").await?;
        Ok(list.devices.into_iter().filter(|d| d.active).collect())
    }

    pub async fn list_chats(&self, token: &str) -> Result<Vec<Chat>, AgentError> {
        let list: ChatList = self.get_json(token, "/chats").await?;
        Ok(list.chats)
    }

    /// Display window: the newest `limit` pushes.
    pub async fn recent_pushes(&self, token: &str, limit: usize) -> Result<Vec<Push>, AgentError> {
        let list: PushList = self
            .get_json(token, &format!("/pushes?limit={limit}"))
            .await?;
        Ok(list.pushes)
    }

    /// One incremental page. `cursor` is the server continuation from the
    /// previous page, passed back verbatim.
    pub async fn pushes_modified_after(
        &self,
        token: &str,
        cutoff: f64,
        cursor: Option<&str>,
    ) -> Result<PushList, AgentError> {
        let mut path = format!("/pushes?modified_after={cutoff}");
        if let Some(c) = cursor {
            path.push_str("&cursor=");
            path.push_str(c);
        }
        self.get_json(token, &path).await
    }

    pub async fn register_device(
        &self,
        token: &str,
        registration: &DeviceRegistration,
    ) -> Result<Device, AgentError> {
        self.post_json(token, "/devices", registration).await
    }

    pub async fn update_device_nickname(
        &self,
        token: &str,
        iden: &str,
        nickname: &str,
    ) -> Result<Device, AgentError> {
        let body = NicknameUpdate {
            nickname: nickname.to_owned(),
        };
        self.post_json(token, &format!("/devices/{iden}"), &body)
            .await
    }

    pub async fn send_push(&self, token: &str, push: &OutgoingPush) -> Result<Push, AgentError> {
        self.post_json(token, "/pushes", push).await
    }

    // -----------------------------------------------------------------------
    // Request plumbing
    // -----------------------------------------------------------------------

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        path_and_query: &str,
    ) -> Result<T, AgentError> {
        let url = format!("{}{}", self.base, path_and_query);
        debug!(%url, "GET");
        let response = self
            .http
            .get(&url)
            .header(ACCESS_TOKEN_HEADER, token)
            .send()
            .await
            .map_err(classify_network_error)?;
        Self::read_json(response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned, B: serde::Serialize>(
        &self,
        token: &str,
        path: &str,
        body: &B,
    ) -> Result<T, AgentError> {
        let url = format!("{}{}", self.base, path);
        debug!(%url, "POST");
        let response = self
            .http
            .post(&url)
            .header(ACCESS_TOKEN_HEADER, token)
            .json(body)
            .send()
            .await
            .map_err(classify_network_error)?;
        Self::read_json(response).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AgentError> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::Transient(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(classify_status(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| AgentError::internal(format!("malformed response body: {e}")))
    }
}

/// Network-level failures (DNS, connect, timeout) are transient by policy.
fn classify_network_error(e: reqwest::Error) -> AgentError {
    AgentError::Transient(e.to_string())
}

/// Classify a non-2xx response. The error body, when present, has the
/// shape `{ "error": { "type": ..., "message": ... } }`.
pub(crate) fn classify_status(status: u16, body: &str) -> AgentError {
    if status == 401 {
        return AgentError::Unauthenticated;
    }
    if let Some(envelope) = ApiErrorBody::parse(body) {
        if envelope.is_invalid_cursor() {
            return AgentError::InvalidCursor;
        }
        if (400..500).contains(&status) {
            return AgentError::Rejected {
                status,
                message: envelope
                    .error
                    .message
                    .unwrap_or_else(|| envelope.error.kind.clone()),
            };
        }
    }
    if (500..600).contains(&status) {
        return AgentError::Transient(format!("http {status}"));
    }
    if (400..500).contains(&status) {
        return AgentError::Rejected {
            status,
            message: format!("http {status}"),
        };
    }
    AgentError::internal(format!("unexpected http status {status}"))
}
