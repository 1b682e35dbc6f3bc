//! HTTP and WebSocket client for the gateway.

use anyhow::Context as _;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::keys::{DeviceKeys, Identity};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfoDto {
    pub os_id: String,
    pub os_name: String,
    pub arch: String,
    pub platform: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
struct IdentityDto<'a> {
    mac: &'a str,
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    tenant_id: &'a str,
    hostname: &'a str,
    identity: IdentityDto<'a>,
    fingerprint: &'a str,
    public_key: &'a str,
    info: DeviceInfoDto,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub uid: String,
    pub token: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    fingerprint: &'a str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Debug, Serialize)]
struct ReauthorizeRequest<'a> {
    ids: &'a [String],
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: AgentConfig,
}

impl ApiClient {
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .context("couldn't build the HTTP client")?;

        Ok(Self { http, config })
    }

    pub async fn auth_device(&self, keys: &DeviceKeys, identity: &Identity) -> anyhow::Result<AuthResponse> {
        let url = self.config.api_url("/api/devices/auth")?;

        let request = AuthRequest {
            tenant_id: &self.config.tenant_id,
            hostname: &identity.hostname,
            identity: IdentityDto { mac: &identity.mac },
            fingerprint: &keys.fingerprint,
            public_key: &keys.public_pem,
            info: crate::keys::device_info(),
        };

        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .context("authentication request failed")?;

        anyhow::ensure!(
            response.status().is_success(),
            "authentication refused: {}",
            response.status()
        );

        response.json().await.context("invalid authentication response")
    }

    /// Asks the gateway to co-sign a challenge for the given fingerprint.
    pub async fn sign_challenge(&self, token: &str, fingerprint: &str, challenge: &[u8]) -> anyhow::Result<String> {
        let url = self.config.api_url("/api/auth/ssh/sign")?;
        let data = base64::engine::general_purpose::STANDARD.encode(challenge);

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&SignRequest {
                fingerprint,
                data: &data,
            })
            .send()
            .await
            .context("co-signing request failed")?;

        anyhow::ensure!(
            response.status().is_success(),
            "co-signing refused: {}",
            response.status()
        );

        let response: SignResponse = response.json().await.context("invalid co-signing response")?;

        Ok(response.signature)
    }

    /// Re-posts live session ids so the gateway can reconcile.
    pub async fn reauthorize_sessions(&self, token: &str, ids: &[String]) -> anyhow::Result<()> {
        let url = self.config.api_url("/internal/sessions/reauthorize")?;

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&ReauthorizeRequest { ids })
            .send()
            .await
            .context("reauthorization request failed")?;

        anyhow::ensure!(
            response.status().is_success(),
            "reauthorization refused: {}",
            response.status()
        );

        Ok(())
    }

    pub async fn info(&self) -> anyhow::Result<serde_json::Value> {
        let url = self.config.api_url("/api/info")?;

        let response = self.http.get(url).send().await.context("info request failed")?;

        anyhow::ensure!(response.status().is_success(), "info refused: {}", response.status());

        response.json().await.context("invalid info response")
    }

    /// Dials the uplink, returning it as a plain byte stream.
    pub async fn dial_uplink(
        &self,
        auth: &AuthResponse,
    ) -> anyhow::Result<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static> {
        use futures_util::{SinkExt as _, StreamExt as _};
        use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
        use tokio_tungstenite::tungstenite::{Bytes, Message};

        let url = self.config.ws_url("/ssh/connection")?;

        let mut request = url.as_str().into_client_request().context("invalid uplink URL")?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", auth.token).parse().context("invalid token header")?,
        );
        request
            .headers_mut()
            .insert("X-Device-UID", auth.uid.parse().context("invalid uid header")?);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("uplink connection failed")?;

        let ws_compat = ws_stream
            .map(|item| {
                item.map(|msg| match msg {
                    Message::Text(s) => transport::WsReadMsg::Payload(Bytes::copy_from_slice(s.as_bytes())),
                    Message::Binary(data) => transport::WsReadMsg::Payload(data),
                    Message::Ping(_) | Message::Pong(_) => transport::WsReadMsg::Ignored,
                    Message::Close(_) => transport::WsReadMsg::Close,
                    Message::Frame(_) => transport::WsReadMsg::Ignored,
                })
            })
            .with(|item: Bytes| futures_util::future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::Binary(item))));

        Ok(transport::WsStream::new(ws_compat))
    }
}
