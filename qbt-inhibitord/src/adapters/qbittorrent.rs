use crate::ports::throttle::{ThrottleError, ThrottleTarget};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// qBittorrent Web API client toggling the alternative speed limits.
pub struct QbittorrentClient {
    base_url: String,
    username: String,
    password: String,
    http: Client,
}

impl QbittorrentClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building qBittorrent HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.base_url, path)
    }

    async fn get_text(&self, path: &str) -> Result<String, ThrottleError> {
        let response = self
            .http
            .get(self.endpoint(path))
            .send()
            .await
            .map_err(transport)?;
        read_body(response).await
    }

    async fn post_empty(&self, path: &str) -> Result<(), ThrottleError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .send()
            .await
            .map_err(transport)?;
        read_body(response).await.map(|_| ())
    }

    async fn alternative_speed_enabled(&self) -> Result<bool, ThrottleError> {
        let body = self.get_text("transfer/speedLimitsMode").await?;
        parse_speed_limits_mode(&body)
    }
}

#[async_trait]
impl ThrottleTarget for QbittorrentClient {
    async fn login(&self) -> Result<(), ThrottleError> {
        let response = self
            .http
            .post(self.endpoint("auth/login"))
            .header(reqwest::header::REFERER, &self.base_url)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(transport)?;
        let body = read_body(response).await?;
        if body.trim() == "Ok." {
            debug!(user = %self.username, "qBittorrent login accepted");
            Ok(())
        } else {
            Err(ThrottleError::Auth(body.trim().to_string()))
        }
    }

    async fn probe(&self) -> Result<(), ThrottleError> {
        let body = self.get_text("transfer/downloadLimit").await?;
        body.trim()
            .parse::<i64>()
            .map(|_| ())
            .map_err(|_| ThrottleError::Protocol(format!("download limit `{}`", body.trim())))
    }

    async fn set_rate_limit(&self, limited: bool) -> Result<(), ThrottleError> {
        if self.alternative_speed_enabled().await? == limited {
            return Ok(());
        }
        self.post_empty("transfer/toggleSpeedLimitsMode").await
    }

    async fn logout(&self) -> Result<(), ThrottleError> {
        self.post_empty("auth/logout").await
    }
}

async fn read_body(response: reqwest::Response) -> Result<String, ThrottleError> {
    match response.status() {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Err(ThrottleError::Disconnected),
        status if !status.is_success() => {
            Err(ThrottleError::Protocol(format!("HTTP status {status}")))
        }
        _ => response.text().await.map_err(transport),
    }
}

fn transport(err: reqwest::Error) -> ThrottleError {
    ThrottleError::Transport(err.to_string())
}

fn parse_speed_limits_mode(body: &str) -> Result<bool, ThrottleError> {
    match body.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(ThrottleError::Protocol(format!(
            "speed limits mode `{other}`"
        ))),
    }
}
