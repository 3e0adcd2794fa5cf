use crate::ports::media::SessionProbe;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls a Plex Media Server's session list.
pub struct PlexSessions {
    base_url: String,
    token: String,
    http: Client,
}

impl PlexSessions {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building Plex HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        })
    }
}

#[async_trait]
impl SessionProbe for PlexSessions {
    async fn active_sessions(&self) -> Result<usize> {
        let envelope: SessionsEnvelope = self
            .http
            .get(format!("{}/status/sessions", self.base_url))
            .header("X-Plex-Token", &self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .context("requesting Plex sessions")?
            .error_for_status()
            .context("Plex rejected sessions request")?
            .json()
            .await
            .context("decoding Plex sessions")?;
        Ok(count_active(&envelope.media_container))
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionsEnvelope {
    #[serde(rename = "MediaContainer", default)]
    media_container: MediaContainer,
}

#[derive(Debug, Default, Deserialize)]
struct MediaContainer {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<SessionMetadata>,
}

#[derive(Debug, Deserialize)]
struct SessionMetadata {
    #[serde(rename = "Player")]
    player: Option<Player>,
}

#[derive(Debug, Deserialize)]
struct Player {
    #[serde(default)]
    state: String,
}

fn count_active(container: &MediaContainer) -> usize {
    container
        .metadata
        .iter()
        .filter_map(|session| session.player.as_ref())
        .filter(|player| matches!(player.state.as_str(), "playing" | "buffering"))
        .count()
}
