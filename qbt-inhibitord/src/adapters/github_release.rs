use crate::ports::release::ReleaseFeed;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const API_BASE: &str = "https://api.github.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Latest-release lookup for a GitHub repository (`owner/repo`).
pub struct GithubReleases {
    api_base: String,
    repository: String,
    http: Client,
}

impl GithubReleases {
    pub fn new(repository: &str) -> Result<Self> {
        let (owner, repo) = repository
            .split_once('/')
            .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty())
            .ok_or_else(|| anyhow!("release repository must be `owner/repo`, got `{repository}`"))?;
        let http = Client::builder()
            .user_agent(concat!("qbt-inhibitord/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building release HTTP client")?;
        Ok(Self {
            api_base: API_BASE.to_string(),
            repository: format!("{owner}/{repo}"),
            http,
        })
    }
}

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: String,
}

#[async_trait]
impl ReleaseFeed for GithubReleases {
    async fn latest_version(&self) -> Result<Option<String>> {
        let response = self
            .http
            .get(format!(
                "{}/repos/{}/releases/latest",
                self.api_base, self.repository
            ))
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .context("requesting latest release")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let release: LatestRelease = response
            .error_for_status()
            .context("release lookup failed")?
            .json()
            .await
            .context("decoding release")?;
        Ok(Some(strip_tag(&release.tag_name).to_string()))
    }
}

fn strip_tag(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag)
}
