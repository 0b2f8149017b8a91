use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: None,
        }
    }
}

/// Plain GET access to the upstream endpoints (release metadata, baseline configs).
pub trait Fetcher {
    fn get_text(&self, url: &str) -> Result<String>;

    fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let body = self.get_text(url)?;
        serde_json::from_str(&body)
            .map_err(|e| Error::msg(format!("invalid JSON from {url}: {e}")))
    }
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(cfg: &HttpConfig) -> Result<Self> {
        let user_agent = cfg
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("kconfig-refresh/{}", env!("CARGO_PKG_VERSION")));
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn send(&self, url: &str) -> Result<reqwest::blocking::Response> {
        tracing::debug!(%url, "GET");
        let res = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::msg(format!("GET {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "GET {url} failed with status {}",
                res.status()
            )));
        }
        Ok(res)
    }
}

impl Fetcher for HttpFetcher {
    fn get_text(&self, url: &str) -> Result<String> {
        self.send(url)?
            .text()
            .map_err(|e| Error::msg(format!("failed to read body of {url}: {e}")))
    }

    fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        self.send(url)?
            .json()
            .map_err(|e| Error::msg(format!("invalid JSON from {url}: {e}")))
    }
}
