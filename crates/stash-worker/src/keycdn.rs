use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use stash_kernel::invalidation::{PurgeClient, PurgeError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// KeyCDN zone purge client.
#[derive(Clone, Debug)]
pub struct KeyCdnPurger {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Serialize)]
struct PurgeRequest<'a> {
    urls: &'a [String],
}

#[derive(Debug, Deserialize)]
struct PurgeResponse {
    status: Option<String>,
    description: Option<String>,
}

impl KeyCdnPurger {
    pub fn new(api_base: &str, zone_id: &str, api_key: impl Into<String>) -> Result<Self, PurgeError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| PurgeError::Transport(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: purge_endpoint(api_base, zone_id),
            api_key: api_key.into(),
        })
    }
}

pub fn purge_endpoint(api_base: &str, zone_id: &str) -> String {
    format!(
        "{}/zones/purgeurl/{}.json",
        api_base.trim_end_matches('/'),
        zone_id
    )
}

#[async_trait]
impl PurgeClient for KeyCdnPurger {
    async fn purge_urls(&self, urls: &[String]) -> Result<(), PurgeError> {
        let response = self
            .client
            .delete(&self.endpoint)
            .basic_auth(&self.api_key, None::<&str>)
            .json(&PurgeRequest { urls })
            .send()
            .await
            .map_err(|err| PurgeError::Transport(err.to_string()))?;

        let http_status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| PurgeError::Transport(err.to_string()))?;
        let parsed: PurgeResponse = serde_json::from_str(&body).map_err(|_| {
            let snippet: String = body.chars().take(200).collect();
            PurgeError::Malformed(format!("HTTP {http_status}: {snippet}"))
        })?;

        match parsed.status.as_deref() {
            Some("success") => Ok(()),
            other => Err(PurgeError::Rejected {
                status: other.unwrap_or("missing").to_string(),
                description: parsed
                    .description
                    .unwrap_or_else(|| format!("HTTP {http_status}")),
            }),
        }
    }
}
