use std::{env, net::SocketAddr, str::FromStr};

use anyhow::{anyhow, Context, Result};
use stash_kernel::invalidation::PAGE_SIZE;

/// Heartbeat interval (seconds) requested from the broker unless the URL sets one.
pub const AMQP_HEARTBEAT_SECS: u32 = 10;

pub const DEFAULT_TRANSACTIONS_QUEUE: &str = "transactions";
pub const DEFAULT_KEYCDN_API_BASE: &str = "https://api.keycdn.com";
pub const DEFAULT_CDN_REQUESTS_PER_MINUTE: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnConfig {
    pub zone_id: String,
    pub api_key: String,
    /// Public zone URL that objects are served from.
    pub zone_url: String,
    pub api_base: String,
    pub requests_per_minute: u32,
    pub page_size: usize,
    /// Initial cursor in epoch milliseconds; `None` starts at process start.
    pub start_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub amqp_url: String,
    pub transactions_queue: String,
    pub s3_bucket: String,
    pub s3_endpoint: Option<String>,
    /// `None` when invalidation is disabled.
    pub cdn: Option<CdnConfig>,
    pub health_addr: Option<SocketAddr>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = first_of(&lookup, &["DATABASE_URL", "STASH_DB_DSN"])
            .context("DATABASE_URL or STASH_DB_DSN must be configured")?;
        let db_max_connections = parse_var(&lookup, "STASH_DB_MAX_CONNECTIONS")?
            .unwrap_or(stash_db::DEFAULT_MAX_CONNECTIONS);

        let amqp_url = first_of(&lookup, &["CLOUDAMQP_URL", "STASH_AMQP_URL"])
            .context("CLOUDAMQP_URL or STASH_AMQP_URL must be configured")?;
        let amqp_url = with_heartbeat(&amqp_url, AMQP_HEARTBEAT_SECS);

        let transactions_queue = non_empty(&lookup, "STASH_TRANSACTIONS_QUEUE")
            .unwrap_or_else(|| DEFAULT_TRANSACTIONS_QUEUE.to_string());

        let s3_bucket =
            non_empty(&lookup, "S3_BUCKET_NAME").context("S3_BUCKET_NAME must be configured")?;
        let s3_endpoint = non_empty(&lookup, "S3_ENDPOINT_URL");

        let cdn = if matches!(bool_var(&lookup, "STASH_DISABLE_INVALIDATION"), Some(true)) {
            None
        } else {
            let requests_per_minute = parse_var(&lookup, "STASH_CDN_REQUESTS_PER_MINUTE")?
                .unwrap_or(DEFAULT_CDN_REQUESTS_PER_MINUTE);
            if requests_per_minute == 0 {
                return Err(anyhow!("STASH_CDN_REQUESTS_PER_MINUTE must be at least 1"));
            }
            Some(CdnConfig {
                zone_id: non_empty(&lookup, "KEYCDN_ZONE_ID")
                    .context("KEYCDN_ZONE_ID must be configured")?,
                api_key: non_empty(&lookup, "KEYCDN_API_KEY")
                    .context("KEYCDN_API_KEY must be configured")?,
                zone_url: non_empty(&lookup, "KEYCDN_ZONE_URL")
                    .context("KEYCDN_ZONE_URL must be configured")?,
                api_base: non_empty(&lookup, "KEYCDN_API_BASE")
                    .unwrap_or_else(|| DEFAULT_KEYCDN_API_BASE.to_string()),
                requests_per_minute,
                page_size: PAGE_SIZE,
                start_ms: parse_var(&lookup, "STASH_INVALIDATION_START_MS")?,
            })
        };

        let health_addr = parse_var(&lookup, "STASH_HEALTH_ADDR")?;

        Ok(Self {
            database_url,
            db_max_connections,
            amqp_url,
            transactions_queue,
            s3_bucket,
            s3_endpoint,
            cdn,
            health_addr,
        })
    }
}

/// Adds `heartbeat=<secs>` to an AMQP URI unless it already carries one.
pub fn with_heartbeat(url: &str, secs: u32) -> String {
    let has_heartbeat = url
        .split_once('?')
        .map(|(_, query)| query.split('&').any(|pair| pair.starts_with("heartbeat=")))
        .unwrap_or(false);
    if has_heartbeat {
        return url.to_string();
    }

    let separator = match url.split_once('?') {
        Some((_, "")) => "",
        Some(_) => "&",
        None => "?",
    };
    format!("{url}{separator}heartbeat={secs}")
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn first_of<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter().find_map(|key| non_empty(lookup, key))
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    non_empty(lookup, key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|err| anyhow!("invalid {key}='{raw}': {err}"))
        })
        .transpose()
}

fn bool_var<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|value| match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}
