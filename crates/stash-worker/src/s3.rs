use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    error::DisplayErrorContext, primitives::ByteStream, types::ObjectCannedAcl, Client,
};
use chrono::{DateTime, Utc};
use stash_kernel::store::{ObjectStore, PutObject, StoreError};
use tracing::debug;

/// Blob store backed by an S3 bucket.
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Loads credentials and region from the standard AWS environment. A custom
    /// endpoint switches to path-style addressing for S3-compatible stores.
    pub async fn from_env(bucket: impl Into<String>, endpoint: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if endpoint.is_some() {
            s3_builder = s3_builder.force_path_style(true);
        }
        Self::new(Client::from_conf(s3_builder.build()), bucket)
    }

    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, request: PutObject<'_>) -> Result<(), StoreError> {
        let mut put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(request.key)
            .content_length(request.content_length)
            .body(ByteStream::from(request.body.to_vec()));
        if let Some(acl) = request.acl {
            put = put.acl(ObjectCannedAcl::from(acl));
        }

        match put.send().await {
            Ok(_) => {
                debug!(key = request.key, bytes = request.body.len(), "stored object");
                Ok(())
            }
            Err(err) => {
                let status = err.raw_response().map(|response| response.status().as_u16());
                if status.is_some_and(refuses_for_good) {
                    return Err(StoreError::Refused {
                        key: request.key.to_string(),
                        error: anyhow!("{}", DisplayErrorContext(&err)),
                    });
                }
                let retry_after = err
                    .raw_response()
                    .and_then(|response| response.headers().get("retry-after"))
                    .and_then(|raw| parse_retry_after(raw, Utc::now()));
                Err(StoreError::Object {
                    key: request.key.to_string(),
                    retry_after,
                    error: anyhow!("{}", DisplayErrorContext(&err)),
                })
            }
        }
    }
}

/// Statuses that describe the request itself (bad canned ACL, bad length), so
/// sending it again cannot help. Auth and missing-bucket errors stay retryable:
/// they affect every write and are fixed by configuration, not by dropping data.
pub fn refuses_for_good(status: u16) -> bool {
    matches!(status, 400 | 411 | 413)
}

/// Reads a `Retry-After` value given either as delta seconds or an HTTP date.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_retry_after(" 5 ", now), Some(Duration::from_secs(5)));
        assert_eq!(
            parse_retry_after("Fri, 01 Mar 2024 12:00:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Fri, 01 Mar 2024 11:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn only_request_errors_are_refusals() {
        assert!(refuses_for_good(400));
        assert!(refuses_for_good(411));
        for status in [403, 404, 408, 429, 500, 503] {
            assert!(!refuses_for_good(status), "{status}");
        }
    }
}
