//! Regional object-store ingest.
//!
//! Each region exposes a bucket over HTTPS. A minute's worth of uploads
//! lives under a time-prefixed path; we list the prefix, download each
//! object, and hand back the concatenated text lines. Download failures
//! skip the object; a listing failure fails the whole region fetch so the
//! caller can abandon the region for this minute.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, warn};

use crate::errors::RelayError;

/// Request timeout for listing and object downloads.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// User agent string for bucket requests.
const USER_AGENT: &str = concat!("adx-relay/", env!("CARGO_PKG_VERSION"));

/// Key prefix under which upload buckets place request files.
pub const OBJECT_PREFIX: &str = "adx_device/request";

/// Upload-bucket regions, in processing order.
pub const REGIONS: [Region; 3] = [Region::De, Region::Sg, Region::Us];

/// A geographic upload bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    De,
    Sg,
    Us,
}

impl Region {
    /// Short region tag used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::De => "de",
            Self::Sg => "sg",
            Self::Us => "us",
        }
    }

    /// Default bucket endpoint for the region.
    #[must_use]
    pub const fn default_endpoint(self) -> &'static str {
        match self {
            Self::De => "https://pando-adx-de.cos.eu-frankfurt.myqcloud.com",
            Self::Sg => "https://pando-adx-sg.cos.ap-singapore.myqcloud.com",
            Self::Us => "https://pando-adx-us.cos.na-siliconvalley.myqcloud.com",
        }
    }
}

/// HTTP client over the regional buckets.
pub struct IngestClient {
    client: Client,
    endpoints: HashMap<Region, String>,
}

impl IngestClient {
    /// Create a client for the given per-region endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(endpoints: HashMap<Region, String>) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, endpoints })
    }

    /// Fetch every request line a region uploaded for the given minute.
    ///
    /// # Errors
    ///
    /// Returns an error when the prefix listing fails; per-object download
    /// failures are logged and skipped.
    pub async fn fetch_minute_lines(
        &self,
        region: Region,
        date: &str,
        hour: &str,
        minute: &str,
    ) -> Result<Vec<String>, RelayError> {
        let prefix = format!("{OBJECT_PREFIX}/{date}/{hour}/{minute}");
        let keys = self.list_keys(region, &prefix).await?;
        debug!("{}: {} objects under {}", region.as_str(), keys.len(), prefix);

        let mut lines = Vec::new();
        for key in keys {
            match self.get_object(region, &key).await {
                Ok(body) => lines.extend(body.lines().map(str::to_owned)),
                Err(e) => warn!("{}: download failed for {key}: {e}", region.as_str()),
            }
        }
        Ok(lines)
    }

    /// List object keys under a prefix via the bucket's XML listing.
    async fn list_keys(&self, region: Region, prefix: &str) -> Result<Vec<String>, RelayError> {
        let url = format!("{}/?prefix={prefix}", self.endpoint(region));
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::ObjectStore {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(extract_keys(&response.text().await?))
    }

    /// Download one object body as text.
    async fn get_object(&self, region: Region, key: &str) -> Result<String, RelayError> {
        let url = format!("{}/{key}", self.endpoint(region));
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::ObjectStore {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.text().await?)
    }

    fn endpoint(&self, region: Region) -> &str {
        self.endpoints
            .get(&region)
            .map(String::as_str)
            .unwrap_or_else(|| region.default_endpoint())
    }
}

/// Pull the `<Key>` entries out of a bucket listing document. The listing
/// body is flat, so a scan beats carrying an XML stack for one tag.
fn extract_keys(xml: &str) -> Vec<String> {
    static KEY_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new("<Key>([^<]+)</Key>").expect("key pattern is valid"));
    KEY_RE
        .captures_iter(xml)
        .map(|c| c[1].to_string())
        .collect()
}
