//! Wire-format records.
//!
//! `BidRequest` matches the newline-delimited JSON written by the regional
//! upload buckets; `DispatchItem` is the downstream worker schema. Both keep
//! the producers' field names via serde renames.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// One bid-request line from an upload bucket.
///
/// Every field defaults so partially filled lines still parse; validation of
/// the fields we rely on happens in [`crate::filters`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BidRequest {
    #[serde(rename = "ad_type")]
    pub ad_type: String,
    #[serde(rename = "app_id")]
    pub app_id: String,
    pub brand: String,
    #[serde(rename = "country_code")]
    pub country_code: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceType")]
    pub device_type: i32,
    pub exchange: String,
    pub extra1: String,
    pub extra2: String,
    pub extra3: String,
    pub ip: String,
    pub language: String,
    pub level: String,
    pub model: String,
    pub msg: String,
    #[serde(rename = "network_type")]
    pub network_type: i32,
    #[serde(rename = "os_version")]
    pub os_version: String,
    pub platform: String,
    #[serde(rename = "pos_id")]
    pub pos_id: i32,
    pub price: f64,
    #[serde(rename = "pub_id")]
    pub publisher: Publisher,
    pub size: String,
    pub time: String,
    pub timestamp: i64,
    #[serde(rename = "user_agent")]
    pub user_agent: String,
}

/// Nested publisher block on a bid request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Publisher {
    pub id: String,
}

/// A record projected to the downstream worker schema, tagged with the
/// offer/site slot it was allocated to. Fields without a source stay
/// zero-valued but are always serialized.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchItem {
    #[serde(rename = "offerId")]
    pub offer_id: String,
    #[serde(rename = "channelId")]
    pub channel_id: String,
    #[serde(rename = "siteId")]
    pub site_id: i32,
    #[serde(rename = "siteIdChannel")]
    pub site_id_channel: i32,
    pub id: i64,
    pub gaid: String,
    pub ip: String,
    pub geo: String,
    pub bundle: String,
    #[serde(rename = "osVersion")]
    pub os_version: String,
    pub os: String,
    #[serde(rename = "deviceModel")]
    pub device_model: String,
    pub useragent: String,
    pub brand: String,
    pub model: String,
    pub vertical: String,
    pub lang: String,
    pub status: String,
    #[serde(rename = "chaClickId")]
    pub cha_click_id: String,
}

impl DispatchItem {
    /// Project a bid request onto the downstream schema.
    ///
    /// `deviceModel` deliberately carries the publisher id, not the device
    /// model; the downstream contract repurposes the field.
    #[must_use]
    pub fn from_bid(req: &BidRequest, offer_id: &str, site_id: i32) -> Self {
        Self {
            offer_id: offer_id.to_string(),
            site_id,
            gaid: req.device_id.clone(),
            ip: req.ip.clone(),
            geo: req.country_code.clone(),
            bundle: req.app_id.clone(),
            os_version: req.os_version.clone(),
            os: req.platform.clone(),
            device_model: req.publisher.id.clone(),
            model: req.model.clone(),
            useragent: req.user_agent.clone(),
            brand: req.brand.clone(),
            lang: req.language.clone(),
            ..Self::default()
        }
    }
}

/// Demand state for one minute, derived from the key/value store.
#[derive(Debug, Default)]
pub struct DemandView {
    /// app-id -> remaining demand
    pub app_demand: HashMap<String, i64>,
    /// "country:platform" -> app-ids with demand there
    pub cp_app_map: HashMap<String, HashSet<String>>,
    /// app-id -> ordered "offerId:siteId" -> slot quota
    pub app_slot_demand: HashMap<String, BTreeMap<String, i64>>,
}

impl DemandView {
    /// True when no app has any demand this minute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.app_demand.is_empty()
    }
}
