//! Demand bucket loader.
//!
//! The key/value store keeps one hash per 10-minute epoch enumerating
//! requested traffic per `(offer, site, country, platform, app)`. Each
//! minute we read the current bucket whole and fold it into the three
//! derived maps the allocator works from. Raw counts cover ten minutes, so
//! they are integer-divided by 10 to approximate a per-minute quota.

use std::collections::HashMap;

use chrono::{DateTime, Local, Timelike};
use redis::AsyncCommands;

use crate::errors::RelayError;
use crate::models::DemandView;

/// Hash-name prefix for demand buckets.
pub const DEMAND_KEY_PREFIX: &str = "ddj:num:group";

/// Reads demand buckets from the key/value store.
pub struct DemandLoader {
    client: redis::Client,
}

impl DemandLoader {
    /// Create a loader for the given Redis URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self, RelayError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }

    /// Read the current 10-minute bucket and derive the demand view.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable; the caller abandons
    /// the minute.
    pub async fn load(&self) -> Result<DemandView, RelayError> {
        let key = bucket_key(&Local::now());
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        Ok(build_view(fields))
    }
}

/// Hash name for the 10-minute epoch containing `now` (local time).
fn bucket_key(now: &DateTime<Local>) -> String {
    format!(
        "{DEMAND_KEY_PREFIX}:{}{}",
        now.format("%Y%m%d%H"),
        now.minute() / 10
    )
}

/// Fold raw hash fields into the derived demand maps.
///
/// Field names are `offerId:siteId:country:platform:appId`; anything else is
/// skipped silently. Unparseable values count as zero, matching the store's
/// tolerant integer read.
fn build_view(fields: impl IntoIterator<Item = (String, String)>) -> DemandView {
    let mut view = DemandView::default();
    for (field, value) in fields {
        let parts: Vec<&str> = field.split(':').collect();
        if parts.len() != 5 {
            continue;
        }
        let (offer_id, site_id, country, platform, app_id) =
            (parts[0], parts[1], parts[2], parts[3], parts[4]);
        let count = value.parse::<i64>().unwrap_or(0) / 10;

        *view.app_demand.entry(app_id.to_string()).or_default() += count;
        view.cp_app_map
            .entry(format!("{country}:{platform}"))
            .or_default()
            .insert(app_id.to_string());
        *view
            .app_slot_demand
            .entry(app_id.to_string())
            .or_default()
            .entry(format!("{offer_id}:{site_id}"))
            .or_default() += count;
    }
    view
}
