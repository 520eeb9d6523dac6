//! The per-minute pipeline.
//!
//! A scheduler aligned to wall-clock minute boundaries launches one run per
//! tick. A run loads the demand view, pulls the previous minute's uploads
//! from every region, allocates deduplicated records to apps, and fans each
//! app's buffer out across its offer/site slots. Runs may overlap; they
//! share nothing but the dedup engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tracing::{info, warn};

use crate::dedup::RollingDedup;
use crate::demand::DemandLoader;
use crate::dispatch::{split_batches, Dispatcher};
use crate::filters::{is_valid_gaid, is_valid_ipv4};
use crate::ingest::{IngestClient, REGIONS};
use crate::models::{BidRequest, DemandView};

/// Seconds of grace past the minute boundary; files for minute M become
/// visible slightly after M+1 begins.
const GRACE_SECS: u64 = 10;

/// Drop counters for one region's walk.
#[derive(Debug, Default, PartialEq, Eq)]
struct RegionStats {
    invalid_device: u64,
    invalid_ip: u64,
}

/// Shared collaborators for every per-minute run.
pub struct Pipeline {
    pub dedup: Arc<RollingDedup>,
    pub demand: DemandLoader,
    pub ingest: IngestClient,
    pub dispatcher: Dispatcher,
}

impl Pipeline {
    /// Sleep to the next minute boundary plus grace, then spawn one run per
    /// minute tick, forever. Runs are never joined.
    pub async fn run_scheduler(self: Arc<Self>) {
        tokio::time::sleep(delay_to_next_tick(Utc::now().timestamp_millis())).await;

        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let pipeline = self.clone();
            tokio::spawn(async move {
                pipeline.process_minute().await;
            });
        }
    }

    /// One pipeline run over the previous minute's uploads.
    pub async fn process_minute(&self) {
        let started = std::time::Instant::now();
        let prev = Local::now() - chrono::Duration::minutes(1);
        let date = prev.format("%Y%m%d").to_string();
        let hour = prev.format("%H").to_string();
        let minute = prev.format("%M").to_string();
        info!("processing {date} {hour}:{minute}");

        let mut view = match self.demand.load().await {
            Ok(view) => view,
            Err(e) => {
                warn!("demand load failed, abandoning minute: {e}");
                return;
            }
        };
        if view.is_empty() {
            info!("no demand this minute");
            return;
        }

        let mut results: HashMap<String, Vec<BidRequest>> = HashMap::new();
        let mut app_seen: HashMap<String, u64> = HashMap::new();
        let mut app_duped: HashMap<String, u64> = HashMap::new();

        for region in REGIONS {
            let lines = match self
                .ingest
                .fetch_minute_lines(region, &date, &hour, &minute)
                .await
            {
                Ok(lines) => lines,
                Err(e) => {
                    warn!("{}: region fetch failed: {e}", region.as_str());
                    continue;
                }
            };
            info!(
                "{}: {} lines for {date} {hour}:{minute}",
                region.as_str(),
                lines.len()
            );

            let stats = allocate_region(
                &lines,
                &mut view,
                &self.dedup,
                &mut results,
                &mut app_seen,
                &mut app_duped,
            );
            info!(
                "{}: {} invalid devices, {} invalid ips",
                region.as_str(),
                stats.invalid_device,
                stats.invalid_ip
            );
        }

        for (app_id, seen) in &app_seen {
            info!(
                "app {app_id}: demand_left={} seen={seen} duped={}",
                view.app_demand.get(app_id).copied().unwrap_or(0),
                app_duped.get(app_id).copied().unwrap_or(0)
            );
        }

        for (app_id, records) in &results {
            let Some(slot_map) = view.app_slot_demand.get(app_id) else {
                continue;
            };
            info!("app {app_id}: splitting {} records", records.len());

            for batch in split_batches(records, slot_map) {
                if batch.items.is_empty() {
                    continue;
                }
                info!(
                    "dispatching {} records for {}:{}",
                    batch.items.len(),
                    batch.offer_id,
                    batch.site_id
                );
                if let Err(e) = self.dispatcher.send(&batch).await {
                    warn!(
                        "dispatch of {}:{} failed, dropping batch: {e}",
                        batch.offer_id, batch.site_id
                    );
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed > Duration::from_secs(60) {
            warn!("minute run took {elapsed:?}; runs are overlapping");
        }
    }
}

/// Delay from `now` (epoch millis) to the next minute boundary plus grace.
fn delay_to_next_tick(now_millis: i64) -> Duration {
    let into_minute = now_millis.rem_euclid(60_000) as u64;
    Duration::from_millis(60_000 - into_minute) + Duration::from_secs(GRACE_SECS)
}

/// Walk one region's lines, filling per-app buffers.
///
/// Per record: parse, validate, find the apps demanding its
/// country/platform, and for each app with remaining demand check the
/// rolling filter before accepting. The region is abandoned early if no
/// record so far has reached any app with demand left; the first record
/// that does disarms the early stop for the rest of the region.
fn allocate_region(
    lines: &[String],
    view: &mut DemandView,
    dedup: &RollingDedup,
    results: &mut HashMap<String, Vec<BidRequest>>,
    app_seen: &mut HashMap<String, u64>,
    app_duped: &mut HashMap<String, u64>,
) -> RegionStats {
    let mut stats = RegionStats::default();
    let mut progressed = false;

    for line in lines {
        let Ok(req) = serde_json::from_str::<BidRequest>(line) else {
            continue;
        };
        if !is_valid_gaid(&req.device_id) {
            stats.invalid_device += 1;
            continue;
        }
        if !is_valid_ipv4(&req.ip) {
            stats.invalid_ip += 1;
            continue;
        }

        let cp_key = format!("{}:{}", req.country_code, req.platform);
        let Some(app_ids) = view.cp_app_map.get(&cp_key) else {
            continue;
        };

        for app_id in app_ids {
            if view.app_demand.get(app_id).copied().unwrap_or(0) <= 0 {
                continue;
            }
            progressed = true;
            *app_seen.entry(app_id.clone()).or_default() += 1;

            let dedup_key = format!("{:x}:{}", md5::compute(app_id.as_bytes()), req.device_id);
            if dedup.contains(&dedup_key) {
                *app_duped.entry(app_id.clone()).or_default() += 1;
            } else {
                dedup.add(&dedup_key);
                results.entry(app_id.clone()).or_default().push(req.clone());
                if let Some(demand) = view.app_demand.get_mut(app_id) {
                    *demand -= 1;
                }
            }
        }

        if !progressed {
            break;
        }
    }
    stats
}
