//! Offer/site fan-out and worker dispatch.
//!
//! An app's allocated records are split across its offer/site slots with a
//! single forward cursor, projected to the downstream schema, and posted to
//! a randomly chosen worker. There is no retry; a failed batch is logged
//! and dropped.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use serde::Serialize;

use crate::errors::RelayError;
use crate::models::{BidRequest, DispatchItem};

/// Fixed downstream worker pool.
pub const WORKER_IPS: [&str; 8] = [
    "172.31.17.231",
    "172.31.24.96",
    "172.31.22.157",
    "172.31.25.93",
    "172.31.21.96",
    "172.31.16.65",
    "172.31.17.148",
    "172.31.20.249",
];

/// Ingest path on the workers.
pub const WORKER_PATH: &str = "/v1/ddj/fetch/ddjData";

/// Per-POST timeout.
const DISPATCH_TIMEOUT_SECS: u64 = 30;

/// User agent string for worker requests.
const USER_AGENT: &str = concat!("adx-relay/", env!("CARGO_PKG_VERSION"));

/// One offer/site slice of an app's allocation.
#[derive(Debug)]
pub struct DispatchBatch {
    pub offer_id: String,
    pub site_id: i32,
    pub items: Vec<DispatchItem>,
}

/// Wire shape of a worker POST body.
#[derive(Serialize)]
struct DispatchPayload<'a> {
    datas: &'a [DispatchItem],
    #[serde(rename = "offerId")]
    offer_id: &'a str,
}

/// Split an app's records across its offer/site slots.
///
/// Slots are walked in map order with a cursor; each takes at most its
/// quota, and records past the total quota are left behind (the caller
/// drops them silently). A slot can come out empty when the records run
/// out early.
#[must_use]
pub fn split_batches(records: &[BidRequest], slots: &BTreeMap<String, i64>) -> Vec<DispatchBatch> {
    let mut batches = Vec::with_capacity(slots.len());
    let mut cur = 0usize;

    for (offer_site, &quota) in slots {
        let (offer_id, site_str) = offer_site.split_once(':').unwrap_or((offer_site.as_str(), ""));
        let site_id = site_str.parse().unwrap_or(0);

        let next = (cur + quota.max(0) as usize).min(records.len());
        let items = records[cur..next]
            .iter()
            .map(|r| DispatchItem::from_bid(r, offer_id, site_id))
            .collect();
        cur = next;

        batches.push(DispatchBatch {
            offer_id: offer_id.to_string(),
            site_id,
            items,
        });
    }
    batches
}

/// Posts dispatch batches to the worker pool.
pub struct Dispatcher {
    client: Client,
    worker_port: u16,
}

impl Dispatcher {
    /// Create a dispatcher targeting the given worker port.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(worker_port: u16) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DISPATCH_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            worker_port,
        })
    }

    /// POST one batch to a uniformly random worker.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response; the
    /// caller logs and drops the batch.
    pub async fn send(&self, batch: &DispatchBatch) -> Result<(), RelayError> {
        let worker = WORKER_IPS[rand::thread_rng().gen_range(0..WORKER_IPS.len())];
        let url = format!("http://{worker}:{}{WORKER_PATH}", self.worker_port);

        let payload = DispatchPayload {
            datas: &batch.items,
            offer_id: &batch.offer_id,
        };
        let response = self.client.post(&url).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Worker {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
