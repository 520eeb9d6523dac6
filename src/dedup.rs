//! 24-hour rolling dedup engine.
//!
//! A ring of 24 hourly bloom filters with a single moving cursor. Keys are
//! inserted into the slot stamped with the current hour; membership scans
//! every slot still inside the 24-hour window. The whole ring rotates one
//! slot whenever a mutating call lands in a new hour.
//!
//! Persistence is a flat binary file: 24 records in slot order, each
//! `[i64 BE timestamp][i64 BE payload_len][payload]`, where a zero timestamp
//! marks an empty slot and carries no payload.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

use crate::bloom::BloomFilter;
use crate::errors::RelayError;

/// Expected inserts per hour slot.
pub const HOURLY_CAPACITY: usize = 50_000_000;

/// Nominal false-positive rate per slot.
pub const FALSE_POSITIVE: f64 = 0.001;

/// Hours retained in the ring.
pub const NUM_HOURS: usize = 24;

const SECS_PER_HOUR: i64 = 3600;

/// One hour's worth of keys.
struct HourSlot {
    /// Unix seconds aligned to the hour boundary (UTC)
    timestamp: i64,
    filter: BloomFilter,
}

/// Ring state. All access goes through the `RollingDedup` mutex.
struct Ring {
    /// Exactly `NUM_HOURS` entries; `None` marks a slot lost to a snapshot gap
    slots: Vec<Option<HourSlot>>,
    /// Index of the slot written-to-next
    current: usize,
    /// Sizing for freshly rotated slots
    capacity: usize,
    false_positive: f64,
}

impl Ring {
    /// Build a fresh ring ending at the hour containing `now`.
    fn fresh(capacity: usize, false_positive: f64, now: i64) -> Self {
        let hour = hour_floor(now);
        let slots = (0..NUM_HOURS)
            .map(|i| {
                Some(HourSlot {
                    timestamp: hour - (NUM_HOURS - 1 - i) as i64 * SECS_PER_HOUR,
                    filter: BloomFilter::with_estimates(capacity, false_positive),
                })
            })
            .collect();
        Self {
            slots,
            current: NUM_HOURS - 1,
            capacity,
            false_positive,
        }
    }

    /// Ensure `slots[current]` is stamped with the hour containing `now`,
    /// rotating one slot forward if not. At most one slot is refreshed per
    /// call; after a long pause the stale slots age out of the scan window
    /// instead of being rebuilt eagerly.
    fn rotate_to(&mut self, now: i64) {
        let hour = hour_floor(now);
        let stamped = self.slots[self.current]
            .as_ref()
            .map(|s| s.timestamp == hour)
            .unwrap_or(false);
        if stamped {
            return;
        }

        self.current = (self.current + 1) % NUM_HOURS;
        self.slots[self.current] = Some(HourSlot {
            timestamp: hour,
            filter: BloomFilter::with_estimates(self.capacity, self.false_positive),
        });
        info!(
            "rotated dedup ring to hour {} (slot {})",
            chrono::DateTime::from_timestamp(hour, 0)
                .map(|t| t.format("%Y-%m-%d %H:00").to_string())
                .unwrap_or_else(|| hour.to_string()),
            self.current
        );
    }

    fn add_at(&mut self, key: &str, now: i64) -> usize {
        self.rotate_to(now);
        // rotate_to guarantees the slot exists
        if let Some(slot) = self.slots[self.current].as_mut() {
            slot.filter.insert(key);
        }
        self.current
    }

    fn contains_at(&self, key: &str, now: i64) -> bool {
        let cutoff = hour_floor(now) - (NUM_HOURS as i64 - 1) * SECS_PER_HOUR;
        self.slots
            .iter()
            .flatten()
            .any(|s| s.timestamp >= cutoff && s.filter.contains(key))
    }

    fn write_to(&self, w: &mut impl Write) -> Result<(), RelayError> {
        for slot in &self.slots {
            match slot {
                None => w.write_all(&0i64.to_be_bytes())?,
                Some(s) => {
                    w.write_all(&s.timestamp.to_be_bytes())?;
                    let payload = s.filter.encode();
                    w.write_all(&(payload.len() as i64).to_be_bytes())?;
                    w.write_all(&payload)?;
                }
            }
        }
        Ok(())
    }

    fn read_from(
        r: &mut impl Read,
        capacity: usize,
        false_positive: f64,
    ) -> Result<Self, RelayError> {
        let mut slots = Vec::with_capacity(NUM_HOURS);
        for _ in 0..NUM_HOURS {
            let timestamp = read_i64(r)?;
            if timestamp == 0 {
                slots.push(None);
                continue;
            }
            let len = read_i64(r)?;
            if len < 0 {
                return Err(RelayError::InvalidSnapshot(format!(
                    "negative payload length {len}"
                )));
            }
            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload)?;
            slots.push(Some(HourSlot {
                timestamp,
                filter: BloomFilter::decode(&payload)?,
            }));
        }
        Ok(Self {
            slots,
            current: 0,
            capacity,
            false_positive,
        })
    }

    /// Point `current` at the slot stamped with the hour containing `now`.
    /// Fails when the snapshot is too old to contain that hour.
    fn align(&mut self, now: i64) -> Result<(), RelayError> {
        let hour = hour_floor(now);
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.as_ref().map(|s| s.timestamp) == Some(hour) {
                self.current = i;
                return Ok(());
            }
        }
        Err(RelayError::InvalidSnapshot(
            "no slot matches the current hour".into(),
        ))
    }
}

fn hour_floor(now: i64) -> i64 {
    now - now.rem_euclid(SECS_PER_HOUR)
}

fn read_i64(r: &mut impl Read) -> Result<i64, RelayError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

/// The shared dedup engine. One coarse mutex serializes every operation,
/// including the whole of a `dedup` batch.
pub struct RollingDedup {
    inner: Mutex<Ring>,
    snapshot_path: PathBuf,
}

impl RollingDedup {
    /// Create a fresh engine with the given slot sizing.
    #[must_use]
    pub fn new(capacity: usize, false_positive: f64, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Ring::fresh(capacity, false_positive, Utc::now().timestamp())),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Restore from the snapshot file, falling back to a fresh ring when the
    /// file is missing, unreadable, or too old to align to the current hour.
    #[must_use]
    pub fn restore_or_fresh(
        capacity: usize,
        false_positive: f64,
        snapshot_path: impl Into<PathBuf>,
    ) -> Self {
        let snapshot_path = snapshot_path.into();
        let now = Utc::now().timestamp();
        match Self::load_ring(&snapshot_path, capacity, false_positive, now) {
            Ok(ring) => {
                info!("restored dedup state from {}", snapshot_path.display());
                Self {
                    inner: Mutex::new(ring),
                    snapshot_path,
                }
            }
            Err(e) => {
                info!("starting with a fresh dedup ring: {e}");
                Self {
                    inner: Mutex::new(Ring::fresh(capacity, false_positive, now)),
                    snapshot_path,
                }
            }
        }
    }

    fn load_ring(
        path: &Path,
        capacity: usize,
        false_positive: f64,
        now: i64,
    ) -> Result<Ring, RelayError> {
        let file = File::open(path)?;
        let mut ring = Ring::read_from(&mut BufReader::new(file), capacity, false_positive)?;
        ring.align(now)?;
        Ok(ring)
    }

    /// Insert `key` into the current hour's slot, rotating first if the wall
    /// clock moved to a new hour. Returns the slot index written.
    pub fn add(&self, key: &str) -> usize {
        self.inner.lock().add_at(key, Utc::now().timestamp())
    }

    /// True iff `key` was inserted within the last 24 hours (subject to the
    /// filter's false-positive rate).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_at(key, Utc::now().timestamp())
    }

    /// Batch dedup: returns the inputs not previously seen, in input order,
    /// inserting each as it is accepted. Intra-batch repeats are therefore
    /// kept only once. The lock is held for the whole batch.
    pub fn dedup(&self, keys: &[String]) -> Vec<String> {
        let mut ring = self.inner.lock();
        let mut fresh = Vec::new();
        for key in keys {
            let now = Utc::now().timestamp();
            if !ring.contains_at(key, now) {
                ring.add_at(key, now);
                fresh.push(key.clone());
            }
        }
        fresh
    }

    /// Write the ring to the snapshot path. The ring is locked for the
    /// duration; the file is staged and renamed so a crash mid-write leaves
    /// the previous snapshot intact.
    pub fn snapshot(&self) -> Result<(), RelayError> {
        let ring = self.inner.lock();
        let tmp = self.snapshot_path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            ring.write_to(&mut writer)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.snapshot_path)?;
        info!("dedup state persisted to {}", self.snapshot_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: usize = 10_000;
    const FP: f64 = 0.001;

    fn small_engine(path: &Path) -> RollingDedup {
        RollingDedup::new(CAP, FP, path)
    }

    #[test]
    fn test_add_then_contains() {
        let dir = tempfile::tempdir().unwrap();
        let engine = small_engine(&dir.path().join("state.bin"));

        engine.add("abc");
        assert!(engine.contains("abc"));
        assert!(!engine.contains("never_seen_before"));
    }

    #[test]
    fn test_dedup_order_and_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let engine = small_engine(&dir.path().join("state.bin"));

        let batch: Vec<String> = ["a", "b", "a", "c", "b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(engine.dedup(&batch), vec!["a", "b", "c"]);

        // Everything was inserted on acceptance, so a repeat batch is empty.
        assert!(engine.dedup(&batch).is_empty());
    }

    #[test]
    fn test_hour_rotation_under_load() {
        let now = Utc::now().timestamp();
        let hour = hour_floor(now);
        let mut ring = Ring::fresh(CAP, FP, now);
        let before = ring.current;
        let prev_stamp = ring.slots[before].as_ref().unwrap().timestamp;

        let idx = ring.add_at("k", now + SECS_PER_HOUR);

        assert_eq!(idx, (before + 1) % NUM_HOURS);
        assert_eq!(
            ring.slots[idx].as_ref().unwrap().timestamp,
            hour + SECS_PER_HOUR
        );
        assert!(ring.contains_at("k", now + SECS_PER_HOUR));
        // The previously current slot is untouched.
        assert_eq!(ring.slots[before].as_ref().unwrap().timestamp, prev_stamp);
    }

    #[test]
    fn test_timestamps_stay_contiguous_across_rotations() {
        let now = Utc::now().timestamp();
        let mut ring = Ring::fresh(CAP, FP, now);

        for h in 1..=5 {
            ring.add_at("x", now + h * SECS_PER_HOUR);

            let mut stamps: Vec<i64> = ring
                .slots
                .iter()
                .flatten()
                .map(|s| s.timestamp)
                .collect();
            stamps.sort_unstable();
            assert_eq!(stamps.len(), NUM_HOURS);
            for pair in stamps.windows(2) {
                assert_eq!(pair[1] - pair[0], SECS_PER_HOUR);
            }
        }
    }

    #[test]
    fn test_24_hour_eviction() {
        let now = Utc::now().timestamp();
        let hour = hour_floor(now);

        // Slot 0 is a full 24 hours old; the rest run up to the current hour.
        let mut ring = Ring::fresh(CAP, FP, now);
        for (i, slot) in ring.slots.iter_mut().enumerate() {
            let s = slot.as_mut().unwrap();
            s.timestamp = hour - (NUM_HOURS as i64 - i as i64) * SECS_PER_HOUR;
        }
        ring.slots[0].as_mut().unwrap().filter.insert("old");
        ring.slots[NUM_HOURS - 1].as_mut().unwrap().timestamp = hour;
        ring.current = NUM_HOURS - 1;

        assert!(!ring.contains_at("old", now), "24h-old key must be evicted");

        // A key exactly 23 hours old is still inside the window.
        ring.slots[1].as_mut().unwrap().timestamp = hour - 23 * SECS_PER_HOUR;
        ring.slots[1].as_mut().unwrap().filter.insert("edge");
        assert!(ring.contains_at("edge", now));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");

        {
            let engine = small_engine(&path);
            engine.add("p");
            engine.snapshot().unwrap();
        }

        let restored = RollingDedup::restore_or_fresh(CAP, FP, &path);
        assert!(restored.contains("p"));
        assert!(!restored.contains("q"));
    }

    #[test]
    fn test_restore_missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RollingDedup::restore_or_fresh(CAP, FP, dir.path().join("absent.bin"));
        assert!(!engine.contains("anything"));
    }

    #[test]
    fn test_restore_rejects_stale_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let now = Utc::now().timestamp();

        // A ring whose newest slot is two days old cannot align.
        let ring = Ring::fresh(CAP, FP, now - 48 * SECS_PER_HOUR);
        let mut writer = BufWriter::new(File::create(&path).unwrap());
        ring.write_to(&mut writer).unwrap();
        writer.flush().unwrap();

        assert!(RollingDedup::load_ring(&path, CAP, FP, now).is_err());
    }

    #[test]
    fn test_snapshot_preserves_empty_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let now = Utc::now().timestamp();

        let mut ring = Ring::fresh(CAP, FP, now);
        ring.slots[3] = None;
        ring.slots[7] = None;
        let mut writer = BufWriter::new(File::create(&path).unwrap());
        ring.write_to(&mut writer).unwrap();
        writer.flush().unwrap();

        let loaded = RollingDedup::load_ring(&path, CAP, FP, now).unwrap();
        let empties: Vec<usize> = loaded
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(empties, vec![3, 7]);
    }

    #[test]
    fn test_high_volume_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let engine = small_engine(&dir.path().join("state.bin"));

        let n = 5000;
        for i in 0..n {
            let s = format!("test_str_{i}");
            engine.add(&s);
            if i % 2 == 0 {
                engine.add(&s);
            }
        }
        for i in 0..n {
            assert!(engine.contains(&format!("test_str_{i}")));
        }
        assert!(!engine.contains("never_seen_before"));
    }
}
