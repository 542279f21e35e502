//! Per-UID traffic accounting.
//!
//! Mirrors the accounting model of the Go engine this was distilled from:
//! every socket's uplink/downlink byte counts are folded into a bucket keyed
//! by the owning app's UID, `read_stats` atomically swaps the "since last
//! read" counters out and folds them into running totals, and `reset` drops
//! every bucket after locking each one so a concurrent in-flight update
//! can't resurrect a bucket the caller believes gone.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::single_flight::SingleFlight;

/// UIDs below this threshold belong to system services on most platforms;
/// they are folded into a single synthetic bucket so a chatty system
/// component doesn't blow up the per-app stats table.
const SYSTEM_UID_THRESHOLD: u32 = 10_000;
const SYSTEM_UID_BUCKET: u32 = 1_000;

pub fn bucket_uid(uid: u32) -> u32 {
    if uid < SYSTEM_UID_THRESHOLD {
        SYSTEM_UID_BUCKET
    } else {
        uid
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AppStatsSnapshot {
    pub uid: u32,
    pub tcp_conn: i32,
    pub udp_conn: i32,
    pub tcp_conn_total: u32,
    pub udp_conn_total: u32,
    pub uplink: u64,
    pub downlink: u64,
    pub uplink_total: u64,
    pub downlink_total: u64,
    /// Unix seconds at which this UID's last connection closed, or 0 while
    /// at least one connection is still open.
    pub deactivate_at: i64,
}

#[derive(Debug, Clone, Copy)]
pub enum ConnKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Direction {
    Uplink,
    Downlink,
}

#[derive(Default)]
struct AppStatsEntry {
    tcp_conn: AtomicI32,
    udp_conn: AtomicI32,
    tcp_conn_total: AtomicU32,
    udp_conn_total: AtomicU32,
    uplink: AtomicU64,
    downlink: AtomicU64,
    uplink_total: AtomicU64,
    downlink_total: AtomicU64,
    deactivate_at: AtomicI64,
}

impl AppStatsEntry {
    fn open(&self, kind: ConnKind) {
        self.deactivate_at.store(0, Ordering::Relaxed);
        match kind {
            ConnKind::Tcp => {
                self.tcp_conn.fetch_add(1, Ordering::Relaxed);
                self.tcp_conn_total.fetch_add(1, Ordering::Relaxed);
            }
            ConnKind::Udp => {
                self.udp_conn.fetch_add(1, Ordering::Relaxed);
                self.udp_conn_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn close(&self, kind: ConnKind) {
        let remaining = match kind {
            ConnKind::Tcp => self.tcp_conn.fetch_sub(1, Ordering::Relaxed) - 1,
            ConnKind::Udp => self.udp_conn.fetch_sub(1, Ordering::Relaxed) - 1,
        };
        let other = match kind {
            ConnKind::Tcp => self.udp_conn.load(Ordering::Relaxed),
            ConnKind::Udp => self.tcp_conn.load(Ordering::Relaxed),
        };
        if remaining <= 0 && other <= 0 {
            self.deactivate_at.store(now_unix_secs(), Ordering::Relaxed);
        }
    }

    fn record(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Uplink => self.uplink.fetch_add(bytes, Ordering::Relaxed),
            Direction::Downlink => self.downlink.fetch_add(bytes, Ordering::Relaxed),
        };
    }

    /// Zeroes byte/total counters without touching `tcp_conn`/`udp_conn`:
    /// those track connections that are actually still open right now, and
    /// clearing them out from under a live flow would leave `close()`'s
    /// `fetch_sub` driving the counter negative.
    fn reset(&self) {
        self.uplink.store(0, Ordering::Relaxed);
        self.downlink.store(0, Ordering::Relaxed);
        self.uplink_total.store(0, Ordering::Relaxed);
        self.downlink_total.store(0, Ordering::Relaxed);
        self.tcp_conn_total.store(0, Ordering::Relaxed);
        self.udp_conn_total.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self, uid: u32) -> AppStatsSnapshot {
        let uplink = self.uplink.swap(0, Ordering::Relaxed);
        let downlink = self.downlink.swap(0, Ordering::Relaxed);
        let uplink_total = self.uplink_total.fetch_add(uplink, Ordering::Relaxed) + uplink;
        let downlink_total = self.downlink_total.fetch_add(downlink, Ordering::Relaxed) + downlink;
        AppStatsSnapshot {
            uid,
            tcp_conn: self.tcp_conn.load(Ordering::Relaxed),
            udp_conn: self.udp_conn.load(Ordering::Relaxed),
            tcp_conn_total: self.tcp_conn_total.load(Ordering::Relaxed),
            udp_conn_total: self.udp_conn_total.load(Ordering::Relaxed),
            uplink,
            downlink,
            uplink_total,
            downlink_total,
            deactivate_at: self.deactivate_at.load(Ordering::Relaxed),
        }
    }
}

fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Table of per-UID byte/connection counters. Disabled entirely unless the
/// platform configuration opts in, so the hot packet path skips the bucket
/// lookup when nobody is listening for stats.
pub struct StatsTable {
    enabled: AtomicBool,
    gate: SingleFlight<u32, AppStatsEntry>,
    order: Mutex<Vec<u32>>,
}

impl Default for StatsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTable {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            gate: SingleFlight::new(),
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn entry_for(&self, uid: u32) -> Option<Arc<AppStatsEntry>> {
        if !self.enabled() {
            return None;
        }
        let bucket = bucket_uid(uid);
        let (created, entry) = self.gate.enter(&bucket, AppStatsEntry::default);
        if created {
            self.order.lock().push(bucket);
        }
        Some(entry)
    }

    pub fn conn_opened(&self, uid: u32, kind: ConnKind) {
        if let Some(entry) = self.entry_for(uid) {
            entry.open(kind);
        }
    }

    pub fn conn_closed(&self, uid: u32, kind: ConnKind) {
        if let Some(entry) = self.entry_for(uid) {
            entry.close(kind);
        }
    }

    pub fn record(&self, uid: u32, direction: Direction, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Some(entry) = self.entry_for(uid) {
            entry.record(direction, bytes);
        }
    }

    /// Zeroes every tracked bucket's byte/total counters in place. Buckets
    /// for UIDs with connections still open are kept (not removed) so their
    /// live `tcp_conn`/`udp_conn` counts survive the reset instead of going
    /// negative the next time one of those connections closes.
    pub fn reset(&self) {
        let buckets = self.order.lock().clone();
        for uid in buckets {
            if let Some(entry) = self.gate.get(&uid) {
                entry.reset();
            }
        }
    }

    pub fn read_stats(&self, mut listener: impl FnMut(AppStatsSnapshot)) {
        if !self.enabled() {
            return;
        }
        let buckets = self.order.lock().clone();
        for uid in buckets {
            if let Some(entry) = self.gate.get(&uid) {
                listener(entry.snapshot(uid));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucketing_folds_system_uids() {
        assert_eq!(bucket_uid(0), SYSTEM_UID_BUCKET);
        assert_eq!(bucket_uid(9_999), SYSTEM_UID_BUCKET);
        assert_eq!(bucket_uid(10_000), 10_000);
        assert_eq!(bucket_uid(20_345), 20_345);
    }

    #[test]
    fn disabled_table_tracks_nothing() {
        let table = StatsTable::new();
        table.conn_opened(20_000, ConnKind::Tcp);
        table.record(20_000, Direction::Uplink, 128);
        let mut seen = 0;
        table.read_stats(|_| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn deactivate_at_set_only_when_all_conns_close() {
        let table = StatsTable::new();
        table.set_enabled(true);
        table.conn_opened(20_000, ConnKind::Tcp);
        table.conn_opened(20_000, ConnKind::Udp);
        table.conn_closed(20_000, ConnKind::Tcp);

        let mut snapshot = None;
        table.read_stats(|s| snapshot = Some(s));
        assert_eq!(snapshot.unwrap().deactivate_at, 0);

        table.conn_closed(20_000, ConnKind::Udp);
        let mut snapshot = None;
        table.read_stats(|s| snapshot = Some(s));
        assert!(snapshot.unwrap().deactivate_at > 0);
    }

    #[test]
    fn uplink_downlink_accumulate_into_totals() {
        let table = StatsTable::new();
        table.set_enabled(true);
        table.record(20_001, Direction::Uplink, 100);
        table.record(20_001, Direction::Downlink, 50);
        let mut first = None;
        table.read_stats(|s| first = Some(s));
        let first = first.unwrap();
        assert_eq!(first.uplink, 100);
        assert_eq!(first.uplink_total, 100);

        table.record(20_001, Direction::Uplink, 25);
        let mut second = None;
        table.read_stats(|s| second = Some(s));
        let second = second.unwrap();
        assert_eq!(second.uplink, 25);
        assert_eq!(second.uplink_total, 125);
    }

    #[test]
    fn reset_zeroes_byte_counters_but_keeps_buckets() {
        let table = StatsTable::new();
        table.set_enabled(true);
        table.record(20_002, Direction::Uplink, 10);
        table.reset();
        let mut snapshot = None;
        table.read_stats(|s| snapshot = Some(s));
        let snapshot = snapshot.expect("bucket should survive reset");
        assert_eq!(snapshot.uplink, 0);
        assert_eq!(snapshot.uplink_total, 0);
    }

    #[test]
    fn reset_during_open_connection_does_not_underflow_conn_count() {
        let table = StatsTable::new();
        table.set_enabled(true);
        table.conn_opened(20_003, ConnKind::Tcp);
        table.reset();
        table.conn_closed(20_003, ConnKind::Tcp);

        let mut snapshot = None;
        table.read_stats(|s| snapshot = Some(s));
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.tcp_conn, 0);
    }
}
