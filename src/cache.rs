//! Cache poll results and their bounded histories.

use futures::unsync::oneshot;
use names::{CacheName, DsName};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Why a fetch produced no usable document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FetchError {
    /// Connection-level failure (refused, reset, DNS, bad URL).
    Transport(String),
    /// The cache answered with a non-2xx status.
    Status(u16),
    /// The request outlived its deadline.
    Timeout,
    /// The body was not a well-formed document.
    Decode(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FetchError::Transport(ref e) => write!(f, "transport error: {}", e),
            FetchError::Status(code) => write!(f, "unexpected status: {}", code),
            FetchError::Timeout => write!(f, "request timed out"),
            FetchError::Decode(ref e) => write!(f, "decode error: {}", e),
        }
    }
}

/// The `system` section of a cache's monitoring document: enough to judge
/// health without decoding the full statistics map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    #[serde(default)]
    pub loadavg: f64,
    #[serde(default)]
    pub speed_mbps: u64,
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
    #[serde(default)]
    pub connections: u64,
    #[serde(rename = "http5xx", default)]
    pub http_5xx: u64,
}

/// The full monitoring document a cache serves.
///
/// The health poll asks for the `system` section only; the stat poll gets
/// the whole thing, including the per-remap-rule counters under `stats`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDoc {
    pub system: SystemInfo,
    #[serde(default)]
    pub stats: HashMap<String, Value>,
}

/// Gauges derived from two consecutive results for the same cache.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Vitals {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub kbps_out: u64,
    pub connections: u64,
    pub load_avg: f64,
    /// The cache's cumulative 5xx counter.
    pub http_5xx: u64,
    /// 5xx responses since the previous poll.
    pub errors: u64,
}

/// Per-delivery-service byte counters extracted from one cache's document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DsBytes {
    pub out_bytes: u64,
    pub in_bytes: u64,
    pub status_5xx: u64,
}

/// Per-delivery-service rollups precomputed by the stat handler, so the
/// aggregator never touches the raw statistics map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Precomputed {
    /// The cache's total outbound byte counter.
    pub out_bytes: u64,
    pub connections: u64,
    pub ds: HashMap<DsName, DsBytes>,
    /// Set when some counters could not be extracted; the document was
    /// still usable.
    pub err: Option<String>,
}

/// One poll of one cache.
///
/// Ownership transfers from the handler to an aggregation manager along
/// the result channel; the manager releases the poll by calling `finish`,
/// which unblocks that cache's next tick.
#[derive(Debug)]
pub struct CacheResult {
    pub id: CacheName,
    pub poll_id: u64,
    /// When the poll completed.
    pub time: SystemTime,
    /// How long the cache took to answer.
    pub duration: Duration,
    pub error: Option<FetchError>,
    pub doc: Option<StatsDoc>,
    pub vitals: Vitals,
    pub precomputed: Option<Precomputed>,
    pub poll_finished: Option<oneshot::Sender<u64>>,
}

impl CacheResult {
    /// Signals the originating poll worker that this result has been
    /// aggregated. A worker that was killed mid-poll is gone; its dropped
    /// receiver is fine.
    pub fn finish(&mut self) {
        if let Some(tx) = self.poll_finished.take() {
            if tx.send(self.poll_id).is_err() {
                debug!("poll {} finished for {} after its worker died",
                       self.poll_id,
                       self.id);
            }
        }
    }
}

/// The lightweight per-poll record kept in history.
#[derive(Clone, Debug)]
pub struct ResultInfo {
    pub id: CacheName,
    pub poll_id: u64,
    pub time: SystemTime,
    pub duration: Duration,
    pub error: Option<FetchError>,
    pub vitals: Vitals,
}

impl<'a> From<&'a CacheResult> for ResultInfo {
    fn from(r: &CacheResult) -> ResultInfo {
        ResultInfo {
            id: r.id.clone(),
            poll_id: r.poll_id,
            time: r.time,
            duration: r.duration,
            error: r.error.clone(),
            vitals: r.vitals.clone(),
        }
    }
}

/// A full statistics document kept in history.
#[derive(Clone, Debug)]
pub struct StatSnapshot {
    pub poll_id: u64,
    pub time: SystemTime,
    pub doc: StatsDoc,
}

/// Newest-first per-cache poll records, capped per cache by its profile's
/// history count.
#[derive(Clone, Debug, Default)]
pub struct ResultInfoHistory(pub HashMap<CacheName, Vec<ResultInfo>>);

impl ResultInfoHistory {
    pub fn add(&mut self, info: ResultInfo, limit: usize) {
        let entries = self.0.entry(info.id.clone()).or_insert_with(Vec::new);
        entries.insert(0, info);
        entries.truncate(limit);
    }

    pub fn latest(&self, id: &CacheName) -> Option<&ResultInfo> {
        self.0.get(id).and_then(|v| v.first())
    }
}

/// Newest-first per-cache statistics documents, capped like
/// `ResultInfoHistory`.
#[derive(Clone, Debug, Default)]
pub struct ResultStatHistory(pub HashMap<CacheName, Vec<StatSnapshot>>);

impl ResultStatHistory {
    pub fn add(&mut self, snap: StatSnapshot, id: &CacheName, limit: usize) {
        let entries = self.0.entry(id.clone()).or_insert_with(Vec::new);
        entries.insert(0, snap);
        entries.truncate(limit);
    }
}

/// The latest observed maximum throughput per cache, in kbps.
#[derive(Clone, Debug, Default)]
pub struct CacheKbpses(pub HashMap<CacheName, u64>);

impl CacheKbpses {
    /// Records `kbps` if it exceeds the cache's running maximum.
    pub fn add_max(&mut self, id: &CacheName, kbps: u64) {
        let max = self.0.entry(id.clone()).or_insert(0);
        if kbps > *max {
            *max = kbps;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use names::CacheName;
    use std::time::{Duration, SystemTime};

    fn info(id: &CacheName, poll_id: u64) -> ResultInfo {
        ResultInfo {
            id: id.clone(),
            poll_id: poll_id,
            time: SystemTime::now(),
            duration: Duration::from_millis(5),
            error: None,
            vitals: Vitals::default(),
        }
    }

    #[test]
    fn history_is_capped_and_newest_first() {
        let id = CacheName::from("edge-den-01");
        let mut history = ResultInfoHistory::default();
        for poll_id in 0..7 {
            history.add(info(&id, poll_id), 4);
        }
        let entries = &history.0[&id];
        assert_eq!(entries.len(), 4);
        let ids: Vec<u64> = entries.iter().map(|e| e.poll_id).collect();
        assert_eq!(ids, vec![6, 5, 4, 3]);
        assert_eq!(history.latest(&id).unwrap().poll_id, 6);
    }

    #[test]
    fn max_kbps_is_a_running_maximum() {
        let id = CacheName::from("edge-den-01");
        let mut maxes = CacheKbpses::default();
        maxes.add_max(&id, 100);
        maxes.add_max(&id, 50);
        assert_eq!(maxes.0[&id], 100);
        maxes.add_max(&id, 150);
        assert_eq!(maxes.0[&id], 150);
    }

    #[test]
    fn stats_doc_round_trips() {
        let js = r#"{"system": {"loadavg": 0.25, "speedMbps": 10000,
                     "bytesIn": 10, "bytesOut": 20, "connections": 3,
                     "http5xx": 1},
                     "stats": {"remap.ds1.example.net.out_bytes": 42}}"#;
        let doc: StatsDoc = ::serde_json::from_str(js).unwrap();
        assert_eq!(doc.system.bytes_out, 20);
        let back = ::serde_json::to_string(&doc).unwrap();
        let doc2: StatsDoc = ::serde_json::from_str(&back).unwrap();
        assert_eq!(doc, doc2);
    }
}
