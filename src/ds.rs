//! Per-delivery-service statistics, aggregated from precomputed per-cache
//! rollups.

use cache::Precomputed;
use names::{CacheGroupName, CacheName, DsName};
use peer::DsState;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use topology::Topology;

/// The published per-delivery-service aggregate.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DsStat {
    pub is_available: bool,
    pub disabled_locations: Vec<CacheGroupName>,
    /// Sum of the assigned caches' cumulative byte counters.
    pub out_bytes: u64,
    pub in_bytes: u64,
    /// Current throughput, summed across assigned caches.
    pub kbps: f64,
    pub status_5xx: u64,
    pub connections: u64,
    pub cachegroup_kbps: HashMap<CacheGroupName, f64>,
}

/// The full delivery-service statistics document.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DsStats {
    #[serde(rename = "deliveryServices")]
    pub delivery_services: HashMap<DsName, DsStat>,
    /// Unix seconds at which these stats were computed.
    pub time: u64,
}

/// The per-cache, per-delivery-service snapshot needed to turn the next
/// batch's cumulative counters into rates.
#[derive(Clone, Debug, Default)]
pub struct LastStats(pub HashMap<CacheName, HashMap<DsName, LastData>>);

#[derive(Clone, Debug)]
pub struct LastData {
    pub bytes: u64,
    pub time: SystemTime,
}

fn duration_ms(d: Duration) -> u64 {
    d.as_secs() * 1_000 + (d.subsec_nanos() / 1_000_000) as u64
}

/// Builds the delivery-service stats for one flush.
///
/// `times` carries each cache's latest result time, which anchors the
/// rate computation. A byte counter that moved backwards (the cache
/// restarted) contributes no rate this round and resets its baseline.
pub fn create_stats(precomputed: &HashMap<CacheName, Precomputed>,
                    times: &HashMap<CacheName, SystemTime>,
                    topology: &Topology,
                    ds_states: &HashMap<DsName, DsState>,
                    last: LastStats)
                    -> (DsStats, LastStats) {
    let mut last = last;
    let mut stats: HashMap<DsName, DsStat> = HashMap::new();
    for (ds, state) in ds_states {
        let mut stat = DsStat::default();
        stat.is_available = state.is_available;
        stat.disabled_locations = state.disabled_locations.clone();
        stats.insert(ds.clone(), stat);
    }

    for (cache, pre) in precomputed {
        let now = match times.get(cache) {
            Some(time) => *time,
            None => SystemTime::now(),
        };
        let group = topology.server_cachegroups.get(cache);
        let cache_last = last.0.entry(cache.clone()).or_insert_with(HashMap::new);

        for (ds, bytes) in &pre.ds {
            let kbps = match cache_last.get(ds) {
                Some(prev) if bytes.out_bytes >= prev.bytes => {
                    let elapsed = now.duration_since(prev.time)
                        .map(duration_ms)
                        .unwrap_or(0);
                    if elapsed > 0 {
                        ((bytes.out_bytes - prev.bytes) * 8) as f64 / elapsed as f64
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            };
            cache_last.insert(ds.clone(),
                              LastData {
                                  bytes: bytes.out_bytes,
                                  time: now,
                              });

            let stat = stats.entry(ds.clone()).or_insert_with(DsStat::default);
            stat.out_bytes += bytes.out_bytes;
            stat.in_bytes += bytes.in_bytes;
            stat.status_5xx += bytes.status_5xx;
            stat.kbps += kbps;
            if let Some(group) = group {
                *stat.cachegroup_kbps.entry(group.clone()).or_insert(0.0) += kbps;
            }
        }
    }

    // Connection counts are per cache, so every delivery service a cache
    // serves sees that cache's whole connection load.
    for (ds, servers) in &topology.ds_servers {
        let total: u64 = servers.iter()
            .filter_map(|server| precomputed.get(server))
            .map(|pre| pre.connections)
            .sum();
        if let Some(stat) = stats.get_mut(ds) {
            stat.connections = total;
        }
    }

    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (DsStats {
         delivery_services: stats,
         time: time,
     },
     last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{DsBytes, Precomputed};
    use names::{CacheGroupName, CacheName, DsName};
    use peer::DsState;
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};
    use topology::Topology;

    fn topo() -> Topology {
        Topology::from_json(br#"{
          "contentServers": {
            "c1": {"deliveryServices": {"d1": ["d1.example.net"]},
                   "cacheGroup": "g1", "type": "EDGE"},
            "c2": {"deliveryServices": {"d1": ["d1.example.net"]},
                   "cacheGroup": "g2", "type": "EDGE"}
          },
          "deliveryServices": {
            "d1": {"matchsets": [{"protocol": "HTTP",
                                  "matchlist": [{"regex": ".*\\.d1\\..*"}]}]}
          }
        }"#)
            .unwrap()
    }

    fn precomputed(out_bytes: u64, connections: u64) -> Precomputed {
        let mut pre = Precomputed::default();
        pre.out_bytes = out_bytes;
        pre.connections = connections;
        pre.ds.insert(DsName::from("d1"),
                      DsBytes {
                          out_bytes: out_bytes,
                          in_bytes: out_bytes / 10,
                          status_5xx: 1,
                      });
        pre
    }

    fn ds_states() -> HashMap<DsName, DsState> {
        let mut states = HashMap::new();
        states.insert(DsName::from("d1"),
                      DsState {
                          disabled_locations: vec![],
                          is_available: true,
                      });
        states
    }

    #[test]
    fn kbps_comes_from_deltas() {
        let topo = topo();
        let d1 = DsName::from("d1");
        let t0 = SystemTime::now();
        let t1 = t0 + Duration::from_secs(1);

        let mut pre = HashMap::new();
        pre.insert(CacheName::from("c1"), precomputed(1_000_000, 4));
        pre.insert(CacheName::from("c2"), precomputed(2_000_000, 6));
        let mut times = HashMap::new();
        times.insert(CacheName::from("c1"), t0);
        times.insert(CacheName::from("c2"), t0);

        let (first, last) = create_stats(&pre, &times, &topo, &ds_states(), LastStats::default());
        // no baseline yet: counters only, no rates.
        assert_eq!(first.delivery_services[&d1].kbps, 0.0);
        assert_eq!(first.delivery_services[&d1].out_bytes, 3_000_000);
        assert_eq!(first.delivery_services[&d1].connections, 10);
        assert!(first.delivery_services[&d1].is_available);

        // one second later both caches moved 125000 bytes = 1000 kbps each.
        let mut pre2 = HashMap::new();
        pre2.insert(CacheName::from("c1"), precomputed(1_125_000, 4));
        pre2.insert(CacheName::from("c2"), precomputed(2_125_000, 6));
        let mut times2 = HashMap::new();
        times2.insert(CacheName::from("c1"), t1);
        times2.insert(CacheName::from("c2"), t1);

        let (second, _) = create_stats(&pre2, &times2, &topo, &ds_states(), last);
        let stat = &second.delivery_services[&d1];
        assert_eq!(stat.kbps, 2_000.0);
        assert_eq!(stat.cachegroup_kbps[&CacheGroupName::from("g1")], 1_000.0);
        assert_eq!(stat.cachegroup_kbps[&CacheGroupName::from("g2")], 1_000.0);
    }

    #[test]
    fn counter_regression_resets_the_baseline() {
        let topo = topo();
        let d1 = DsName::from("d1");
        let t0 = SystemTime::now();

        let mut pre = HashMap::new();
        pre.insert(CacheName::from("c1"), precomputed(1_000_000, 0));
        let mut times = HashMap::new();
        times.insert(CacheName::from("c1"), t0);
        let (_, last) = create_stats(&pre, &times, &topo, &ds_states(), LastStats::default());

        // the cache restarted: counter went backwards.
        let mut pre2 = HashMap::new();
        pre2.insert(CacheName::from("c1"), precomputed(10_000, 0));
        let mut times2 = HashMap::new();
        times2.insert(CacheName::from("c1"), t0 + Duration::from_secs(1));
        let (stats, last) = create_stats(&pre2, &times2, &topo, &ds_states(), last);
        assert_eq!(stats.delivery_services[&d1].kbps, 0.0);
        assert_eq!(last.0[&CacheName::from("c1")][&d1].bytes, 10_000);
    }
}
