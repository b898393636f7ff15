//! The availability engine: turns poll results into up/down state.

use cache::{CacheResult, ResultInfo};
use cell::Cell;
use names::{CacheGroupName, CacheName, CacheStatus, DsName};
use ops::{MonitorConfigMap, Parameters};
use peer::{CrStatesCell, DsState, IsAvailable};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use topology::Topology;

/// One availability transition, kept in a bounded ring for consumers that
/// want to know not just what is down but when it went down.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub index: u64,
    /// Unix seconds.
    pub time: u64,
    pub description: String,
    pub name: String,
    /// The FQDN behind `name`; the name itself when nothing resolves it.
    pub hostname: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "isAvailable")]
    pub is_available: bool,
}

#[derive(Clone, Debug, Default)]
struct EventLog {
    events: VecDeque<Event>,
    next_index: u64,
}

/// The bounded event ring. Oldest events are evicted on overflow.
#[derive(Clone)]
pub struct Events {
    log: Cell<EventLog>,
    max: usize,
}

impl Events {
    pub fn new(max: usize) -> Events {
        Events {
            log: Cell::new(EventLog::default()),
            max: max,
        }
    }

    pub fn add(&self,
               description: &str,
               name: &str,
               hostname: &str,
               kind: &str,
               available: bool) {
        info!(target: "event",
              "{} [{}] ({}) is now {}: {}",
              name,
              hostname,
              kind,
              if available { "available" } else { "unavailable" },
              description);
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let max = self.max;
        self.log.with_mut(|log| {
            let event = Event {
                index: log.next_index,
                time: time,
                description: description.to_string(),
                name: name.to_string(),
                hostname: hostname.to_string(),
                kind: kind.to_string(),
                is_available: available,
            };
            log.next_index += 1;
            log.events.push_back(event);
            while log.events.len() > max {
                log.events.pop_front();
            }
        });
    }

    pub fn get(&self) -> Vec<Event> {
        self.log.with_ref(|log| log.events.iter().cloned().collect())
    }
}

/// The structured reason behind a cache's current state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AvailableStatus {
    pub available: bool,
    /// The administrative status the decision was made under.
    pub status: String,
    /// What flipped the cache to its current state.
    pub why: String,
}

pub type CacheStatuses = HashMap<CacheName, AvailableStatus>;

fn duration_ms(d: Duration) -> u64 {
    d.as_secs() * 1_000 + (d.subsec_nanos() / 1_000_000) as u64
}

/// Derives per-cache gauges from this result and the previous one.
///
/// Counter regressions (a cache restart) reset the derived rates to zero
/// rather than producing nonsense.
pub fn get_vitals(result: &mut CacheResult, last: Option<&ResultInfo>) {
    let system = match result.doc {
        Some(ref doc) => doc.system.clone(),
        None => return,
    };
    let mut vitals = ::cache::Vitals {
        bytes_out: system.bytes_out,
        bytes_in: system.bytes_in,
        kbps_out: 0,
        connections: system.connections,
        load_avg: system.loadavg,
        http_5xx: system.http_5xx,
        errors: 0,
    };
    if let Some(last) = last {
        let elapsed_ms = result.time
            .duration_since(last.time)
            .map(duration_ms)
            .unwrap_or(0);
        if elapsed_ms > 0 && system.bytes_out >= last.vitals.bytes_out &&
           last.vitals.bytes_out > 0 {
            // bits per millisecond == kilobits per second.
            vitals.kbps_out = (system.bytes_out - last.vitals.bytes_out) * 8 / elapsed_ms;
        }
        vitals.errors = system.http_5xx.saturating_sub(last.vitals.http_5xx);
    }
    result.vitals = vitals;
}

/// Decides whether one result leaves its cache available.
///
/// Forced administrative states win over everything; then any poll error
/// marks the cache down; then the profile thresholds get a say. A single
/// failing poll flips the cache down, a single passing poll flips it up.
pub fn eval_cache(result: &CacheResult,
                  status: CacheStatus,
                  params: Option<&Parameters>)
                  -> (bool, String) {
    match status {
        CacheStatus::AdminDown => return (false, "set to ADMIN_DOWN".to_string()),
        CacheStatus::Offline => return (false, "set to OFFLINE".to_string()),
        CacheStatus::Online => return (true, "set to ONLINE".to_string()),
        _ => {}
    }

    if let Some(ref err) = result.error {
        return (false, format!("poll error: {}", err));
    }

    if let Some(params) = params {
        if let Some(max_ms) = params.threshold_query_time_ms {
            let took = duration_ms(result.duration);
            if took > max_ms {
                return (false, format!("query time {}ms above threshold {}ms", took, max_ms));
            }
        }
        if let Some(max) = params.threshold_errors {
            if result.vitals.errors > max {
                return (false,
                        format!("{} 5xx responses above threshold {}",
                                result.vitals.errors,
                                max));
            }
        }
        if let Some(max) = params.threshold_loadavg {
            if result.vitals.load_avg > max {
                return (false,
                        format!("load average {} above threshold {}",
                                result.vitals.load_avg,
                                max));
            }
        }
        // The lightweight health document has no statistics map, so
        // required stats only constrain full stat polls.
        if let Some(ref required) = params.required_stats {
            if let Some(ref doc) = result.doc {
                if !doc.stats.is_empty() {
                    for stat in required {
                        if !doc.stats.contains_key(stat) {
                            return (false, format!("missing required stat '{}'", stat));
                        }
                    }
                }
            }
        }
    }

    (true, "passed all thresholds".to_string())
}

/// Applies `eval_cache` to a batch of results, updating the local
/// availability states and appending one event per transition.
pub fn calc_availability(results: &[CacheResult],
                         poll_kind: &str,
                         mc: &MonitorConfigMap,
                         local_states: &CrStatesCell,
                         statuses: &Cell<CacheStatuses>,
                         events: &Events) {
    for result in results {
        let server = match mc.server(&result.id) {
            Some(server) => server,
            None => {
                warn!("{} result for {} which is not in the roster",
                      poll_kind,
                      result.id);
                continue;
            }
        };
        let status = CacheStatus::parse(&server.status);
        let (available, why) = eval_cache(result, status, mc.parameters(server));

        let was = local_states.get_cache(&result.id)
            .map(|a| a.is_available)
            .unwrap_or(false);
        if was != available {
            let hostname = if server.fqdn.is_empty() {
                result.id.as_str()
            } else {
                server.fqdn.as_str()
            };
            events.add(&why, result.id.as_str(), hostname, &server.kind, available);
        }

        local_states.set_cache(result.id.clone(), IsAvailable::new(available));
        statuses.with_mut(|m| {
            m.insert(result.id.clone(),
                     AvailableStatus {
                         available: available,
                         status: server.status.clone(),
                         why: why,
                     });
        });
    }
}

/// Derives per-delivery-service availability from cache states.
///
/// A delivery service is available while any of its assigned caches is;
/// a cache group lands in `disabled_locations` when every one of the
/// service's caches in that group is down.
pub fn calc_ds_states(topology: &Topology,
                      caches: &HashMap<CacheName, IsAvailable>)
                      -> HashMap<DsName, DsState> {
    let mut states = HashMap::new();
    for (ds, servers) in &topology.ds_servers {
        let mut available = false;
        let mut groups: HashMap<CacheGroupName, bool> = HashMap::new();
        for server in servers {
            let up = caches.get(server).map(|a| a.is_available).unwrap_or(false);
            if up {
                available = true;
            }
            if let Some(group) = topology.server_cachegroups.get(server) {
                let any_up = groups.entry(group.clone()).or_insert(false);
                *any_up = *any_up || up;
            }
        }
        let mut disabled: Vec<CacheGroupName> = groups.iter()
            .filter(|&(_, &any_up)| !any_up)
            .map(|(group, _)| group.clone())
            .collect();
        disabled.sort();
        states.insert(ds.clone(),
                      DsState {
                          is_available: available,
                          disabled_locations: disabled,
                      });
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{CacheResult, FetchError, StatsDoc, SystemInfo, Vitals};
    use names::{CacheName, CacheStatus, DsName};
    use ops::MonitorConfigMap;
    use peer::{CrStatesCell, IsAvailable};
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};
    use topology::Topology;

    fn result(id: &str, poll_id: u64, error: Option<FetchError>) -> CacheResult {
        CacheResult {
            id: CacheName::from(id),
            poll_id: poll_id,
            time: SystemTime::now(),
            duration: Duration::from_millis(10),
            error: error,
            doc: Some(StatsDoc {
                          system: SystemInfo::default(),
                          stats: HashMap::new(),
                      }),
            vitals: Vitals::default(),
            precomputed: None,
            poll_finished: None,
        }
    }

    fn roster(id: &str, status: &str) -> MonitorConfigMap {
        let js = format!(r#"{{"trafficServers": {{
                              "{0}": {{"status": "{1}", "profile": "p",
                                       "fqdn": "{0}.cdn.example.net",
                                       "type": "EDGE"}}}}}}"#,
                         id,
                         status);
        ::serde_json::from_str(&js).unwrap()
    }

    #[test]
    fn single_error_flips_down_single_success_flips_up() {
        let mc = roster("edge", "REPORTED");
        let local = CrStatesCell::new();
        let statuses = ::cell::Cell::new(HashMap::new());
        let events = Events::new(100);
        let id = CacheName::from("edge");

        // warmup: unpolled caches start down, first clean poll comes up.
        calc_availability(&[result("edge", 1, None)],
                          "health", &mc, &local, &statuses, &events);
        assert!(local.get_cache(&id).unwrap().is_available);
        let baseline = events.get().len();

        // ok, err, ok: exactly two transitions.
        calc_availability(&[result("edge", 2, None)],
                          "health", &mc, &local, &statuses, &events);
        calc_availability(&[result("edge", 3, Some(FetchError::Timeout))],
                          "health", &mc, &local, &statuses, &events);
        assert!(!local.get_cache(&id).unwrap().is_available);
        calc_availability(&[result("edge", 4, None)],
                          "health", &mc, &local, &statuses, &events);
        assert!(local.get_cache(&id).unwrap().is_available);

        let events = events.get();
        assert_eq!(events.len() - baseline, 2);
        assert!(!events[events.len() - 2].is_available);
        assert!(events[events.len() - 1].is_available);
        let last = &events[events.len() - 1];
        assert_eq!(last.name, "edge");
        assert_eq!(last.hostname, "edge.cdn.example.net");
        assert_eq!(last.kind, "EDGE");
    }

    #[test]
    fn admin_down_is_forced_unavailable() {
        let mc = roster("edge", "ADMIN_DOWN");
        let local = CrStatesCell::new();
        let statuses = ::cell::Cell::new(HashMap::new());
        let events = Events::new(10);

        calc_availability(&[result("edge", 1, None)],
                          "health", &mc, &local, &statuses, &events);
        let id = CacheName::from("edge");
        assert!(!local.get_cache(&id).unwrap().is_available);
        let status = &statuses.get()[&id];
        assert_eq!(status.why, "set to ADMIN_DOWN");
    }

    #[test]
    fn eval_applies_thresholds() {
        let mc: MonitorConfigMap = ::serde_json::from_str(r#"{
            "trafficServers": {"edge": {"status": "REPORTED", "profile": "p",
                                        "type": "EDGE"}},
            "profiles": {"p": {"parameters": {
                "health.threshold.queryTime": 5,
                "health.threshold.errors": 2
            }}}
        }"#)
            .unwrap();
        let server = mc.server(&CacheName::from("edge")).unwrap();
        let params = mc.parameters(server);

        let mut slow = result("edge", 1, None);
        slow.duration = Duration::from_millis(50);
        let (up, why) = eval_cache(&slow, CacheStatus::Reported, params);
        assert!(!up);
        assert!(why.contains("query time"));

        let mut erroring = result("edge", 2, None);
        erroring.vitals.errors = 3;
        let (up, why) = eval_cache(&erroring, CacheStatus::Reported, params);
        assert!(!up);
        assert!(why.contains("5xx"));

        let (up, _) = eval_cache(&result("edge", 3, None), CacheStatus::Reported, params);
        assert!(up);
    }

    #[test]
    fn vitals_derive_kbps_and_error_deltas() {
        let mut first = result("edge", 1, None);
        first.doc.as_mut().unwrap().system.bytes_out = 1_000_000;
        first.doc.as_mut().unwrap().system.http_5xx = 5;
        get_vitals(&mut first, None);
        assert_eq!(first.vitals.kbps_out, 0);

        let mut info = ::cache::ResultInfo::from(&first);
        info.time = first.time;

        let mut second = result("edge", 2, None);
        second.time = first.time + Duration::from_secs(2);
        second.doc.as_mut().unwrap().system.bytes_out = 1_500_000;
        second.doc.as_mut().unwrap().system.http_5xx = 9;
        get_vitals(&mut second, Some(&info));
        // 500000 bytes in 2s = 2.0 Mbit/s.
        assert_eq!(second.vitals.kbps_out, 2_000);
        assert_eq!(second.vitals.errors, 4);
    }

    #[test]
    fn ds_rollup_and_disabled_locations() {
        let topo = Topology::from_json(br#"{
          "contentServers": {
            "c1": {"deliveryServices": {"d1": ["d1.example.net"]},
                   "cacheGroup": "g", "type": "EDGE"},
            "c2": {"deliveryServices": {"d1": ["d1.example.net"]},
                   "cacheGroup": "g", "type": "EDGE"}
          },
          "deliveryServices": {
            "d1": {"matchsets": [{"protocol": "HTTP",
                                  "matchlist": [{"regex": ".*\\.d1\\..*"}]}]}
          }
        }"#)
            .unwrap();

        let mut caches = HashMap::new();
        caches.insert(CacheName::from("c1"), IsAvailable::new(true));
        caches.insert(CacheName::from("c2"), IsAvailable::new(false));
        let states = calc_ds_states(&topo, &caches);
        let d1 = &states[&DsName::from("d1")];
        assert!(d1.is_available);
        assert!(d1.disabled_locations.is_empty());

        caches.insert(CacheName::from("c1"), IsAvailable::new(false));
        let states = calc_ds_states(&topo, &caches);
        let d1 = &states[&DsName::from("d1")];
        assert!(!d1.is_available);
        assert_eq!(d1.disabled_locations,
                   vec![::names::CacheGroupName::from("g")]);
    }

    #[test]
    fn event_ring_is_bounded() {
        let events = Events::new(3);
        for i in 0..10 {
            let name = format!("cache-{}", i);
            let hostname = format!("cache-{}.cdn.example.net", i);
            events.add("why", &name, &hostname, "EDGE", i % 2 == 0);
        }
        let log = events.get();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].name, "cache-7");
        assert_eq!(log[0].hostname, "cache-7.cdn.example.net");
        assert_eq!(log[2].name, "cache-9");
        assert!(log[0].index < log[1].index && log[1].index < log[2].index);
    }

    #[test]
    fn events_serialize_with_hostname() {
        let events = Events::new(2);
        events.add("poll error: request timed out",
                   "edge",
                   "edge.cdn.example.net",
                   "EDGE",
                   false);
        let js = ::serde_json::to_value(&events.get()[0]).unwrap();
        assert_eq!(js["name"], "edge");
        assert_eq!(js["hostname"], "edge.cdn.example.net");
        assert_eq!(js["type"], "EDGE");
        assert_eq!(js["isAvailable"], false);
    }
}
