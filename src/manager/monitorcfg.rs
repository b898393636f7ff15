//! Turns each roster into poller configurations and membership updates.

use cell::Cell;
use futures::{Async, Future, Poll, Stream};
use futures::unsync::mpsc;
use names::CacheStatus;
use ops::{self, MonitorConfigMap, Parameters, TrafficServer};
use peer::{CrStatesCell, DsState, IsAvailable, PeerStatesCell};
use poller::{PollTarget, PollerConfig};
use std::collections::HashMap;
use std::time::Duration;
use topology::Topology;
use url::Url;

const HOSTNAME_VAR: &'static str = "${hostname}";

pub struct Intervals {
    pub health: Duration,
    pub stat: Duration,
    pub peer: Duration,
}

/// Consumes `(roster, topology bytes)` events: swaps the topology cell
/// (rejecting bad documents and retaining the prior one), rebuilds the
/// three poller configurations, and reconciles local-state membership.
pub struct MonitorConfigManager {
    configs: mpsc::UnboundedReceiver<(MonitorConfigMap, Vec<u8>)>,
    intervals: Intervals,
    host_name: Option<String>,

    topology: Cell<Topology>,
    monitor_config: Cell<MonitorConfigMap>,
    local_states: CrStatesCell,
    peer_states: PeerStatesCell,

    health_configs: mpsc::UnboundedSender<PollerConfig>,
    stat_configs: mpsc::UnboundedSender<PollerConfig>,
    peer_configs: mpsc::UnboundedSender<PollerConfig>,
    caches_changed: Vec<mpsc::UnboundedSender<()>>,
    combine: mpsc::UnboundedSender<()>,
}

impl MonitorConfigManager {
    pub fn new(configs: mpsc::UnboundedReceiver<(MonitorConfigMap, Vec<u8>)>,
               intervals: Intervals,
               host_name: Option<String>,
               topology: Cell<Topology>,
               monitor_config: Cell<MonitorConfigMap>,
               local_states: CrStatesCell,
               peer_states: PeerStatesCell,
               health_configs: mpsc::UnboundedSender<PollerConfig>,
               stat_configs: mpsc::UnboundedSender<PollerConfig>,
               peer_configs: mpsc::UnboundedSender<PollerConfig>,
               caches_changed: Vec<mpsc::UnboundedSender<()>>,
               combine: mpsc::UnboundedSender<()>)
               -> MonitorConfigManager {
        MonitorConfigManager {
            configs: configs,
            intervals: intervals,
            host_name: host_name,
            topology: topology,
            monitor_config: monitor_config,
            local_states: local_states,
            peer_states: peer_states,
            health_configs: health_configs,
            stat_configs: stat_configs,
            peer_configs: peer_configs,
            caches_changed: caches_changed,
            combine: combine,
        }
    }

    fn apply(&mut self, roster: MonitorConfigMap, topology_bytes: Vec<u8>) {
        match Topology::from_json(&topology_bytes) {
            Ok(topology) => self.topology.set(topology),
            // A rejected topology retains the prior one.
            Err(e) => error!("rejecting topology update: {}", e),
        }
        let topology = self.topology.get();

        let (health, stat) = self.cache_targets(&roster);
        let peers = self.peer_targets(&roster);
        info!("roster update: {} polled caches, {} peers",
              health.len(),
              peers.len());

        let _ = self.health_configs.unbounded_send(PollerConfig {
                                                       interval: self.intervals.health,
                                                       targets: health,
                                                   });
        let _ = self.stat_configs.unbounded_send(PollerConfig {
                                                     interval: self.intervals.stat,
                                                     targets: stat,
                                                 });
        let _ = self.peer_configs.unbounded_send(PollerConfig {
                                                     interval: self.intervals.peer,
                                                     targets: peers,
                                                 });

        // Membership: polled caches appear (initially down), departed
        // caches disappear.
        let polled = ops::polled_caches(&roster);
        for (name, _) in self.local_states.get_caches() {
            if !polled.contains_key(&name) {
                self.local_states.delete_cache(&name);
            }
        }
        for name in polled.keys() {
            if self.local_states.get_cache(name).is_none() {
                self.local_states.set_cache(name.clone(), IsAvailable::new(false));
            }
        }

        let known_ds = self.local_states.get_delivery_services();
        for ds in topology.ds_servers.keys() {
            if !known_ds.contains_key(ds) {
                self.local_states.set_delivery_service(ds.clone(), DsState::default());
            }
        }
        for ds in known_ds.keys() {
            if !topology.ds_servers.contains_key(ds) {
                self.local_states.delete_delivery_service(ds);
            }
        }

        self.peer_states.retain(&ops::online_monitors(&roster));
        self.monitor_config.set(roster);

        for tx in &self.caches_changed {
            let _ = tx.unbounded_send(());
        }
        let _ = self.combine.unbounded_send(());
    }

    fn cache_targets(&self,
                     roster: &MonitorConfigMap)
                     -> (HashMap<String, PollTarget>, HashMap<String, PollTarget>) {
        let mut health = HashMap::new();
        let mut stat = HashMap::new();
        for (name, server) in &roster.traffic_servers {
            if !CacheStatus::parse(&server.status).polled() {
                continue;
            }
            let params = roster.parameters(server);
            let url = poll_url(server, params);
            if let Err(e) = Url::parse(&url) {
                error!("skipping {}: bad poll url '{}': {}", name, url, e);
                continue;
            }
            let timeout = params.and_then(|p| p.connection_timeout_ms)
                .map(Duration::from_millis);
            health.insert(name.to_string(),
                          PollTarget {
                              url: with_query(&url, "application=system"),
                              timeout: timeout,
                          });
            stat.insert(name.to_string(),
                        PollTarget {
                            url: url,
                            timeout: timeout,
                        });
        }
        (health, stat)
    }

    fn peer_targets(&self, roster: &MonitorConfigMap) -> HashMap<String, PollTarget> {
        let mut peers = HashMap::new();
        for (name, monitor) in &roster.traffic_monitors {
            if CacheStatus::parse(&monitor.status) != CacheStatus::Online {
                continue;
            }
            if let Some(ref own) = self.host_name {
                if own == name.as_str() {
                    continue;
                }
            }
            let port = if monitor.port == 0 { 80 } else { monitor.port };
            peers.insert(name.to_string(),
                         PollTarget {
                             url: format!("http://{}:{}/publish/CrStates", monitor.fqdn, port),
                             timeout: None,
                         });
        }
        peers
    }
}

/// Builds a cache's poll URL from its profile template, or a bare default
/// when the profile has none. `${hostname}` expands to the server's IP so
/// polling never depends on DNS.
fn poll_url(server: &TrafficServer, params: Option<&Parameters>) -> String {
    let port = if server.port == 0 { 80 } else { server.port };
    match params.and_then(|p| p.polling_url.as_ref()) {
        Some(template) => template.replace(HOSTNAME_VAR, &server.ip),
        None => format!("http://{}:{}/_status", server.ip, port),
    }
}

fn with_query(url: &str, query: &str) -> String {
    if url.contains('?') {
        format!("{}&{}", url, query)
    } else {
        format!("{}?{}", url, query)
    }
}

impl Future for MonitorConfigManager {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            match self.configs.poll() {
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Ok(Async::Ready(Some((roster, topology)))) => self.apply(roster, topology),
                Ok(Async::Ready(None)) | Err(()) => return Ok(Async::Ready(())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{poll_url, with_query};
    use ops::{Parameters, TrafficServer};

    #[test]
    fn poll_url_expands_the_hostname_variable() {
        let mut server = TrafficServer::default();
        server.ip = "192.0.2.9".to_string();
        server.port = 8080;

        let mut params = Parameters::default();
        params.polling_url = Some("http://${hostname}/_status".to_string());
        assert_eq!(poll_url(&server, Some(&params)), "http://192.0.2.9/_status");
        assert_eq!(poll_url(&server, None), "http://192.0.2.9:8080/_status");
    }

    #[test]
    fn health_query_is_appended() {
        assert_eq!(with_query("http://x/_status", "application=system"),
                   "http://x/_status?application=system");
        assert_eq!(with_query("http://x/_status?a=b", "application=system"),
                   "http://x/_status?a=b&application=system");
    }
}
