//! The monitoring roster: which servers to poll, with what profile.

use std::collections::HashMap;

const DEFAULT_HISTORY_COUNT: usize = 5;

/// The roster document the ops service serves for one CDN.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfigMap {
    #[serde(default)]
    pub traffic_servers: HashMap<::names::CacheName, TrafficServer>,
    #[serde(default)]
    pub traffic_monitors: HashMap<::names::MonitorName, TrafficMonitor>,
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

/// One monitored cache server.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficServer {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub profile: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub cache_group: String,
}

/// One peer monitor.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficMonitor {
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub parameters: Parameters,
}

/// Per-profile polling and health-threshold parameters. Keys mirror the
/// parameter names in the ops database, hence the dotted renames.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Parameters {
    /// URL template for polling; `${hostname}` expands to the server's IP.
    #[serde(rename = "health.polling.url")]
    pub polling_url: Option<String>,

    /// Per-target HTTP timeout override, milliseconds.
    #[serde(rename = "health.connection.timeout")]
    pub connection_timeout_ms: Option<u64>,

    /// How many results to keep per cache.
    #[serde(rename = "history.count")]
    pub history_count: Option<u64>,

    /// A poll slower than this many milliseconds marks the cache down.
    #[serde(rename = "health.threshold.queryTime")]
    pub threshold_query_time_ms: Option<u64>,

    /// More 5xx responses than this between polls marks the cache down.
    #[serde(rename = "health.threshold.errors")]
    pub threshold_errors: Option<u64>,

    /// A load average above this marks the cache down.
    #[serde(rename = "health.threshold.loadavg")]
    pub threshold_loadavg: Option<f64>,

    /// Statistics that must be present in a full stat document.
    #[serde(rename = "health.required.stats")]
    pub required_stats: Option<Vec<String>>,
}

impl MonitorConfigMap {
    pub fn server(&self, name: &::names::CacheName) -> Option<&TrafficServer> {
        self.traffic_servers.get(name)
    }

    /// The profile parameters for a server; absent profiles behave as
    /// all-defaults.
    pub fn parameters(&self, server: &TrafficServer) -> Option<&Parameters> {
        self.profiles.get(&server.profile).map(|p| &p.parameters)
    }

    pub fn history_count(&self, name: &::names::CacheName) -> usize {
        self.server(name)
            .and_then(|s| self.parameters(s))
            .and_then(|p| p.history_count)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_HISTORY_COUNT)
    }
}

#[test]
fn parse_roster() {
    let js = r#"{
      "trafficServers": {
        "edge-den-01": {"ip": "192.0.2.1", "port": 80,
                        "fqdn": "edge-den-01.cdn.example.net",
                        "status": "REPORTED", "profile": "edge",
                        "type": "EDGE", "cacheGroup": "den"}
      },
      "trafficMonitors": {
        "mon-1": {"fqdn": "mon-1.cdn.example.net", "port": 80,
                  "status": "ONLINE"}
      },
      "profiles": {
        "edge": {"parameters": {
          "health.polling.url": "http://${hostname}/_status",
          "history.count": 30,
          "health.threshold.queryTime": 1000
        }}
      }
    }"#;
    let mc: MonitorConfigMap = ::serde_json::from_str(js).unwrap();
    let name = ::names::CacheName::from("edge-den-01");
    assert_eq!(mc.history_count(&name), 30);
    let server = mc.server(&name).unwrap();
    let params = mc.parameters(server).unwrap();
    assert_eq!(params.threshold_query_time_ms, Some(1000));
    assert!(params.threshold_errors.is_none());
    assert_eq!(mc.history_count(&::names::CacheName::from("nope")),
               DEFAULT_HISTORY_COUNT);
}
