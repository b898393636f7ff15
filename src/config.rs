//! Monitor configuration.

use serde_json;
use serde_yaml;
use std::fs;
use std::io::{self, Read};
use std::time::Duration;

const DEFAULT_HEALTH_POLLING_INTERVAL_MS: u64 = 6_000;
const DEFAULT_STAT_POLLING_INTERVAL_MS: u64 = 10_000;
const DEFAULT_MONITOR_CONFIG_POLLING_INTERVAL_MS: u64 = 5_000;
const DEFAULT_PEER_POLLING_INTERVAL_MS: u64 = 5_000;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_HEALTH_FLUSH_INTERVAL_MS: u64 = 200;
const DEFAULT_STAT_FLUSH_INTERVAL_MS: u64 = 200;
const DEFAULT_MAX_EVENTS: u64 = 200;

/// Holds the configuration for an edgemon instance.
///
/// Parsed from a JSON- or YAML-formatted file; every field has a default
/// so an empty document (or no `--config` at all) is a valid
/// configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    /// How often each cache is polled for its lightweight health document.
    pub cache_health_polling_interval_ms: Option<u64>,

    /// How often each cache is polled for its full statistics document.
    pub cache_stat_polling_interval_ms: Option<u64>,

    /// How often the ops service is polled for the roster and topology.
    pub monitor_config_polling_interval_ms: Option<u64>,

    /// How often peer monitors are polled for their availability states.
    pub peer_polling_interval_ms: Option<u64>,

    /// Default per-request HTTP timeout; profiles may override per target.
    pub http_timeout_ms: Option<u64>,

    /// Upper bound on how long health results may queue before a flush.
    pub health_flush_interval_ms: Option<u64>,

    /// Upper bound on how long stat results may queue before a flush.
    pub stat_flush_interval_ms: Option<u64>,

    /// Capacity of the availability event ring.
    pub max_events: Option<u64>,

    /// When true (the default) a cache is combined-available if any peer
    /// reports it available, even if we do not.
    pub peer_optimistic: Option<bool>,

    /// This monitor's own host name, used to skip polling itself.
    pub host_name: Option<String>,

    pub log_location_error: Option<String>,
    pub log_location_warning: Option<String>,
    pub log_location_info: Option<String>,
    pub log_location_debug: Option<String>,
    pub log_location_event: Option<String>,
}

impl ::std::str::FromStr for Config {
    type Err = io::Error;

    /// Parses a JSON- or YAML-formatted configuration file.
    fn from_str(txt: &str) -> io::Result<Config> {
        let txt = txt.trim_left();
        if txt.is_empty() {
            return Ok(Config::default());
        }
        if txt.starts_with('{') {
            serde_json::from_str(txt).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        } else {
            serde_yaml::from_str(txt).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        }
    }
}

/// Loads the configuration file, or the defaults when no path was given.
pub fn load(path: Option<&str>) -> io::Result<Config> {
    match path {
        None => Ok(Config::default()),
        Some(path) => {
            let mut txt = String::new();
            fs::File::open(path)?.read_to_string(&mut txt)?;
            txt.parse()
        }
    }
}

impl Config {
    pub fn health_polling_interval(&self) -> Duration {
        ms(self.cache_health_polling_interval_ms
               .unwrap_or(DEFAULT_HEALTH_POLLING_INTERVAL_MS))
    }

    pub fn stat_polling_interval(&self) -> Duration {
        ms(self.cache_stat_polling_interval_ms
               .unwrap_or(DEFAULT_STAT_POLLING_INTERVAL_MS))
    }

    pub fn monitor_config_polling_interval(&self) -> Duration {
        ms(self.monitor_config_polling_interval_ms
               .unwrap_or(DEFAULT_MONITOR_CONFIG_POLLING_INTERVAL_MS))
    }

    pub fn peer_polling_interval(&self) -> Duration {
        ms(self.peer_polling_interval_ms
               .unwrap_or(DEFAULT_PEER_POLLING_INTERVAL_MS))
    }

    pub fn http_timeout(&self) -> Duration {
        ms(self.http_timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS))
    }

    pub fn health_flush_interval(&self) -> Duration {
        ms(self.health_flush_interval_ms
               .unwrap_or(DEFAULT_HEALTH_FLUSH_INTERVAL_MS))
    }

    pub fn stat_flush_interval(&self) -> Duration {
        ms(self.stat_flush_interval_ms
               .unwrap_or(DEFAULT_STAT_FLUSH_INTERVAL_MS))
    }

    pub fn max_events(&self) -> usize {
        self.max_events.unwrap_or(DEFAULT_MAX_EVENTS) as usize
    }

    pub fn peer_optimistic(&self) -> bool {
        self.peer_optimistic.unwrap_or(true)
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[test]
fn parse_simple_json() {
    let js = r#"{"cacheHealthPollingIntervalMs": 1500,
                 "peerOptimistic": false,
                 "logLocationError": "stderr"}"#;
    let cfg: Config = js.parse().unwrap();
    assert_eq!(cfg.health_polling_interval(), Duration::from_millis(1500));
    assert!(!cfg.peer_optimistic());
    assert_eq!(cfg.log_location_error.as_ref().unwrap(), "stderr");
}

#[test]
fn parse_simple_yaml() {
    let yaml = "
cacheStatPollingIntervalMs: 9000
maxEvents: 17
";
    let cfg: Config = yaml.parse().unwrap();
    assert_eq!(cfg.stat_polling_interval(), Duration::from_millis(9000));
    assert_eq!(cfg.max_events(), 17);
}

#[test]
fn empty_config_uses_defaults() {
    let cfg: Config = "".parse().unwrap();
    assert_eq!(cfg.http_timeout(), Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS));
    assert!(cfg.peer_optimistic());
}

#[test]
fn unknown_fields_are_rejected() {
    let js = r#"{"nope": 1}"#;
    assert!(js.parse::<Config>().is_err());
}
