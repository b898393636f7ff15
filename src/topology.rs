//! The CDN topology derived from the upstream configuration document.

use names::{CacheGroupName, CacheName, CacheType, DsName, DsType};
use regex::Regex;
use serde_json;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    Parse(serde_json::Error),
    MissingMatch(DsName),
    DuplicateMatch {
        pattern: String,
        first: DsName,
        second: DsName,
    },
    BadRegex {
        pattern: String,
        error: ::regex::Error,
    },
    UnknownCacheType {
        server: CacheName,
        kind: String,
    },
    UnknownDsType {
        ds: DsName,
        kind: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Parse(ref e) => write!(f, "parsing CDN document: {}", e),
            Error::MissingMatch(ref ds) => write!(f, "no match rule for '{}'", ds),
            Error::DuplicateMatch { ref pattern, ref first, ref second } => {
                write!(f,
                       "duplicate match '{}' in '{}' and '{}'",
                       pattern,
                       first,
                       second)
            }
            Error::BadRegex { ref pattern, ref error } => {
                write!(f, "regex '{}' failed to compile: {}", pattern, error)
            }
            Error::UnknownCacheType { ref server, ref kind } => {
                write!(f, "unknown cache type for '{}': '{}'", server, kind)
            }
            Error::UnknownDsType { ref ds, ref kind } => {
                write!(f, "unknown delivery service type for '{}': '{}'", ds, kind)
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Parse(e)
    }
}

/// The slice of the upstream CDN document this monitor needs.
#[derive(Debug, Deserialize)]
pub struct CdnDocument {
    #[serde(rename = "contentServers")]
    pub content_servers: HashMap<CacheName, ContentServer>,
    #[serde(rename = "deliveryServices")]
    pub delivery_services: HashMap<DsName, DsEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ContentServer {
    #[serde(rename = "deliveryServices", default)]
    pub delivery_services: HashMap<DsName, Vec<String>>,
    #[serde(rename = "cacheGroup")]
    pub cache_group: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct DsEntry {
    pub matchsets: Vec<Matchset>,
}

#[derive(Debug, Deserialize)]
pub struct Matchset {
    pub protocol: String,
    pub matchlist: Vec<MatchItem>,
}

#[derive(Debug, Deserialize)]
pub struct MatchItem {
    pub regex: String,
}

/// Routes an FQDN to a delivery service.
///
/// Match rules are bucketed three ways so the common cases stay O(1):
/// 1. rules of the form `.*\.X\..*` where `X` has no regex
///    metacharacters, matched by the FQDN's middle label;
/// 2. rules with no metacharacters at all, matched by the whole FQDN;
/// 3. everything else, compiled and scanned linearly.
#[derive(Clone, Debug, Default)]
pub struct FqdnMatcher {
    middle: HashMap<String, DsName>,
    exact: HashMap<String, DsName>,
    regexes: Vec<(Regex, DsName)>,
}

const MIDDLE_PREFIX: &'static str = r".*\.";
const MIDDLE_SUFFIX: &'static str = r"\..*";
const META_CHARS: &'static str = r"[]^\:{}()|?+*,=%@<>!'";

fn has_meta(s: &str) -> bool {
    s.chars().any(|c| META_CHARS.contains(c))
}

impl FqdnMatcher {
    fn insert(&mut self, pattern: &str, ds: &DsName) -> Result<(), Error> {
        if pattern.starts_with(MIDDLE_PREFIX) && pattern.ends_with(MIDDLE_SUFFIX) {
            let label = &pattern[MIDDLE_PREFIX.len()..pattern.len() - MIDDLE_SUFFIX.len()];
            if !has_meta(label) {
                if let Some(first) = self.middle.get(label) {
                    return Err(Error::DuplicateMatch {
                                   pattern: pattern.into(),
                                   first: first.clone(),
                                   second: ds.clone(),
                               });
                }
                self.middle.insert(label.into(), ds.clone());
                return Ok(());
            }
        }
        if !has_meta(pattern) {
            if let Some(first) = self.exact.get(pattern) {
                return Err(Error::DuplicateMatch {
                               pattern: pattern.into(),
                               first: first.clone(),
                               second: ds.clone(),
                           });
            }
            self.exact.insert(pattern.into(), ds.clone());
            return Ok(());
        }
        match Regex::new(pattern) {
            Ok(re) => {
                self.regexes.push((re, ds.clone()));
                Ok(())
            }
            Err(error) => {
                Err(Error::BadRegex {
                        pattern: pattern.into(),
                        error: error,
                    })
            }
        }
    }

    /// Returns the delivery service serving
    /// `subsubdomain.subdomain.domain`, if any.
    pub fn delivery_service(&self,
                            domain: &str,
                            subdomain: &str,
                            subsubdomain: &str)
                            -> Option<DsName> {
        if let Some(ds) = self.middle.get(subdomain) {
            return Some(ds.clone());
        }
        let fqdn = format!("{}.{}.{}", subsubdomain, subdomain, domain);
        if let Some(ds) = self.exact.get(&fqdn) {
            return Some(ds.clone());
        }
        for &(ref re, ref ds) in &self.regexes {
            if re.is_match(&fqdn) {
                return Some(ds.clone());
            }
        }
        None
    }

    /// Matches a dotted FQDN without pre-split labels.
    pub fn delivery_service_fqdn(&self, fqdn: &str) -> Option<DsName> {
        let mut labels = fqdn.splitn(3, '.');
        let subsub = labels.next().unwrap_or("");
        let sub = labels.next().unwrap_or("");
        let domain = labels.next().unwrap_or("");
        self.delivery_service(domain, sub, subsub)
    }
}

/// The maps the aggregation pipeline needs, all derived from one CDN
/// document. Construction is pure: the same document always yields the
/// same topology.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    pub ds_servers: HashMap<DsName, Vec<CacheName>>,
    pub server_dses: HashMap<CacheName, Vec<DsName>>,
    pub server_types: HashMap<CacheName, CacheType>,
    pub server_cachegroups: HashMap<CacheName, CacheGroupName>,
    pub ds_types: HashMap<DsName, DsType>,
    pub matcher: FqdnMatcher,
}

impl Topology {
    pub fn from_json(bytes: &[u8]) -> Result<Topology, Error> {
        let doc: CdnDocument = serde_json::from_slice(bytes)?;
        Topology::from_document(&doc)
    }

    pub fn from_document(doc: &CdnDocument) -> Result<Topology, Error> {
        let mut topo = Topology::default();

        let mut servers: Vec<&CacheName> = doc.content_servers.keys().collect();
        servers.sort();
        for server in servers {
            let data = &doc.content_servers[server];

            let kind = CacheType::parse(&data.kind);
            if kind == CacheType::Invalid {
                return Err(Error::UnknownCacheType {
                               server: server.clone(),
                               kind: data.kind.clone(),
                           });
            }
            topo.server_types.insert(server.clone(), kind);
            topo.server_cachegroups
                .insert(server.clone(), CacheGroupName::from(data.cache_group.as_str()));

            let mut dses: Vec<&DsName> = data.delivery_services.keys().collect();
            dses.sort();
            for ds in dses {
                topo.ds_servers
                    .entry(ds.clone())
                    .or_insert_with(Vec::new)
                    .push(server.clone());
                topo.server_dses
                    .entry(server.clone())
                    .or_insert_with(Vec::new)
                    .push(ds.clone());
            }
        }

        let mut dses: Vec<&DsName> = doc.delivery_services.keys().collect();
        dses.sort();
        for ds in dses {
            let entry = &doc.delivery_services[ds];
            if entry.matchsets.is_empty() || entry.matchsets[0].matchlist.is_empty() {
                return Err(Error::MissingMatch(ds.clone()));
            }

            let kind = DsType::parse(&entry.matchsets[0].protocol);
            if kind == DsType::Invalid {
                return Err(Error::UnknownDsType {
                               ds: ds.clone(),
                               kind: entry.matchsets[0].protocol.clone(),
                           });
            }
            topo.ds_types.insert(ds.clone(), kind);

            for matchset in &entry.matchsets {
                if matchset.matchlist.is_empty() {
                    return Err(Error::MissingMatch(ds.clone()));
                }
                topo.matcher.insert(&matchset.matchlist[0].regex, ds)?;
            }
        }

        Ok(topo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use names::{CacheType, DsName, DsType};

    fn document() -> &'static str {
        r#"{
          "contentServers": {
            "edge-den-01": {
              "deliveryServices": {"ds-foo": ["foo.example.net"]},
              "cacheGroup": "den",
              "type": "EDGE"
            },
            "edge-den-02": {
              "deliveryServices": {"ds-foo": ["foo.example.net"],
                                   "ds-exact": ["exact.example.com"]},
              "cacheGroup": "den",
              "type": "EDGE"
            },
            "mid-den-01": {
              "cacheGroup": "den-mid",
              "type": "MID"
            }
          },
          "deliveryServices": {
            "ds-foo": {"matchsets": [{"protocol": "HTTP",
                                      "matchlist": [{"regex": ".*\\.foo\\..*"}]}]},
            "ds-exact": {"matchsets": [{"protocol": "HTTP",
                                        "matchlist": [{"regex": "exact.example.com"}]}]},
            "ds-edge": {"matchsets": [{"protocol": "DNS",
                                       "matchlist": [{"regex": ".*-edge\\..*\\.com"}]}]}
          }
        }"#
    }

    #[test]
    fn builds_maps_from_document() {
        let topo = Topology::from_json(document().as_bytes()).unwrap();

        let foo = DsName::from("ds-foo");
        assert_eq!(topo.ds_servers[&foo],
                   vec!["edge-den-01".into(), "edge-den-02".into()]);
        assert_eq!(topo.server_types[&"mid-den-01".into()], CacheType::Mid);
        assert_eq!(topo.server_cachegroups[&"edge-den-01".into()], "den".into());
        assert_eq!(topo.ds_types[&"ds-edge".into()], DsType::Dns);
        assert_eq!(topo.server_dses[&"edge-den-02".into()].len(), 2);
    }

    #[test]
    fn construction_is_pure() {
        let a = Topology::from_json(document().as_bytes()).unwrap();
        let b = Topology::from_json(document().as_bytes()).unwrap();
        assert_eq!(a.ds_servers, b.ds_servers);
        assert_eq!(a.server_dses, b.server_dses);
        assert_eq!(a.server_cachegroups, b.server_cachegroups);
    }

    #[test]
    fn matcher_tiers() {
        let topo = Topology::from_json(document().as_bytes()).unwrap();
        let m = &topo.matcher;

        // .*\.foo\..* matches on the middle label.
        assert_eq!(m.delivery_service("example", "foo", "bar"),
                   Some(DsName::from("ds-foo")));
        // a metacharacter-free rule matches the whole FQDN.
        assert_eq!(m.delivery_service("com", "example", "exact"),
                   Some(DsName::from("ds-exact")));
        // everything else is a real regex scan.
        assert_eq!(m.delivery_service("com", "x", "abc-edge"),
                   Some(DsName::from("ds-edge")));
        assert_eq!(m.delivery_service("qux", "qux", "qux"), None);
    }

    #[test]
    fn matcher_fqdn_form() {
        let topo = Topology::from_json(document().as_bytes()).unwrap();
        assert_eq!(topo.matcher.delivery_service_fqdn("bar.foo.example"),
                   Some(DsName::from("ds-foo")));
        assert_eq!(topo.matcher.delivery_service_fqdn("abc-edge.x.com"),
                   Some(DsName::from("ds-edge")));
    }

    #[test]
    fn duplicate_middle_labels_are_rejected() {
        let js = r#"{
          "contentServers": {},
          "deliveryServices": {
            "a": {"matchsets": [{"protocol": "HTTP",
                                 "matchlist": [{"regex": ".*\\.foo\\..*"}]}]},
            "b": {"matchsets": [{"protocol": "HTTP",
                                 "matchlist": [{"regex": ".*\\.foo\\..*"}]}]}
          }
        }"#;
        match Topology::from_json(js.as_bytes()) {
            Err(Error::DuplicateMatch { .. }) => {}
            other => panic!("expected duplicate match error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn unknown_types_are_rejected() {
        let js = r#"{
          "contentServers": {
            "edge": {"cacheGroup": "g", "type": "TOASTER"}
          },
          "deliveryServices": {}
        }"#;
        match Topology::from_json(js.as_bytes()) {
            Err(Error::UnknownCacheType { .. }) => {}
            other => panic!("expected unknown type error, got {:?}", other.is_ok()),
        }
    }
}
