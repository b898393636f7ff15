//! Typed names for the objects the monitor tracks.
//!
//! Names arrive as JSON map keys from the upstream CDN document, so each
//! newtype serializes as a bare string.

use std::fmt;

macro_rules! name_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialOrd, PartialEq,
                 Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> $name {
                $name(s)
            }
        }

        impl<'a> From<&'a str> for $name {
            fn from(s: &'a str) -> $name {
                $name(s.into())
            }
        }
    };
}

name_type! {
    /// The host name of a monitored cache server.
    CacheName
}
name_type! {
    /// The name of a delivery service (a named content route).
    DsName
}
name_type! {
    /// The name of a cache group (a cluster of caches in one location).
    CacheGroupName
}
name_type! {
    /// The host name of a peer monitor.
    MonitorName
}

/// The administrative status of a cache, as set upstream.
///
/// `Online` and `Offline` caches are never polled: their availability is
/// dictated, not measured. `AdminDown` caches are polled (so statistics
/// continue to accrue) but always published as unavailable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheStatus {
    Reported,
    Online,
    Offline,
    AdminDown,
    Invalid,
}

impl CacheStatus {
    pub fn parse(s: &str) -> CacheStatus {
        match s {
            "REPORTED" => CacheStatus::Reported,
            "ONLINE" => CacheStatus::Online,
            "OFFLINE" => CacheStatus::Offline,
            "ADMIN_DOWN" => CacheStatus::AdminDown,
            _ => CacheStatus::Invalid,
        }
    }

    /// Whether a cache with this status is polled at all.
    pub fn polled(&self) -> bool {
        match *self {
            CacheStatus::Online | CacheStatus::Offline => false,
            _ => true,
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            CacheStatus::Reported => "REPORTED",
            CacheStatus::Online => "ONLINE",
            CacheStatus::Offline => "OFFLINE",
            CacheStatus::AdminDown => "ADMIN_DOWN",
            CacheStatus::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// The tier of a cache server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheType {
    Edge,
    Mid,
    Invalid,
}

impl CacheType {
    pub fn parse(s: &str) -> CacheType {
        match s {
            "EDGE" => CacheType::Edge,
            "MID" => CacheType::Mid,
            _ => CacheType::Invalid,
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            CacheType::Edge => "EDGE",
            CacheType::Mid => "MID",
            CacheType::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// The routing protocol of a delivery service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DsType {
    Http,
    Dns,
    Invalid,
}

impl DsType {
    pub fn parse(s: &str) -> DsType {
        match s {
            "HTTP" => DsType::Http,
            "DNS" => DsType::Dns,
            _ => DsType::Invalid,
        }
    }
}

impl fmt::Display for DsType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            DsType::Http => "HTTP",
            DsType::Dns => "DNS",
            DsType::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

#[test]
fn parse_statuses() {
    assert_eq!(CacheStatus::parse("REPORTED"), CacheStatus::Reported);
    assert_eq!(CacheStatus::parse("ADMIN_DOWN"), CacheStatus::AdminDown);
    assert_eq!(CacheStatus::parse("bogus"), CacheStatus::Invalid);
    assert!(!CacheStatus::Online.polled());
    assert!(!CacheStatus::Offline.polled());
    assert!(CacheStatus::AdminDown.polled());
    assert!(CacheStatus::Reported.polled());
}

#[test]
fn names_serialize_as_strings() {
    let name = CacheName::from("edge-den-01");
    let js = ::serde_json::to_string(&name).unwrap();
    assert_eq!(js, "\"edge-den-01\"");
    let back: CacheName = ::serde_json::from_str(&js).unwrap();
    assert_eq!(back, name);
}
