//! The ops service: where the roster and topology come from.
//!
//! The monitor only ever consumes two documents from ops (the monitoring
//! roster and the CDN topology snapshot), so the session is a small trait
//! with one thin HTTP implementation. Everything else about ops
//! (administration, object CRUD) is someone else's problem.

use futures::{Future, IntoFuture, Stream};
use hyper::{self, Client, Method, Request, StatusCode};
use hyper::client::HttpConnector;
use names::{CacheName, CacheStatus, MonitorName};
use serde_json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::Duration;
use tacho::{self, Timing};
use tokio_core::reactor::Handle;
use tokio_timer::Timer;

mod roster;
pub use self::roster::{MonitorConfigMap, Parameters, Profile, TrafficMonitor, TrafficServer};

#[derive(Debug)]
pub enum Error {
    Http(hyper::Error),
    Uri(hyper::error::UriError),
    Status(StatusCode),
    Decode(serde_json::Error),
    LoginRejected,
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Http(ref e) => write!(f, "ops request failed: {}", e),
            Error::Uri(ref e) => write!(f, "bad ops url: {}", e),
            Error::Status(code) => write!(f, "ops answered {}", code),
            Error::Decode(ref e) => write!(f, "decoding ops response: {}", e),
            Error::LoginRejected => write!(f, "ops rejected the login"),
            Error::Timeout => write!(f, "ops request timed out"),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Http(e)
    }
}

impl From<hyper::error::UriError> for Error {
    fn from(e: hyper::error::UriError) -> Error {
        Error::Uri(e)
    }
}

/// The ops credentials file given on the command line, reread on write.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsConfig {
    pub username: String,
    pub password: String,
    /// Base URL of the ops service, e.g. `http://ops.cdn.example.net`.
    pub url: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    pub cdn_name: String,
}

impl OpsConfig {
    pub fn parse(bytes: &[u8]) -> io::Result<OpsConfig> {
        serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// What the monitor needs from ops, independent of transport.
pub trait OpsSession {
    /// Fetches the monitoring roster for a CDN.
    fn monitor_config(&self, cdn: &str) -> Box<Future<Item = MonitorConfigMap, Error = Error>>;

    /// Fetches the raw CDN topology document for a CDN.
    fn cdn_document(&self, cdn: &str) -> Box<Future<Item = Vec<u8>, Error = Error>>;
}

#[derive(Serialize)]
struct Credentials<'a> {
    u: &'a str,
    p: &'a str,
}

#[derive(Clone)]
struct Stats {
    request_latency_ms: tacho::Stat,
    success_count: tacho::Counter,
    failure_count: tacho::Counter,
}

impl Stats {
    fn new(metrics: tacho::Scope) -> Stats {
        let metrics = metrics.labeled("service".into(), "ops");
        Stats {
            request_latency_ms: metrics.stat("ops_request_latency_ms".into()),
            success_count: metrics.counter("ops_success_count".into()),
            failure_count: metrics.counter("ops_failure_count".into()),
        }
    }
}

/// A cookie-authenticated HTTP session against the ops service.
///
/// The first request logs in and keeps the session cookie; a rejected
/// request drops the cookie so the next attempt logs in again.
#[derive(Clone)]
pub struct HttpSession {
    client: Rc<Client<HttpConnector>>,
    base: String,
    username: String,
    password: String,
    cookie: Rc<RefCell<Option<String>>>,
    timer: Timer,
    timeout: Duration,
    stats: Stats,
}

impl HttpSession {
    pub fn new(config: &OpsConfig,
               handle: &Handle,
               timer: Timer,
               timeout: Duration,
               metrics: tacho::Scope)
               -> HttpSession {
        if config.url.starts_with("https:") {
            warn!("ops url {} requests TLS, which this client does not speak",
                  config.url);
        }
        HttpSession {
            client: Rc::new(Client::new(handle)),
            base: config.url.trim_right_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            cookie: Rc::new(RefCell::new(None)),
            timer: timer,
            timeout: timeout,
            stats: Stats::new(metrics),
        }
    }

    fn deadline<F>(&self, f: F) -> Box<Future<Item = F::Item, Error = Error>>
        where F: Future<Error = Error> + 'static
    {
        let sleep = self.timer
            .sleep(self.timeout)
            .then(|_| Err(Error::Timeout));
        Box::new(f.select(sleep).then(|r| match r {
                                          Ok((item, _)) => Ok(item),
                                          Err((e, _)) => Err(e),
                                      }))
    }

    fn login(&self) -> Box<Future<Item = (), Error = Error>> {
        let url = format!("{}/api/user/login", self.base);
        let uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => return Box::new(Err(Error::Uri(e)).into_future()),
        };
        let creds = Credentials {
            u: &self.username,
            p: &self.password,
        };
        let body = match serde_json::to_vec(&creds) {
            Ok(body) => body,
            Err(e) => return Box::new(Err(Error::Decode(e)).into_future()),
        };

        debug!("logging in to ops at {}", url);
        let mut req = Request::new(Method::Post, uri);
        req.headers_mut().set_raw("Content-Type", "application/json");
        req.set_body(body);
        let cookie = self.cookie.clone();
        let f = self.client
            .request(req)
            .from_err()
            .and_then(move |rsp| {
                if rsp.status() != StatusCode::Ok {
                    return Err(Error::LoginRejected);
                }
                let session = rsp.headers()
                    .get_raw("set-cookie")
                    .and_then(|raw| raw.one())
                    .and_then(|line| ::std::str::from_utf8(line).ok())
                    .map(|line| line.split(';').next().unwrap_or(line).to_string());
                match session {
                    Some(c) => {
                        *cookie.borrow_mut() = Some(c);
                        Ok(())
                    }
                    None => Err(Error::LoginRejected),
                }
            });
        self.deadline(f)
    }

    fn get_bytes(&self, path: &str) -> Box<Future<Item = Vec<u8>, Error = Error>> {
        let url = format!("{}{}", self.base, path);
        let uri: hyper::Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => return Box::new(Err(Error::Uri(e)).into_future()),
        };

        let login = if self.cookie.borrow().is_some() {
            Box::new(Ok(()).into_future()) as Box<Future<Item = (), Error = Error>>
        } else {
            self.login()
        };

        let client = self.client.clone();
        let cookie = self.cookie.clone();
        let mut stats = self.stats.clone();
        let start_t = Timing::start();
        let f = login.and_then(move |_| {
                let mut req = Request::new(Method::Get, uri);
                if let Some(ref c) = *cookie.borrow() {
                    req.headers_mut().set_raw("Cookie", c.clone());
                }
                client.request(req).from_err().and_then(move |rsp| {
                    let status = rsp.status();
                    if status != StatusCode::Ok {
                        // Force a fresh login before the next attempt.
                        *cookie.borrow_mut() = None;
                        return Box::new(Err(Error::Status(status)).into_future()) as
                               Box<Future<Item = Vec<u8>, Error = Error>>;
                    }
                    let body = rsp.body()
                        .concat2()
                        .from_err()
                        .map(|chunk| chunk.to_vec());
                    Box::new(body)
                })
            })
            .then(move |r| {
                stats.request_latency_ms.add(start_t.elapsed_ms());
                if r.is_ok() {
                    stats.success_count.incr(1);
                } else {
                    stats.failure_count.incr(1);
                }
                r
            });
        self.deadline(f)
    }
}

impl OpsSession for HttpSession {
    fn monitor_config(&self, cdn: &str) -> Box<Future<Item = MonitorConfigMap, Error = Error>> {
        let f = self.get_bytes(&format!("/api/cdns/{}/configs/monitoring", cdn))
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Error::Decode));
        Box::new(f)
    }

    fn cdn_document(&self, cdn: &str) -> Box<Future<Item = Vec<u8>, Error = Error>> {
        self.get_bytes(&format!("/api/cdns/{}/snapshot", cdn))
    }
}

/// Collects the polled caches and the ONLINE peers from a roster.
///
/// `ONLINE` and `OFFLINE` caches are not polled; their availability is
/// administrative, not measured.
pub fn polled_caches(mc: &MonitorConfigMap) -> HashMap<CacheName, ()> {
    let mut polled = HashMap::new();
    for (name, server) in &mc.traffic_servers {
        if CacheStatus::parse(&server.status).polled() {
            polled.insert(name.clone(), ());
        }
    }
    polled
}

pub fn online_monitors(mc: &MonitorConfigMap) -> HashMap<MonitorName, ()> {
    let mut online = HashMap::new();
    for (name, monitor) in &mc.traffic_monitors {
        if CacheStatus::parse(&monitor.status) == CacheStatus::Online {
            online.insert(name.clone(), ());
        }
    }
    online
}

#[test]
fn dictated_statuses_are_never_polled() {
    let mc: MonitorConfigMap = serde_json::from_str(r#"{
        "trafficServers": {
            "reported": {"status": "REPORTED"},
            "admin-down": {"status": "ADMIN_DOWN"},
            "online": {"status": "ONLINE"},
            "offline": {"status": "OFFLINE"}
        }
    }"#)
        .unwrap();
    let polled = polled_caches(&mc);
    assert!(polled.contains_key(&CacheName::from("reported")));
    assert!(polled.contains_key(&CacheName::from("admin-down")));
    assert!(!polled.contains_key(&CacheName::from("online")));
    assert!(!polled.contains_key(&CacheName::from("offline")));
}
