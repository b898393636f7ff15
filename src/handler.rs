//! Decodes poll responses into results.
//!
//! The three handler kinds are a closed set with explicit dispatch; a
//! handler invocation always emits exactly one result on its channel,
//! error-valued or not, so the aggregator can release the poll and the
//! pending gauge always balances.

use bytes::Bytes;
use cache::{CacheResult, DsBytes, FetchError, Precomputed, StatsDoc, Vitals};
use cell::Cell;
use futures::unsync::{mpsc, oneshot};
use names::{CacheName, MonitorName};
use peer::CrStates;
use serde_json;
use std::time::{Duration, SystemTime};
use topology::Topology;

/// One poll of one peer monitor.
#[derive(Debug)]
pub struct PeerResult {
    pub id: MonitorName,
    pub poll_id: u64,
    pub time: SystemTime,
    pub states: Result<CrStates, FetchError>,
    pub poll_finished: Option<oneshot::Sender<u64>>,
}

impl PeerResult {
    pub fn finish(&mut self) {
        if let Some(tx) = self.poll_finished.take() {
            if tx.send(self.poll_id).is_err() {
                debug!("peer poll {} finished for {} after its worker died",
                       self.poll_id,
                       self.id);
            }
        }
    }
}

#[derive(Clone)]
pub struct HealthHandler {
    results: mpsc::UnboundedSender<CacheResult>,
}

#[derive(Clone)]
pub struct StatHandler {
    results: mpsc::UnboundedSender<CacheResult>,
    topology: Cell<Topology>,
}

#[derive(Clone)]
pub struct PeerHandler {
    results: mpsc::UnboundedSender<PeerResult>,
}

#[derive(Clone)]
pub enum Handler {
    Health(HealthHandler),
    Stat(StatHandler),
    Peer(PeerHandler),
}

impl Handler {
    /// A handler for the lightweight health poll.
    pub fn health() -> (Handler, mpsc::UnboundedReceiver<CacheResult>) {
        let (tx, rx) = mpsc::unbounded();
        (Handler::Health(HealthHandler { results: tx }), rx)
    }

    /// A handler for the full statistics poll, which also precomputes the
    /// per-delivery-service rollups against the current topology.
    pub fn stat(topology: Cell<Topology>) -> (Handler, mpsc::UnboundedReceiver<CacheResult>) {
        let (tx, rx) = mpsc::unbounded();
        (Handler::Stat(StatHandler {
                           results: tx,
                           topology: topology,
                       }),
         rx)
    }

    /// A handler for polls of peer monitors.
    pub fn peer() -> (Handler, mpsc::UnboundedReceiver<PeerResult>) {
        let (tx, rx) = mpsc::unbounded();
        (Handler::Peer(PeerHandler { results: tx }), rx)
    }

    pub fn handle(&self,
                  id: &str,
                  body: Result<Bytes, FetchError>,
                  start: SystemTime,
                  end: SystemTime,
                  poll_id: u64,
                  finished: oneshot::Sender<u64>) {
        match *self {
            Handler::Health(ref h) => {
                let result = decode_cache_result(id, body, start, end, poll_id, finished);
                if h.results.unbounded_send(result).is_err() {
                    debug!("dropping health result for {}: consumer is gone", id);
                }
            }
            Handler::Stat(ref h) => {
                let mut result = decode_cache_result(id, body, start, end, poll_id, finished);
                if result.error.is_none() {
                    if let Some(ref doc) = result.doc {
                        result.precomputed = Some(precompute(doc, &h.topology.get()));
                    }
                }
                if h.results.unbounded_send(result).is_err() {
                    debug!("dropping stat result for {}: consumer is gone", id);
                }
            }
            Handler::Peer(ref h) => {
                let states = body.and_then(|bytes| {
                    CrStates::unmarshal(&bytes)
                        .map_err(|e| FetchError::Decode(e.to_string()))
                });
                let result = PeerResult {
                    id: MonitorName::from(id),
                    poll_id: poll_id,
                    time: end,
                    states: states,
                    poll_finished: Some(finished),
                };
                if h.results.unbounded_send(result).is_err() {
                    debug!("dropping peer result for {}: consumer is gone", id);
                }
            }
        }
    }
}

fn decode_cache_result(id: &str,
                       body: Result<Bytes, FetchError>,
                       start: SystemTime,
                       end: SystemTime,
                       poll_id: u64,
                       finished: oneshot::Sender<u64>)
                       -> CacheResult {
    let decoded: Result<StatsDoc, FetchError> = body.and_then(|bytes| {
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    });
    let (doc, error) = match decoded {
        Ok(doc) => (Some(doc), None),
        Err(e) => (None, Some(e)),
    };
    CacheResult {
        id: CacheName::from(id),
        poll_id: poll_id,
        time: end,
        duration: end.duration_since(start).unwrap_or(Duration::new(0, 0)),
        error: error,
        doc: doc,
        vitals: Vitals::default(),
        precomputed: None,
        poll_finished: Some(finished),
    }
}

const REMAP_PREFIX: &'static str = "remap.";

/// Extracts per-delivery-service counters from the statistics map.
///
/// Remap counters are keyed `remap.<fqdn>.<field>`; the FQDN routes to a
/// delivery service through the topology matcher. Counters that fail to
/// route are noted on the result but do not fail the poll.
pub fn precompute(doc: &StatsDoc, topology: &Topology) -> Precomputed {
    let mut pre = Precomputed::default();
    pre.out_bytes = doc.system.bytes_out;
    pre.connections = doc.system.connections;

    for (key, value) in &doc.stats {
        if !key.starts_with(REMAP_PREFIX) {
            continue;
        }
        let rest = &key[REMAP_PREFIX.len()..];
        let dot = match rest.rfind('.') {
            Some(dot) => dot,
            None => continue,
        };
        let (fqdn, field) = (&rest[..dot], &rest[dot + 1..]);

        let n = match value.as_u64() {
            Some(n) => n,
            None => {
                pre.err = Some(format!("stat '{}' is not a number", key));
                continue;
            }
        };
        let ds = match topology.matcher.delivery_service_fqdn(fqdn) {
            Some(ds) => ds,
            None => {
                pre.err = Some(format!("no delivery service matches '{}'", fqdn));
                continue;
            }
        };

        let entry = pre.ds.entry(ds).or_insert_with(DsBytes::default);
        match field {
            "out_bytes" => entry.out_bytes += n,
            "in_bytes" => entry.in_bytes += n,
            "status_5xx" => entry.status_5xx += n,
            _ => {}
        }
    }
    pre
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cache::FetchError;
    use cell::Cell;
    use futures::Stream;
    use futures::unsync::oneshot;
    use names::DsName;
    use std::time::SystemTime;
    use topology::Topology;

    fn topo() -> Topology {
        Topology::from_json(br#"{
          "contentServers": {},
          "deliveryServices": {
            "ds-foo": {"matchsets": [{"protocol": "HTTP",
                                      "matchlist": [{"regex": ".*\\.foo\\..*"}]}]}
          }
        }"#)
            .unwrap()
    }

    #[test]
    fn every_invocation_yields_exactly_one_result() {
        let (handler, rx) = Handler::health();
        let now = SystemTime::now();

        let (tx1, _rx1) = oneshot::channel();
        handler.handle("edge",
                       Ok(Bytes::from(&br#"{"system": {"bytesOut": 7}}"#[..])),
                       now,
                       now,
                       1,
                       tx1);
        let (tx2, _rx2) = oneshot::channel();
        handler.handle("edge", Err(FetchError::Timeout), now, now, 2, tx2);
        let (tx3, _rx3) = oneshot::channel();
        handler.handle("edge",
                       Ok(Bytes::from(&b"not json"[..])),
                       now,
                       now,
                       3,
                       tx3);
        drop(handler);

        let results: Vec<_> = rx.wait().map(|r| r.unwrap()).collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].error.is_none());
        assert_eq!(results[0].doc.as_ref().unwrap().system.bytes_out, 7);
        assert_eq!(results[1].error, Some(FetchError::Timeout));
        match results[2].error {
            Some(FetchError::Decode(_)) => {}
            ref other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn stat_handler_precomputes_rollups() {
        let (handler, rx) = Handler::stat(Cell::new(topo()));
        let now = SystemTime::now();
        let body = br#"{"system": {"bytesOut": 100, "connections": 2},
                        "stats": {"remap.bar.foo.example.out_bytes": 40,
                                  "remap.bar.foo.example.status_5xx": 2,
                                  "remap.unknown.host.example.out_bytes": 5}}"#;
        let (tx, _rx1) = oneshot::channel();
        handler.handle("edge", Ok(Bytes::from(&body[..])), now, now, 1, tx);
        drop(handler);

        let results: Vec<_> = rx.wait().map(|r| r.unwrap()).collect();
        let pre = results[0].precomputed.as_ref().unwrap();
        assert_eq!(pre.out_bytes, 100);
        assert_eq!(pre.connections, 2);
        let ds = &pre.ds[&DsName::from("ds-foo")];
        assert_eq!(ds.out_bytes, 40);
        assert_eq!(ds.status_5xx, 2);
        // the unroutable counter is noted but not fatal.
        assert!(pre.err.as_ref().unwrap().contains("unknown.host.example"));
    }

    #[test]
    fn peer_handler_decodes_crstates() {
        let (handler, rx) = Handler::peer();
        let now = SystemTime::now();
        let body = br#"{"caches": {"edge": {"isAvailable": true}},
                        "deliveryServices": {}}"#;
        let (tx, _rx1) = oneshot::channel();
        handler.handle("mon-1", Ok(Bytes::from(&body[..])), now, now, 1, tx);
        let (tx, _rx2) = oneshot::channel();
        handler.handle("mon-1", Err(FetchError::Timeout), now, now, 2, tx);
        drop(handler);

        let results: Vec<_> = rx.wait().map(|r| r.unwrap()).collect();
        assert_eq!(results.len(), 2);
        let states = results[0].states.as_ref().unwrap();
        assert!(states.caches[&::names::CacheName::from("edge")].is_available);
        assert!(results[1].states.is_err());
    }
}
