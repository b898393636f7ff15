extern crate edgemon;
extern crate env_logger;
extern crate futures;
extern crate hyper;
extern crate tacho;
extern crate tokio_core;
extern crate tokio_timer;

mod mocks;

use edgemon::fetcher::Fetcher;
use edgemon::handler::Handler;
use edgemon::instrument::{Counter, Counters};
use edgemon::poller::{HttpPoller, PollTarget, PollerConfig};
use futures::{Future, Stream, future};
use futures::unsync::oneshot;
use hyper::server::Http;
use mocks::MockCache;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio_core::net::TcpListener;
use tokio_core::reactor::{Core, Handle};
use tokio_timer::Timer;

/// Binds a mock cache server on an ephemeral port and returns its
/// address and hit counter.
fn serve_mock_cache(handle: &Handle) -> (SocketAddr, Rc<RefCell<u64>>) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(&addr, handle).expect("bind mock cache");
    let addr = listener.local_addr().expect("mock cache addr");

    let hits = Rc::new(RefCell::new(0));
    let http = Http::new();
    let handle2 = handle.clone();
    let serve_hits = hits.clone();
    let srv = listener.incoming()
        .for_each(move |(socket, peer)| {
            http.bind_connection(&handle2,
                                 socket,
                                 peer,
                                 MockCache { hits: serve_hits.clone() });
            Ok(())
        })
        .map_err(|_| ());
    handle.spawn(srv);
    (addr, hits)
}

/// N fetches, half failing at the transport level, must produce exactly
/// N poll-finished signals carrying a permutation of the submitted poll
/// ids.
#[test]
fn every_fetch_is_finished_exactly_once() {
    drop(env_logger::init());

    let mut core = Core::new().unwrap();
    let handle = core.handle();
    let timer = Timer::default();
    let (metrics, report) = tacho::new();
    drop(report);

    let (good_addr, _hits) = serve_mock_cache(&handle);
    let good_url = format!("http://{}/_status", good_addr);
    // nothing listens on the discard port; connections are refused.
    let bad_url = "http://127.0.0.1:9/_status".to_string();

    let counters = Counters::new();
    let (handler, results) = Handler::health();
    let fetcher = Fetcher::new(&handle,
                               timer,
                               Duration::from_secs(5),
                               counters.clone(),
                               handler,
                               metrics);

    let mut finished = Vec::new();
    for poll_id in 1..101 {
        let (tx, rx) = oneshot::channel();
        finished.push(rx);
        let url = if poll_id % 2 == 0 { &good_url } else { &bad_url };
        let id = format!("cache-{}", poll_id);
        handle.spawn(fetcher.fetch(&id, url, poll_id, tx));
    }

    // stand in for the aggregator: take every result and release it.
    let aggregate = results.take(100)
        .collect()
        .map_err(|_| ())
        .and_then(|mut batch| {
            let errored = batch.iter().filter(|r| r.error.is_some()).count();
            assert_eq!(errored, 50);
            for result in &mut batch {
                result.finish();
            }
            future::join_all(finished).map_err(|_| ())
        });

    let mut ids = core.run(aggregate).expect("pipeline completed");
    ids.sort();
    let expected: Vec<u64> = (1..101).collect();
    assert_eq!(ids, expected);

    assert_eq!(counters.success.get(), 50);
    assert_eq!(counters.fail.get(), 50);
    assert_eq!(counters.pending.get(), 0);
}

fn poller_fixture(handle: &Handle,
                  timer: &Timer)
                  -> (HttpPoller,
                      futures::unsync::mpsc::UnboundedSender<PollerConfig>,
                      futures::unsync::mpsc::UnboundedReceiver<edgemon::cache::CacheResult>,
                      SocketAddr) {
    let (metrics, report) = tacho::new();
    drop(report);
    let (addr, _hits) = serve_mock_cache(handle);
    let (handler, results) = Handler::health();
    let fetcher = Fetcher::new(handle,
                               timer.clone(),
                               Duration::from_secs(5),
                               Counters::new(),
                               handler,
                               metrics);
    let (poller, configs, _ticks) =
        HttpPoller::new(handle.clone(), timer.clone(), fetcher, false, Counter::new());
    (poller, configs, results, addr)
}

fn config_for(targets: Vec<(&str, String)>, interval: Duration) -> PollerConfig {
    let mut map = HashMap::new();
    for (id, url) in targets {
        map.insert(id.to_string(),
                   PollTarget {
                       url: url,
                       timeout: None,
                   });
    }
    PollerConfig {
        interval: interval,
        targets: map,
    }
}

/// Reconfiguring the poller swaps the live worker set: target `a` stops
/// being polled, target `b` starts, and per-target poll ids only grow.
#[test]
fn reconfiguration_replaces_workers() {
    drop(env_logger::init());

    let mut core = Core::new().unwrap();
    let handle = core.handle();
    let timer = Timer::default();
    let (poller, configs, results, addr) = poller_fixture(&handle, &timer);
    handle.spawn(poller);

    let url = format!("http://{}/_status", addr);
    let interval = Duration::from_millis(200);

    let seen: Rc<RefCell<Vec<(String, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    let record = seen.clone();
    // stand in for the aggregator: record and immediately release.
    let driver = results.for_each(move |mut result| {
        record.borrow_mut().push((result.id.to_string(), result.poll_id));
        result.finish();
        Ok(())
    });
    handle.spawn(driver);

    configs.unbounded_send(config_for(vec![("a", url.clone())], interval))
        .expect("send config");

    // phase 1: only `a` polls.
    let wait = timer.sleep(Duration::from_millis(1500)).map_err(|_| ());
    core.run(wait).unwrap();
    {
        let seen = seen.borrow();
        let a_polls: Vec<u64> = seen.iter()
            .filter(|&&(ref id, _)| id.as_str() == "a")
            .map(|&(_, poll_id)| poll_id)
            .collect();
        assert!(a_polls.len() >= 2, "expected several polls of a, saw {:?}", *seen);
        assert!(a_polls.windows(2).all(|w| w[0] < w[1]),
                "poll ids of a must increase: {:?}",
                a_polls);
        assert!(seen.iter().all(|&(ref id, _)| id.as_str() == "a"));
    }

    // phase 2: replace `a` with `b`.
    configs.unbounded_send(config_for(vec![("b", url.clone())], interval))
        .expect("send config");
    let wait = timer.sleep(Duration::from_millis(1500)).map_err(|_| ());
    core.run(wait).unwrap();

    let seen = seen.borrow();
    let b_count = seen.iter().filter(|&&(ref id, _)| id.as_str() == "b").count();
    assert!(b_count >= 2, "expected several polls of b, saw {:?}", *seen);
    // `a` was killed: at most one in-flight result may trail the switch.
    let last_two: Vec<&str> = seen.iter()
        .rev()
        .take(2)
        .map(|&(ref id, _)| id.as_str())
        .collect();
    assert_eq!(last_two, vec!["b", "b"], "a kept polling after removal: {:?}", *seen);
}
