//! One HTTP GET per poll.

use bytes::{BufMut, Bytes, BytesMut};
use cache::FetchError;
use futures::{Future, IntoFuture, Stream};
use futures::unsync::oneshot;
use handler::Handler;
use hyper::{self, Chunk, Client, StatusCode};
use hyper::client::HttpConnector;
use instrument::Counters;
use std::rc::Rc;
use std::time::{Duration, SystemTime};
use tacho::{self, Timing};
use tokio_core::reactor::Handle;
use tokio_timer::Timer;

type BodyFuture = Box<Future<Item = Bytes, Error = FetchError>>;

/// Issues polls against cache servers.
///
/// One fetcher is built per poller as a template; workers whose profile
/// overrides the timeout copy the template, which shares the underlying
/// client. Errors are never retried here: the next tick is the retry.
#[derive(Clone)]
pub struct Fetcher {
    client: Rc<Client<HttpConnector>>,
    timeout: Duration,
    timer: Timer,
    counters: Counters,
    handler: Handler,
    stats: Stats,
}

impl Fetcher {
    pub fn new(handle: &Handle,
               timer: Timer,
               timeout: Duration,
               counters: Counters,
               handler: Handler,
               metrics: tacho::Scope)
               -> Fetcher {
        Fetcher {
            client: Rc::new(Client::new(handle)),
            timeout: timeout,
            timer: timer,
            counters: counters,
            handler: handler,
            stats: Stats::new(metrics),
        }
    }

    /// Copies this fetcher with a different timeout, sharing its client.
    pub fn with_timeout(&self, timeout: Duration) -> Fetcher {
        let mut fetcher = self.clone();
        fetcher.timeout = timeout;
        fetcher
    }

    /// Polls `url` once. The returned future completes after the handler
    /// has been invoked, exactly once, error or not, so `pending` and the
    /// poll-finished contract always balance.
    pub fn fetch(&self,
                 id: &str,
                 url: &str,
                 poll_id: u64,
                 finished: oneshot::Sender<u64>)
                 -> Box<Future<Item = (), Error = ()>> {
        let start = SystemTime::now();
        self.counters.pending.incr();
        trace!("poll {} {} start", poll_id, id);

        let body: BodyFuture = match url.parse::<hyper::Uri>() {
            Err(e) => Box::new(Err(FetchError::Transport(format!("{}", e))).into_future()),
            Ok(uri) => {
                let get = self.client
                    .get(uri)
                    .map_err(|e| FetchError::Transport(e.to_string()))
                    .and_then(handle_response);
                let deadline = self.timer
                    .sleep(self.timeout)
                    .then(|_| Err(FetchError::Timeout));
                Box::new(get.select(deadline).then(|r| match r {
                                                       Ok((body, _)) => Ok(body),
                                                       Err((e, _)) => Err(e),
                                                   }))
            }
        };

        let id = id.to_string();
        let counters = self.counters.clone();
        let mut stats = self.stats.clone();
        let handler = self.handler.clone();
        let timing = Timing::start();
        let f = body.then(move |result| {
            let end = SystemTime::now();
            stats.request_latency_ms.add(timing.elapsed_ms());
            if result.is_ok() {
                counters.success.incr();
                stats.success_count.incr(1);
            } else {
                counters.fail.incr();
                stats.failure_count.incr(1);
            }
            handler.handle(&id, result, start, end, poll_id, finished);
            counters.pending.decr();
            Ok(())
        });
        Box::new(f)
    }
}

fn handle_response(rsp: hyper::client::Response) -> BodyFuture {
    let status = rsp.status();
    if status != StatusCode::Ok {
        return Box::new(Err(FetchError::Status(status.as_u16())).into_future());
    }
    let body = rsp.body()
        .map_err(|e| FetchError::Transport(e.to_string()))
        .collect()
        .map(|chunks| to_buf(&chunks));
    Box::new(body)
}

fn bytes_in(chunks: &[Chunk]) -> usize {
    let mut sz = 0;
    for c in chunks {
        sz += (*c).len();
    }
    sz
}

fn to_buf(chunks: &[Chunk]) -> Bytes {
    let mut buf = BytesMut::with_capacity(bytes_in(chunks));
    for c in chunks {
        buf.put_slice(&*c)
    }
    buf.freeze()
}

#[derive(Clone)]
struct Stats {
    request_latency_ms: tacho::Stat,
    success_count: tacho::Counter,
    failure_count: tacho::Counter,
}

impl Stats {
    fn new(metrics: tacho::Scope) -> Stats {
        let metrics = metrics.labeled("service".into(), "fetcher");
        Stats {
            request_latency_ms: metrics.stat("fetch_latency_ms".into()),
            success_count: metrics.counter("fetch_success_count".into()),
            failure_count: metrics.counter("fetch_failure_count".into()),
        }
    }
}
