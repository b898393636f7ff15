//! The reconfigurable poll scheduler.
//!
//! An `HttpPoller` owns one worker per target and mutates the set as new
//! configurations arrive, without ever blocking on in-flight polls.

use fetcher::Fetcher;
use futures::{Async, Future, Poll, Stream};
use futures::unsync::{mpsc, oneshot};
use instrument::{self, Counter};
use rand::{self, Rng};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio_core::reactor::Handle;
use tokio_timer::{Sleep, Timer};

pub mod file;
pub mod monitor;

/// One polled URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PollTarget {
    pub url: String,
    /// Overrides the fetcher template's timeout when set.
    pub timeout: Option<Duration>,
}

/// The full desired state of one poller: every target, one interval.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub targets: HashMap<String, PollTarget>,
}

/// A scheduled poll: what `diff` tells the poller to start.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PollSpec {
    pub id: String,
    pub interval: Duration,
    pub url: String,
    pub timeout: Option<Duration>,
}

fn spec(id: &str, interval: Duration, target: &PollTarget) -> PollSpec {
    PollSpec {
        id: id.to_string(),
        interval: interval,
        url: target.url.clone(),
        timeout: target.timeout,
    }
}

/// Computes which workers to kill and which to start to move from `old`
/// to `new`. An interval change restarts everything; otherwise a changed
/// target is a kill plus a start. Output is sorted by id so the plan is
/// deterministic.
pub fn diff(old: &PollerConfig, new: &PollerConfig) -> (Vec<String>, Vec<PollSpec>) {
    let mut deletions = Vec::new();
    let mut additions = Vec::new();

    if old.interval != new.interval {
        for id in old.targets.keys() {
            deletions.push(id.clone());
        }
        for (id, target) in &new.targets {
            additions.push(spec(id, new.interval, target));
        }
    } else {
        for (id, old_target) in &old.targets {
            match new.targets.get(id) {
                None => deletions.push(id.clone()),
                Some(target) if target != old_target => {
                    deletions.push(id.clone());
                    additions.push(spec(id, new.interval, target));
                }
                Some(_) => {}
            }
        }
        for (id, target) in &new.targets {
            if !old.targets.contains_key(id) {
                additions.push(spec(id, new.interval, target));
            }
        }
    }

    deletions.sort();
    additions.sort_by(|a, b| a.id.cmp(&b.id));
    (deletions, additions)
}

/// The spread sleep that desynchronizes workers sharing an interval.
pub fn poll_spread<R: Rng>(interval: Duration, rng: &mut R) -> Duration {
    let nanos = interval.as_secs() * 1_000_000_000 + interval.subsec_nanos() as u64;
    let offset = (rng.gen::<f64>() * nanos as f64) as u64;
    Duration::new(offset / 1_000_000_000, (offset % 1_000_000_000) as u32)
}

/// Runs one worker per target, applying configurations as they arrive.
///
/// Kills are fire-and-forget: reconfiguration never waits for an old
/// worker's in-flight poll.
pub struct HttpPoller {
    reactor: Handle,
    timer: Timer,
    fetcher: Fetcher,
    config: PollerConfig,
    configs: mpsc::UnboundedReceiver<PollerConfig>,
    kills: HashMap<String, oneshot::Sender<()>>,
    tick_counter: Option<Rc<RefCell<u64>>>,
    tick_tx: Option<mpsc::UnboundedSender<u64>>,
    timer_fail: Counter,
}

impl HttpPoller {
    /// Creates a poller and the channel its configurations arrive on.
    /// With `tick` set, every worker tick also bumps a shared iteration
    /// counter published on the returned tick channel.
    pub fn new(reactor: Handle,
               timer: Timer,
               fetcher: Fetcher,
               tick: bool,
               timer_fail: Counter)
               -> (HttpPoller,
                   mpsc::UnboundedSender<PollerConfig>,
                   Option<mpsc::UnboundedReceiver<u64>>) {
        let (config_tx, config_rx) = mpsc::unbounded();
        let (tick_counter, tick_tx, tick_rx) = if tick {
            let (tx, rx) = mpsc::unbounded();
            (Some(Rc::new(RefCell::new(0))), Some(tx), Some(rx))
        } else {
            (None, None, None)
        };
        let poller = HttpPoller {
            reactor: reactor,
            timer: timer,
            fetcher: fetcher,
            config: PollerConfig::default(),
            configs: config_rx,
            kills: HashMap::new(),
            tick_counter: tick_counter,
            tick_tx: tick_tx,
            timer_fail: timer_fail,
        };
        (poller, config_tx, tick_rx)
    }

    fn apply(&mut self, new: PollerConfig) {
        let (deletions, additions) = diff(&self.config, &new);
        debug!("reconfiguring: {} deletions, {} additions",
               deletions.len(),
               additions.len());

        for id in deletions {
            if let Some(kill) = self.kills.remove(&id) {
                let _ = kill.send(());
            }
        }
        for spec in additions {
            let fetcher = match spec.timeout {
                Some(timeout) => self.fetcher.with_timeout(timeout),
                None => self.fetcher.clone(),
            };
            let (kill_tx, kill_rx) = oneshot::channel();
            self.kills.insert(spec.id.clone(), kill_tx);
            let worker = PollWorker::new(spec,
                                         fetcher,
                                         self.timer.clone(),
                                         self.reactor.clone(),
                                         kill_rx,
                                         self.tick_counter.clone(),
                                         self.tick_tx.clone(),
                                         self.timer_fail.clone());
            self.reactor.spawn(worker);
        }
        self.config = new;
        info!("poller running {} targets every {:?}",
              self.kills.len(),
              self.config.interval);
    }
}

impl Future for HttpPoller {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            match self.configs.poll() {
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Ok(Async::Ready(Some(config))) => self.apply(config),
                Ok(Async::Ready(None)) | Err(()) => {
                    debug!("configuration stream ended; stopping {} workers",
                           self.kills.len());
                    for (_, kill) in self.kills.drain() {
                        let _ = kill.send(());
                    }
                    return Ok(Async::Ready(()));
                }
            }
        }
    }
}

enum WorkerState {
    Warmup(Sleep),
    Ticking(Sleep),
    Polling {
        next: Sleep,
        finished: oneshot::Receiver<u64>,
    },
}

/// Polls one target forever: spread sleep, then one fetch per tick, each
/// tick gated on the aggregator's poll-finished signal for the previous
/// fetch.
struct PollWorker {
    id: String,
    url: String,
    interval: Duration,
    fetcher: Fetcher,
    timer: Timer,
    reactor: Handle,
    kill: oneshot::Receiver<()>,
    tick_counter: Option<Rc<RefCell<u64>>>,
    tick_tx: Option<mpsc::UnboundedSender<u64>>,
    timer_fail: Counter,
    last_tick: Option<Instant>,
    state: Option<WorkerState>,
}

impl PollWorker {
    fn new(spec: PollSpec,
           fetcher: Fetcher,
           timer: Timer,
           reactor: Handle,
           kill: oneshot::Receiver<()>,
           tick_counter: Option<Rc<RefCell<u64>>>,
           tick_tx: Option<mpsc::UnboundedSender<u64>>,
           timer_fail: Counter)
           -> PollWorker {
        let spread = poll_spread(spec.interval, &mut rand::thread_rng());
        debug!("worker {} warming up for {:?}", spec.id, spread);
        let warmup = timer.sleep(spread);
        PollWorker {
            id: spec.id,
            url: spec.url,
            interval: spec.interval,
            fetcher: fetcher,
            timer: timer,
            reactor: reactor,
            kill: kill,
            tick_counter: tick_counter,
            tick_tx: tick_tx,
            timer_fail: timer_fail,
            last_tick: None,
            state: Some(WorkerState::Warmup(warmup)),
        }
    }

    /// Starts one poll and arms the next tick. The next tick's sleep
    /// starts now, but is only honored once this poll's result has been
    /// aggregated.
    fn start_poll(&mut self) -> WorkerState {
        let now = Instant::now();
        if let Some(last) = self.last_tick {
            let actual = now - last;
            if actual > self.interval + Duration::from_millis(100) {
                self.timer_fail.incr();
                info!("worker {}: intended interval {:?}, actual {:?}",
                      self.id,
                      self.interval,
                      actual);
            }
        }
        self.last_tick = Some(now);

        if let Some(ref counter) = self.tick_counter {
            let mut iteration = counter.borrow_mut();
            *iteration += 1;
            if let Some(ref tx) = self.tick_tx {
                let _ = tx.unbounded_send(*iteration);
            }
        }

        let poll_id = instrument::next_poll_id();
        let (finished_tx, finished_rx) = oneshot::channel();
        debug!("poll {} {} start", poll_id, self.id);
        self.reactor
            .spawn(self.fetcher.fetch(&self.id, &self.url, poll_id, finished_tx));
        WorkerState::Polling {
            next: self.timer.sleep(self.interval),
            finished: finished_rx,
        }
    }
}

impl Future for PollWorker {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        match self.kill.poll() {
            Ok(Async::Ready(())) | Err(_) => {
                debug!("worker {} dying", self.id);
                return Ok(Async::Ready(()));
            }
            Ok(Async::NotReady) => {}
        }

        loop {
            match self.state.take() {
                None => return Ok(Async::Ready(())),
                Some(WorkerState::Warmup(mut sleep)) => {
                    match sleep.poll() {
                        Ok(Async::NotReady) => {
                            self.state = Some(WorkerState::Warmup(sleep));
                            return Ok(Async::NotReady);
                        }
                        Ok(Async::Ready(())) => {
                            self.last_tick = Some(Instant::now());
                            self.state = Some(WorkerState::Ticking(self.timer
                                                                       .sleep(self.interval)));
                        }
                        Err(e) => {
                            error!("worker {} warmup timer failed: {}", self.id, e);
                            self.state = Some(WorkerState::Ticking(self.timer
                                                                       .sleep(self.interval)));
                        }
                    }
                }
                Some(WorkerState::Ticking(mut sleep)) => {
                    match sleep.poll() {
                        Ok(Async::NotReady) => {
                            self.state = Some(WorkerState::Ticking(sleep));
                            return Ok(Async::NotReady);
                        }
                        Ok(Async::Ready(())) => {
                            let next = self.start_poll();
                            self.state = Some(next);
                        }
                        Err(e) => {
                            error!("worker {} tick timer failed: {}", self.id, e);
                            let next = self.start_poll();
                            self.state = Some(next);
                        }
                    }
                }
                Some(WorkerState::Polling { next, mut finished }) => {
                    match finished.poll() {
                        Ok(Async::NotReady) => {
                            self.state = Some(WorkerState::Polling {
                                                  next: next,
                                                  finished: finished,
                                              });
                            return Ok(Async::NotReady);
                        }
                        Ok(Async::Ready(poll_id)) => {
                            trace!("poll {} {} finished", poll_id, self.id);
                            self.state = Some(WorkerState::Ticking(next));
                        }
                        Err(_) => {
                            // The aggregator dropped the signal; treat the
                            // poll as finished rather than wedging the
                            // worker.
                            self.state = Some(WorkerState::Ticking(next));
                        }
                    }
                }
            }
        }
    }
}
