//! Wires the monitor together: channels, pollers, managers, cells.

use cache::{CacheKbpses, ResultInfoHistory, ResultStatHistory};
use cell::Cell;
use config::Config;
use ds::{DsStats, LastStats};
use fetcher::Fetcher;
use futures::{Async, Future, Poll, Stream};
use futures::unsync::mpsc;
use handler::Handler;
use health::{CacheStatuses, Events};
use instrument::{Counter, Counters};
use names::CacheName;
use ops::MonitorConfigMap;
use peer::{CrStatesCell, PeerStatesCell};
use poller::{self, HttpPoller};
use poller::monitor::MonitorConfigPoller;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;
use tacho;
use tokio_core::reactor::Handle;
use tokio_timer::Timer;
use topology::Topology;

pub mod health;
pub mod monitorcfg;
pub mod opsconfig;
pub mod peer;
pub mod stat;

use self::health::HealthManager;
use self::monitorcfg::{Intervals, MonitorConfigManager};
use self::opsconfig::OpsConfigManager;
use self::peer::{PeerManager, StateCombiner};
use self::stat::{StatCells, StatManager};

/// Every published cell and counter, for the serving surface and tests.
pub struct Monitor {
    pub local_states: CrStatesCell,
    pub combined_states: CrStatesCell,
    pub peer_states: PeerStatesCell,
    pub topology: Cell<Topology>,
    pub monitor_config: Cell<MonitorConfigMap>,
    pub ds_stats: Cell<DsStats>,
    pub last_stats: Cell<LastStats>,
    pub info_history: Cell<ResultInfoHistory>,
    pub stat_history: Cell<ResultStatHistory>,
    pub health_history: Cell<ResultInfoHistory>,
    pub max_kbps: Cell<CacheKbpses>,
    pub statuses: Cell<CacheStatuses>,
    pub events: Events,
    pub health_durations: Cell<HashMap<CacheName, Duration>>,
    pub stat_durations: Cell<HashMap<CacheName, Duration>>,
    pub unpolled: Cell<HashMap<CacheName, ()>>,
    pub health_iteration: Cell<u64>,
    pub fetch_counters: Counters,
    pub fetch_count: Counter,
    pub timer_fail: Counter,
    pub metrics_report: tacho::Reporter,
}

/// Starts every long-running component on the reactor and returns the
/// future that drives them, plus the published state.
///
/// The ops config file is read here, before anything runs: an unreadable
/// or unparseable file is a startup failure.
pub fn start(ops_config_path: &str,
             config: &Config,
             reactor: &Handle)
             -> io::Result<(Running, Monitor)> {
    let timer = Timer::default();
    let (metrics, reporter) = tacho::new();

    let counters = Counters::new();
    let timer_fail = Counter::new();
    let fetch_count = Counter::new();

    let topology = Cell::new(Topology::default());
    let monitor_config = Cell::new(MonitorConfigMap::default());
    let local_states = CrStatesCell::new();
    let combined_states = CrStatesCell::new();
    let peer_states = PeerStatesCell::new();
    let statuses = Cell::new(HashMap::new());
    let events = Events::new(config.max_events());
    let info_history = Cell::new(ResultInfoHistory::default());
    let stat_history = Cell::new(ResultStatHistory::default());
    let health_history = Cell::new(ResultInfoHistory::default());
    let max_kbps = Cell::new(CacheKbpses::default());
    let ds_stats = Cell::new(DsStats::default());
    let last_stats = Cell::new(LastStats::default());
    let health_durations = Cell::new(HashMap::new());
    let stat_durations = Cell::new(HashMap::new());
    let unpolled = Cell::new(HashMap::new());
    let health_iteration = Cell::new(0u64);

    let (health_handler, health_results) = Handler::health();
    let (stat_handler, stat_results) = Handler::stat(topology.clone());
    let (peer_handler, peer_results) = Handler::peer();

    let health_fetcher = Fetcher::new(reactor,
                                      timer.clone(),
                                      config.http_timeout(),
                                      counters.clone(),
                                      health_handler,
                                      metrics.clone());
    let stat_fetcher = Fetcher::new(reactor,
                                    timer.clone(),
                                    config.http_timeout(),
                                    counters.clone(),
                                    stat_handler,
                                    metrics.clone());
    let peer_fetcher = Fetcher::new(reactor,
                                    timer.clone(),
                                    config.http_timeout(),
                                    counters.clone(),
                                    peer_handler,
                                    metrics.clone());

    let (health_poller, health_configs, health_ticks) = HttpPoller::new(reactor.clone(),
                                                                        timer.clone(),
                                                                        health_fetcher,
                                                                        true,
                                                                        timer_fail.clone());
    let (stat_poller, stat_configs, _) = HttpPoller::new(reactor.clone(),
                                                         timer.clone(),
                                                         stat_fetcher,
                                                         false,
                                                         timer_fail.clone());
    let (peer_poller, peer_configs, _) = HttpPoller::new(reactor.clone(),
                                                         timer.clone(),
                                                         peer_fetcher,
                                                         false,
                                                         timer_fail.clone());

    let (mc_poller, sessions, ops_configs, mc_configs) =
        MonitorConfigPoller::new(timer.clone(), config.monitor_config_polling_interval());

    let (combine_tx, combine_rx) = mpsc::unbounded();
    let (caches_changed_tx, caches_changed_rx) = mpsc::unbounded();

    let stat_manager = StatManager::new(stat_results,
                                        caches_changed_rx,
                                        config.stat_flush_interval(),
                                        timer.clone(),
                                        combine_tx.clone(),
                                        StatCells {
                                            monitor_config: monitor_config.clone(),
                                            topology: topology.clone(),
                                            local_states: local_states.clone(),
                                            statuses: statuses.clone(),
                                            events: events.clone(),
                                            info_history: info_history.clone(),
                                            stat_history: stat_history.clone(),
                                            max_kbps: max_kbps.clone(),
                                            ds_stats: ds_stats.clone(),
                                            last_stats: last_stats.clone(),
                                            durations: stat_durations.clone(),
                                            unpolled: unpolled.clone(),
                                        });
    let health_manager = HealthManager::new(health_results,
                                            config.health_flush_interval(),
                                            timer.clone(),
                                            combine_tx.clone(),
                                            monitor_config.clone(),
                                            local_states.clone(),
                                            statuses.clone(),
                                            events.clone(),
                                            health_history.clone(),
                                            health_durations.clone(),
                                            fetch_count.clone());
    let peer_manager = PeerManager::new(peer_results, peer_states.clone(), combine_tx.clone());
    let combiner = StateCombiner::new(combine_rx,
                                      local_states.clone(),
                                      peer_states.clone(),
                                      combined_states.clone(),
                                      config.peer_optimistic());

    let mc_manager = MonitorConfigManager::new(mc_configs,
                                               Intervals {
                                                   health: config.health_polling_interval(),
                                                   stat: config.stat_polling_interval(),
                                                   peer: config.peer_polling_interval(),
                                               },
                                               config.host_name.clone(),
                                               topology.clone(),
                                               monitor_config.clone(),
                                               local_states.clone(),
                                               peer_states.clone(),
                                               health_configs,
                                               stat_configs,
                                               peer_configs,
                                               vec![caches_changed_tx],
                                               combine_tx.clone());

    let (initial_ops_config, file_events) = poller::file::start(ops_config_path)?;
    let ops_manager = OpsConfigManager::new(file_events,
                                            reactor.clone(),
                                            timer.clone(),
                                            config.http_timeout(),
                                            metrics.clone(),
                                            sessions,
                                            ops_configs);
    ops_manager.apply(&initial_ops_config)?;

    let mut running = Running::new();
    if let Some(ticks) = health_ticks {
        running.register(TickListener {
                             ticks: ticks,
                             iteration: health_iteration.clone(),
                         });
    }
    running.register(health_poller);
    running.register(stat_poller);
    running.register(peer_poller);
    running.register(mc_poller);
    running.register(stat_manager);
    running.register(health_manager);
    running.register(peer_manager);
    running.register(combiner);
    running.register(mc_manager);
    running.register(ops_manager);

    let monitor = Monitor {
        local_states: local_states,
        combined_states: combined_states,
        peer_states: peer_states,
        topology: topology,
        monitor_config: monitor_config,
        ds_stats: ds_stats,
        last_stats: last_stats,
        info_history: info_history,
        stat_history: stat_history,
        health_history: health_history,
        max_kbps: max_kbps,
        statuses: statuses,
        events: events,
        health_durations: health_durations,
        stat_durations: stat_durations,
        unpolled: unpolled,
        health_iteration: health_iteration,
        fetch_counters: counters,
        fetch_count: fetch_count,
        timer_fail: timer_fail,
        metrics_report: reporter,
    };
    Ok((running, monitor))
}

/// Publishes the health pollers' iteration counter so a watcher can see
/// that health polling is making progress.
struct TickListener {
    ticks: mpsc::UnboundedReceiver<u64>,
    iteration: Cell<u64>,
}

impl Future for TickListener {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            match self.ticks.poll() {
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Ok(Async::Ready(Some(iteration))) => self.iteration.set(iteration),
                Ok(Async::Ready(None)) | Err(()) => return Ok(Async::Ready(())),
            }
        }
    }
}

/// Tracks the monitor's long-running futures until all complete.
pub struct Running(VecDeque<Box<Future<Item = (), Error = ()>>>);

impl Running {
    pub fn new() -> Running {
        Running(VecDeque::new())
    }

    pub fn register<F>(&mut self, f: F)
        where F: Future<Item = (), Error = ()> + 'static
    {
        self.0.push_back(Box::new(f))
    }
}

impl Future for Running {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        let sz = self.0.len();
        for i in 0..sz {
            let mut f = match self.0.pop_front() {
                Some(f) => f,
                None => break,
            };
            trace!("polling runner {}", i);
            if f.poll()? == Async::NotReady {
                self.0.push_back(f);
            } else {
                trace!("runner {} finished", i);
            }
        }
        if self.0.is_empty() {
            Ok(Async::Ready(()))
        } else {
            Ok(Async::NotReady)
        }
    }
}
