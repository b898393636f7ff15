//! Aggregates lightweight health results.

use cache::{CacheResult, ResultInfo, ResultInfoHistory};
use cell::Cell;
use futures::{Async, Future, Poll, Stream};
use futures::unsync::mpsc;
use health::{self, CacheStatuses, Events};
use instrument::Counter;
use names::CacheName;
use ops::MonitorConfigMap;
use peer::CrStatesCell;
use std::collections::HashMap;
use std::mem;
use std::time::{Duration, SystemTime};
use tokio_timer::{Sleep, Timer};

/// The health-poll analogue of the stat manager: same batch-and-flush
/// discipline over the much cheaper health documents, driving cache
/// availability between stat flushes.
pub struct HealthManager {
    results: mpsc::UnboundedReceiver<CacheResult>,
    flush_interval: Duration,
    timer: Timer,
    flush_timer: Option<Sleep>,
    batch: Vec<CacheResult>,

    monitor_config: Cell<MonitorConfigMap>,
    local_states: CrStatesCell,
    statuses: Cell<CacheStatuses>,
    events: Events,
    combine: mpsc::UnboundedSender<()>,

    history: Cell<ResultInfoHistory>,
    durations: Cell<HashMap<CacheName, Duration>>,
    fetch_count: Counter,

    last_infos: HashMap<CacheName, ResultInfo>,
    last_end_times: HashMap<CacheName, SystemTime>,
}

impl HealthManager {
    pub fn new(results: mpsc::UnboundedReceiver<CacheResult>,
               flush_interval: Duration,
               timer: Timer,
               combine: mpsc::UnboundedSender<()>,
               monitor_config: Cell<MonitorConfigMap>,
               local_states: CrStatesCell,
               statuses: Cell<CacheStatuses>,
               events: Events,
               history: Cell<ResultInfoHistory>,
               durations: Cell<HashMap<CacheName, Duration>>,
               fetch_count: Counter)
               -> HealthManager {
        HealthManager {
            results: results,
            flush_interval: flush_interval,
            timer: timer,
            flush_timer: None,
            batch: Vec::new(),
            monitor_config: monitor_config,
            local_states: local_states,
            statuses: statuses,
            events: events,
            combine: combine,
            history: history,
            durations: durations,
            fetch_count: fetch_count,
            last_infos: HashMap::new(),
            last_end_times: HashMap::new(),
        }
    }

    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let mut batch = mem::replace(&mut self.batch, Vec::new());
        self.flush_timer = None;
        trace!("health manager flushing {} results", batch.len());

        let mc = self.monitor_config.get();
        let mut history = self.history.get();

        for result in &mut batch {
            let limit = ::std::cmp::max(1, mc.history_count(&result.id));
            if result.error.is_none() {
                health::get_vitals(result, self.last_infos.get(&result.id));
            }
            let info = ResultInfo::from(&*result);
            history.add(info.clone(), limit);
            self.last_infos.insert(result.id.clone(), info);
            self.fetch_count.incr();
        }
        self.history.set(history);

        health::calc_availability(&batch,
                                  "health",
                                  &mc,
                                  &self.local_states,
                                  &self.statuses,
                                  &self.events);

        if self.combine.unbounded_send(()).is_err() {
            debug!("state combiner is gone");
        }

        let end = SystemTime::now();
        self.durations.with_mut(|durations| for result in &batch {
            if let Some(prev) = self.last_end_times.get(&result.id) {
                if let Ok(duration) = end.duration_since(*prev) {
                    durations.insert(result.id.clone(), duration);
                }
            }
        });
        for result in &batch {
            self.last_end_times.insert(result.id.clone(), end);
        }

        for result in &mut batch {
            result.finish();
        }
    }
}

impl Future for HealthManager {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            match self.results.poll() {
                Ok(Async::Ready(Some(result))) => {
                    if self.batch.is_empty() {
                        self.flush_timer = Some(self.timer.sleep(self.flush_interval));
                    }
                    self.batch.push(result);

                    if let Some(mut t) = self.flush_timer.take() {
                        match t.poll() {
                            Ok(Async::NotReady) => self.flush_timer = Some(t),
                            Ok(Async::Ready(())) | Err(_) => {
                                debug!("health manager flushing on interval");
                                self.flush();
                            }
                        }
                    }
                }
                Ok(Async::NotReady) => {
                    self.flush();
                    return Ok(Async::NotReady);
                }
                Ok(Async::Ready(None)) | Err(()) => {
                    self.flush();
                    return Ok(Async::Ready(()));
                }
            }
        }
    }
}
