//! Aggregates full statistics results.

use cache::{CacheKbpses, CacheResult, Precomputed, ResultInfo, ResultInfoHistory,
            ResultStatHistory, StatSnapshot};
use cell::Cell;
use ds::{self, DsStats, LastStats};
use futures::{Async, Future, Poll, Stream};
use futures::unsync::mpsc;
use health::{self, CacheStatuses, Events};
use names::CacheName;
use ops::{self, MonitorConfigMap};
use peer::CrStatesCell;
use std::collections::HashMap;
use std::mem;
use std::time::{Duration, SystemTime};
use tokio_timer::{Sleep, Timer};
use topology::Topology;

/// Drains the stat result channel in opportunistic batches and flushes
/// them into the published cells.
///
/// A batch starts with one blocking receive; everything else already
/// queued is taken greedily, and the batch flushes when the channel goes
/// momentarily quiet or the flush interval expires, whichever happens
/// first. Only after a flush are the batched polls released back to their
/// workers.
pub struct StatManager {
    results: mpsc::UnboundedReceiver<CacheResult>,
    caches_changed: mpsc::UnboundedReceiver<()>,
    flush_interval: Duration,
    timer: Timer,
    flush_timer: Option<Sleep>,
    batch: Vec<CacheResult>,

    monitor_config: Cell<MonitorConfigMap>,
    topology: Cell<Topology>,
    local_states: CrStatesCell,
    statuses: Cell<CacheStatuses>,
    events: Events,
    combine: mpsc::UnboundedSender<()>,

    info_history: Cell<ResultInfoHistory>,
    stat_history: Cell<ResultStatHistory>,
    max_kbps: Cell<CacheKbpses>,
    ds_stats: Cell<DsStats>,
    last_stats: Cell<LastStats>,
    durations: Cell<HashMap<CacheName, Duration>>,
    unpolled: Cell<HashMap<CacheName, ()>>,

    precomputed: HashMap<CacheName, Precomputed>,
    last_infos: HashMap<CacheName, ResultInfo>,
    last_times: HashMap<CacheName, SystemTime>,
    last_end_times: HashMap<CacheName, SystemTime>,
}

pub struct StatCells {
    pub monitor_config: Cell<MonitorConfigMap>,
    pub topology: Cell<Topology>,
    pub local_states: CrStatesCell,
    pub statuses: Cell<CacheStatuses>,
    pub events: Events,
    pub info_history: Cell<ResultInfoHistory>,
    pub stat_history: Cell<ResultStatHistory>,
    pub max_kbps: Cell<CacheKbpses>,
    pub ds_stats: Cell<DsStats>,
    pub last_stats: Cell<LastStats>,
    pub durations: Cell<HashMap<CacheName, Duration>>,
    pub unpolled: Cell<HashMap<CacheName, ()>>,
}

impl StatManager {
    pub fn new(results: mpsc::UnboundedReceiver<CacheResult>,
               caches_changed: mpsc::UnboundedReceiver<()>,
               flush_interval: Duration,
               timer: Timer,
               combine: mpsc::UnboundedSender<()>,
               cells: StatCells)
               -> StatManager {
        StatManager {
            results: results,
            caches_changed: caches_changed,
            flush_interval: flush_interval,
            timer: timer,
            flush_timer: None,
            batch: Vec::new(),
            monitor_config: cells.monitor_config,
            topology: cells.topology,
            local_states: cells.local_states,
            statuses: cells.statuses,
            events: cells.events,
            combine: combine,
            info_history: cells.info_history,
            stat_history: cells.stat_history,
            max_kbps: cells.max_kbps,
            ds_stats: cells.ds_stats,
            last_stats: cells.last_stats,
            durations: cells.durations,
            unpolled: cells.unpolled,
            precomputed: HashMap::new(),
            last_infos: HashMap::new(),
            last_times: HashMap::new(),
            last_end_times: HashMap::new(),
        }
    }

    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let mut batch = mem::replace(&mut self.batch, Vec::new());
        self.flush_timer = None;
        trace!("stat manager flushing {} results", batch.len());

        let mc = self.monitor_config.get();
        let topology = self.topology.get();

        let mut info_history = self.info_history.get();
        let mut stat_history = self.stat_history.get();
        let mut max_kbps = self.max_kbps.get();

        for result in &mut batch {
            let limit = {
                let limit = mc.history_count(&result.id);
                if limit < 1 {
                    info!("history count {} for {}, using 1", limit, result.id);
                    1
                } else {
                    limit
                }
            };

            if result.error.is_none() {
                health::get_vitals(result, self.last_infos.get(&result.id));
            }
            let info = ResultInfo::from(&*result);
            info_history.add(info.clone(), limit);
            if let Some(ref doc) = result.doc {
                stat_history.add(StatSnapshot {
                                     poll_id: result.poll_id,
                                     time: result.time,
                                     doc: doc.clone(),
                                 },
                                 &result.id,
                                 limit);
            }

            if result.error.is_none() {
                max_kbps.add_max(&result.id, result.vitals.kbps_out);
                if let Some(mut pre) = result.precomputed.clone() {
                    // An incomplete decode reports zero bytes; keep the
                    // previous counter instead of publishing a regression.
                    if pre.out_bytes == 0 {
                        if let Some(prev) = self.precomputed.get(&result.id) {
                            pre.out_bytes = prev.out_bytes;
                        }
                    }
                    self.precomputed.insert(result.id.clone(), pre);
                }
                self.last_times.insert(result.id.clone(), result.time);
            } else if let Some(ref e) = result.error {
                debug!("stat poll {} {}: {}", result.poll_id, result.id, e);
            }
            self.last_infos.insert(result.id.clone(), info);
        }

        self.info_history.set(info_history);
        self.stat_history.set(stat_history);
        self.max_kbps.set(max_kbps);

        health::calc_availability(&batch,
                                  "stat",
                                  &mc,
                                  &self.local_states,
                                  &self.statuses,
                                  &self.events);

        let ds_states = health::calc_ds_states(&topology, &self.local_states.get_caches());
        let previous = self.local_states.get_delivery_services();
        for (name, state) in &ds_states {
            let was = previous.get(name).map(|d| d.is_available).unwrap_or(false);
            if was != state.is_available {
                let kind = topology.ds_types
                    .get(name)
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "DS".to_string());
                let why = if state.is_available {
                    "has available caches"
                } else {
                    "no available caches remain"
                };
                // A delivery service has no host of its own; its name
                // stands in.
                self.events.add(why, name.as_str(), name.as_str(), &kind, state.is_available);
            }
        }
        self.local_states.set_delivery_services(ds_states.clone());

        let (new_ds_stats, new_last) = ds::create_stats(&self.precomputed,
                                                        &self.last_times,
                                                        &topology,
                                                        &ds_states,
                                                        self.last_stats.get());
        self.ds_stats.set(new_ds_stats);
        self.last_stats.set(new_last);

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
        self.unpolled.with_mut(|unpolled| for result in &batch {
            unpolled.remove(&result.id);
        });
        for result in &batch {
            self.last_end_times.insert(result.id.clone(), end);
        }

        // Releasing the polls MUST be last: a released worker's next tick
        // may not begin until its previous result has been flushed.
        for result in &mut batch {
            result.finish();
        }
    }

    fn drain_caches_changed(&mut self) {
        let mut changed = false;
        loop {
            match self.caches_changed.poll() {
                Ok(Async::Ready(Some(()))) => changed = true,
                _ => break,
            }
        }
        if changed {
            let mc = self.monitor_config.get();
            self.unpolled.set(ops::polled_caches(&mc));
        }
    }
}

impl Future for StatManager {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        self.drain_caches_changed();
        loop {
            match self.results.poll() {
                Ok(Async::Ready(Some(result))) => {
                    if self.batch.is_empty() {
                        self.flush_timer = Some(self.timer.sleep(self.flush_interval));
                    }
                    self.batch.push(result);

                    // Under a continuous flood the flush interval bounds
                    // batching latency.
                    if let Some(mut t) = self.flush_timer.take() {
                        match t.poll() {
                            Ok(Async::NotReady) => self.flush_timer = Some(t),
                            Ok(Async::Ready(())) | Err(_) => {
                                debug!("stat manager flushing on interval");
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
