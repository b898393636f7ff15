//! Periodically pulls the roster and topology from the ops service.

use futures::{Async, Future, Poll, Stream};
use futures::unsync::mpsc;
use ops::{Error, MonitorConfigMap, OpsConfig, OpsSession};
use std::rc::Rc;
use std::time::Duration;
use tokio_timer::{Sleep, Timer};

type Fetching = Box<Future<Item = (MonitorConfigMap, Vec<u8>), Error = Error>>;

/// Multiplexes a session channel, an ops-config channel, and its own
/// tick, and publishes `(roster, topology bytes)` downstream. Fetch
/// errors skip the iteration; the consumer keeps whatever it had.
pub struct MonitorConfigPoller {
    interval: Duration,
    timer: Timer,
    tick: Sleep,
    sessions: mpsc::UnboundedReceiver<Rc<OpsSession>>,
    ops_configs: mpsc::UnboundedReceiver<OpsConfig>,
    session: Option<Rc<OpsSession>>,
    ops_config: Option<OpsConfig>,
    configs: mpsc::UnboundedSender<(MonitorConfigMap, Vec<u8>)>,
    fetching: Option<Fetching>,
}

impl MonitorConfigPoller {
    pub fn new(timer: Timer,
               interval: Duration)
               -> (MonitorConfigPoller,
                   mpsc::UnboundedSender<Rc<OpsSession>>,
                   mpsc::UnboundedSender<OpsConfig>,
                   mpsc::UnboundedReceiver<(MonitorConfigMap, Vec<u8>)>) {
        let (session_tx, session_rx) = mpsc::unbounded();
        let (ops_tx, ops_rx) = mpsc::unbounded();
        let (config_tx, config_rx) = mpsc::unbounded();
        let poller = MonitorConfigPoller {
            interval: interval,
            tick: timer.sleep(interval),
            timer: timer,
            sessions: session_rx,
            ops_configs: ops_rx,
            session: None,
            ops_config: None,
            configs: config_tx,
            fetching: None,
        };
        (poller, session_tx, ops_tx, config_rx)
    }

    fn drain_inputs(&mut self) {
        loop {
            match self.sessions.poll() {
                Ok(Async::Ready(Some(session))) => {
                    info!("monitor config poller: received new session");
                    self.session = Some(session);
                }
                _ => break,
            }
        }
        loop {
            match self.ops_configs.poll() {
                Ok(Async::Ready(Some(config))) => {
                    info!("monitor config poller: received new ops config for cdn '{}'",
                          config.cdn_name);
                    self.ops_config = Some(config);
                }
                _ => break,
            }
        }
    }

    fn start_fetch(&mut self) {
        if self.fetching.is_some() {
            warn!("monitor config poller: previous fetch still in flight, skipping");
            return;
        }
        match (self.session.as_ref(), self.ops_config.as_ref()) {
            (Some(session), Some(config)) if !config.cdn_name.is_empty() => {
                debug!("monitor config poller: fetching configs for cdn '{}'",
                       config.cdn_name);
                let fetch = session.monitor_config(&config.cdn_name)
                    .join(session.cdn_document(&config.cdn_name));
                self.fetching = Some(Box::new(fetch));
            }
            _ => warn!("monitor config poller: skipping iteration, no session yet"),
        }
    }
}

impl Future for MonitorConfigPoller {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            self.drain_inputs();

            if let Some(mut fetching) = self.fetching.take() {
                match fetching.poll() {
                    Ok(Async::NotReady) => self.fetching = Some(fetching),
                    Ok(Async::Ready((roster, topology))) => {
                        info!("monitor config poller: fetched monitoring config");
                        if self.configs.unbounded_send((roster, topology)).is_err() {
                            debug!("monitor config consumer is gone; stopping");
                            return Ok(Async::Ready(()));
                        }
                    }
                    Err(e) => error!("monitor config poller: {}", e),
                }
            }

            match self.tick.poll() {
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Ok(Async::Ready(())) => {
                    self.tick = self.timer.sleep(self.interval);
                    self.start_fetch();
                }
                Err(e) => {
                    error!("monitor config poller timer failed: {}", e);
                    self.tick = self.timer.sleep(self.interval);
                }
            }
        }
    }
}
