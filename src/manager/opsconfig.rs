//! Applies ops configuration file updates.

use futures::{Async, Future, Poll, Stream};
use futures::sync::mpsc as sync_mpsc;
use futures::unsync::mpsc;
use ops::{HttpSession, OpsConfig, OpsSession};
use std::rc::Rc;
use std::time::Duration;
use tacho;
use tokio_core::reactor::Handle;
use tokio_timer::Timer;

/// Builds a fresh ops session for every rewrite of the ops config file
/// and hands it (plus the config) to the monitor-config poller. A file
/// that no longer parses is ignored; whatever session was last built
/// keeps serving.
pub struct OpsConfigManager {
    files: sync_mpsc::UnboundedReceiver<Vec<u8>>,
    reactor: Handle,
    timer: Timer,
    timeout: Duration,
    metrics: tacho::Scope,
    sessions: mpsc::UnboundedSender<Rc<OpsSession>>,
    ops_configs: mpsc::UnboundedSender<OpsConfig>,
}

impl OpsConfigManager {
    pub fn new(files: sync_mpsc::UnboundedReceiver<Vec<u8>>,
               reactor: Handle,
               timer: Timer,
               timeout: Duration,
               metrics: tacho::Scope,
               sessions: mpsc::UnboundedSender<Rc<OpsSession>>,
               ops_configs: mpsc::UnboundedSender<OpsConfig>)
               -> OpsConfigManager {
        OpsConfigManager {
            files: files,
            reactor: reactor,
            timer: timer,
            timeout: timeout,
            metrics: metrics,
            sessions: sessions,
            ops_configs: ops_configs,
        }
    }

    /// Applies one version of the file. Returns the parse error for the
    /// caller to treat as fatal on the authoritative startup read.
    pub fn apply(&self, bytes: &[u8]) -> ::std::io::Result<()> {
        let config = OpsConfig::parse(bytes)?;
        info!("ops config loaded: cdn '{}' at {}", config.cdn_name, config.url);
        let session = HttpSession::new(&config,
                                       &self.reactor,
                                       self.timer.clone(),
                                       self.timeout,
                                       self.metrics.clone());
        let _ = self.sessions.unbounded_send(Rc::new(session));
        let _ = self.ops_configs.unbounded_send(config);
        Ok(())
    }
}

impl Future for OpsConfigManager {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            match self.files.poll() {
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Ok(Async::Ready(None)) | Err(()) => return Ok(Async::Ready(())),
                Ok(Async::Ready(Some(bytes))) => {
                    if let Err(e) = self.apply(&bytes) {
                        error!("ignoring ops config rewrite: {}", e);
                    }
                }
            }
        }
    }
}
