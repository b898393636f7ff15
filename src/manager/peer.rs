//! Records peer states and recomputes the combined view.

use futures::{Async, Future, Poll, Stream};
use futures::unsync::mpsc;
use handler::PeerResult;
use peer::{self, CrStatesCell, PeerStatesCell};

/// Stores each peer's last parsed document. A failed peer poll keeps the
/// peer's last-seen state: gossip never downgrades on silence.
pub struct PeerManager {
    results: mpsc::UnboundedReceiver<PeerResult>,
    peer_states: PeerStatesCell,
    combine: mpsc::UnboundedSender<()>,
}

impl PeerManager {
    pub fn new(results: mpsc::UnboundedReceiver<PeerResult>,
               peer_states: PeerStatesCell,
               combine: mpsc::UnboundedSender<()>)
               -> PeerManager {
        PeerManager {
            results: results,
            peer_states: peer_states,
            combine: combine,
        }
    }
}

impl Future for PeerManager {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            match self.results.poll() {
                Ok(Async::NotReady) => return Ok(Async::NotReady),
                Ok(Async::Ready(None)) | Err(()) => return Ok(Async::Ready(())),
                Ok(Async::Ready(Some(mut result))) => {
                    match result.states {
                        Ok(ref states) => {
                            trace!("peer {} reported {} caches",
                                   result.id,
                                   states.caches.len());
                            self.peer_states.set(result.id.clone(), states.clone());
                            if self.combine.unbounded_send(()).is_err() {
                                debug!("state combiner is gone");
                            }
                        }
                        Err(ref e) => {
                            warn!("peer {} poll failed, keeping last-seen state: {}",
                                  result.id,
                                  e);
                        }
                    }
                    result.finish();
                }
            }
        }
    }
}

/// Recomputes the combined availability whenever local or peer state
/// changes. Signals are coalesced: many updates between polls cost one
/// recomputation.
pub struct StateCombiner {
    signals: mpsc::UnboundedReceiver<()>,
    local: CrStatesCell,
    peers: PeerStatesCell,
    combined: CrStatesCell,
    optimistic: bool,
}

impl StateCombiner {
    pub fn new(signals: mpsc::UnboundedReceiver<()>,
               local: CrStatesCell,
               peers: PeerStatesCell,
               combined: CrStatesCell,
               optimistic: bool)
               -> StateCombiner {
        StateCombiner {
            signals: signals,
            local: local,
            peers: peers,
            combined: combined,
            optimistic: optimistic,
        }
    }

    fn recombine(&self) {
        let combined = peer::combine(self.local.get(), &self.peers.get(), self.optimistic);
        trace!("combined state: {} caches, {} delivery services",
               combined.caches.len(),
               combined.delivery_services.len());
        self.combined.set(combined);
    }
}

impl Future for StateCombiner {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        loop {
            let mut signaled = false;
            let mut done = false;
            loop {
                match self.signals.poll() {
                    Ok(Async::Ready(Some(()))) => signaled = true,
                    Ok(Async::NotReady) => break,
                    Ok(Async::Ready(None)) | Err(()) => {
                        done = true;
                        break;
                    }
                }
            }
            if signaled {
                self.recombine();
            }
            if done {
                return Ok(Async::Ready(()));
            }
            if !signaled {
                return Ok(Async::NotReady);
            }
        }
    }
}
