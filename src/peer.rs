//! The availability document exchanged with content routers and peer
//! monitors, and the cells that publish it.

use cell::Cell;
use names::{CacheGroupName, CacheName, DsName, MonitorName};
use serde_json;
use std::collections::HashMap;

/// Availability of one cache, shaped for the published JSON document.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IsAvailable {
    #[serde(rename = "isAvailable")]
    pub is_available: bool,
}

impl IsAvailable {
    pub fn new(available: bool) -> IsAvailable {
        IsAvailable { is_available: available }
    }
}

/// Availability of one delivery service, with the cache groups in which
/// every assigned cache is down.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DsState {
    #[serde(rename = "disabledLocations")]
    pub disabled_locations: Vec<CacheGroupName>,
    #[serde(rename = "isAvailable")]
    pub is_available: bool,
}

/// The full availability document: what this monitor knows about every
/// cache and delivery service it watches.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CrStates {
    pub caches: HashMap<CacheName, IsAvailable>,
    #[serde(rename = "deliveryServices")]
    pub delivery_services: HashMap<DsName, DsState>,
}

impl CrStates {
    pub fn new() -> CrStates {
        CrStates::default()
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<CrStates, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn marshal(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Publishes one `CrStates` with a single writer task and many readers.
///
/// Whole-document reads copy under the shared lock; the per-key setters
/// mutate the published document in place under the exclusive lock, so a
/// reader never observes a half-written document. Per-key mutation is only
/// legal from the same task that calls `set`.
#[derive(Clone)]
pub struct CrStatesCell(Cell<CrStates>);

impl CrStatesCell {
    pub fn new() -> CrStatesCell {
        CrStatesCell(Cell::new(CrStates::new()))
    }

    pub fn get(&self) -> CrStates {
        self.0.get()
    }

    pub fn get_caches(&self) -> HashMap<CacheName, IsAvailable> {
        self.0.with_ref(|s| s.caches.clone())
    }

    pub fn get_cache(&self, name: &CacheName) -> Option<IsAvailable> {
        self.0.with_ref(|s| s.caches.get(name).cloned())
    }

    pub fn get_delivery_services(&self) -> HashMap<DsName, DsState> {
        self.0.with_ref(|s| s.delivery_services.clone())
    }

    pub fn set(&self, states: CrStates) {
        self.0.set(states);
    }

    pub fn set_cache(&self, name: CacheName, available: IsAvailable) {
        self.0.with_mut(|s| { s.caches.insert(name, available); });
    }

    pub fn delete_cache(&self, name: &CacheName) {
        self.0.with_mut(|s| { s.caches.remove(name); });
    }

    pub fn set_delivery_service(&self, name: DsName, ds: DsState) {
        self.0.with_mut(|s| { s.delivery_services.insert(name, ds); });
    }

    pub fn set_delivery_services(&self, dses: HashMap<DsName, DsState>) {
        self.0.with_mut(|s| s.delivery_services = dses);
    }

    pub fn delete_delivery_service(&self, name: &DsName) {
        self.0.with_mut(|s| { s.delivery_services.remove(name); });
    }
}

/// The last state received from each peer monitor; last writer wins per
/// peer.
#[derive(Clone)]
pub struct PeerStatesCell(Cell<HashMap<MonitorName, CrStates>>);

impl PeerStatesCell {
    pub fn new() -> PeerStatesCell {
        PeerStatesCell(Cell::new(HashMap::new()))
    }

    pub fn get(&self) -> HashMap<MonitorName, CrStates> {
        self.0.get()
    }

    pub fn set(&self, peer: MonitorName, states: CrStates) {
        self.0.with_mut(|m| { m.insert(peer, states); });
    }

    pub fn retain(&self, keep: &HashMap<MonitorName, ()>) {
        self.0.with_mut(|m| m.retain(|name, _| keep.contains_key(name)));
    }
}

/// Merges the local view with every peer's last-seen view.
///
/// In optimistic mode (the default) a cache is available if anyone,
/// local monitor or any peer, says it is. Delivery services merge the
/// same way, and a location stays disabled only if every view agrees.
/// With optimism off, peers are ignored and the local view is published
/// as-is.
pub fn combine(local: CrStates,
               peers: &HashMap<MonitorName, CrStates>,
               optimistic: bool)
               -> CrStates {
    let mut combined = local;
    if !optimistic {
        return combined;
    }

    for states in peers.values() {
        for (name, available) in &states.caches {
            if available.is_available {
                combined.caches.insert(name.clone(), *available);
            }
        }
        for (name, ds) in &states.delivery_services {
            match combined.delivery_services.get_mut(name) {
                Some(entry) => {
                    if ds.is_available {
                        entry.is_available = true;
                    }
                    entry.disabled_locations
                        .retain(|loc| ds.disabled_locations.contains(loc));
                }
                None => {
                    combined.delivery_services.insert(name.clone(), ds.clone());
                }
            }
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use names::{CacheName, DsName, MonitorName};
    use std::collections::HashMap;

    fn states(available: &[(&str, bool)]) -> CrStates {
        let mut s = CrStates::new();
        for &(name, up) in available {
            s.caches.insert(CacheName::from(name), IsAvailable::new(up));
        }
        s
    }

    #[test]
    fn marshal_unmarshal_is_identity() {
        let mut s = states(&[("edge-den-01", true), ("edge-den-02", false)]);
        s.delivery_services.insert(DsName::from("ds-foo"),
                                   DsState {
                                       disabled_locations: vec!["den".into()],
                                       is_available: true,
                                   });
        let bytes = s.marshal().unwrap();
        let back = CrStates::unmarshal(&bytes).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn published_document_shape() {
        let mut s = states(&[("edge-den-01", true)]);
        s.delivery_services.insert(DsName::from("ds-foo"), DsState::default());
        let js: ::serde_json::Value =
            ::serde_json::from_slice(&s.marshal().unwrap()).unwrap();
        assert_eq!(js["caches"]["edge-den-01"]["isAvailable"], true);
        assert_eq!(js["deliveryServices"]["ds-foo"]["isAvailable"], false);
        assert!(js["deliveryServices"]["ds-foo"]["disabledLocations"]
                    .as_array()
                    .unwrap()
                    .is_empty());
    }

    #[test]
    fn cell_copies_are_isolated() {
        let cell = CrStatesCell::new();
        cell.set_cache(CacheName::from("edge-den-01"), IsAvailable::new(true));
        let mut copy = cell.get();
        copy.caches.insert(CacheName::from("intruder"), IsAvailable::new(true));
        assert_eq!(cell.get().caches.len(), 1);
    }

    #[test]
    fn combine_is_optimistic_or() {
        let local = states(&[("a", true), ("b", false)]);
        let mut peers = HashMap::new();
        peers.insert(MonitorName::from("peer-1"), states(&[("b", true), ("c", true)]));

        let combined = combine(local.clone(), &peers, true);
        assert!(combined.caches[&CacheName::from("a")].is_available);
        assert!(combined.caches[&CacheName::from("b")].is_available);
        assert!(combined.caches[&CacheName::from("c")].is_available);

        let pessimistic = combine(local, &peers, false);
        assert!(!pessimistic.caches[&CacheName::from("b")].is_available);
        assert!(!pessimistic.caches.contains_key(&CacheName::from("c")));
    }

    #[test]
    fn combine_intersects_disabled_locations() {
        let mut local = CrStates::new();
        local.delivery_services.insert(DsName::from("ds"),
                                       DsState {
                                           disabled_locations: vec!["den".into(),
                                                                    "sea".into()],
                                           is_available: false,
                                       });
        let mut peer = CrStates::new();
        peer.delivery_services.insert(DsName::from("ds"),
                                      DsState {
                                          disabled_locations: vec!["den".into()],
                                          is_available: true,
                                      });
        let mut peers = HashMap::new();
        peers.insert(MonitorName::from("peer-1"), peer);

        let combined = combine(local, &peers, true);
        let ds = &combined.delivery_services[&DsName::from("ds")];
        assert!(ds.is_available);
        assert_eq!(ds.disabled_locations, vec![::names::CacheGroupName::from("den")]);
    }
}
