use std::collections::HashMap;

use keel_server::transport::Endpoint;
use log::warn;

use crate::codec::SlaveOffer;
use crate::id::{FrameworkId, OfferId, SlaveId};

/// The scheduler's private state bag. Only the scheduler actor mutates it.
///
/// `saved_offers` remembers the slave endpoints discovered through an offer
/// until the offer is replied to or rescinded; `saved_slaves` keeps the
/// endpoints of slaves the framework actually launched tasks on, so that
/// framework messages can go to the slave directly.
#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    master: Option<Endpoint>,
    epoch: Option<String>,
    framework_id: Option<FrameworkId>,
    saved_offers: HashMap<OfferId, HashMap<SlaveId, Endpoint>>,
    saved_slaves: HashMap<SlaveId, Endpoint>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn master(&self) -> Option<&Endpoint> {
        self.master.as_ref()
    }

    pub fn set_master(&mut self, epoch: String, master: Endpoint) {
        self.epoch = Some(epoch);
        self.master = Some(master);
    }

    pub fn epoch(&self) -> Option<&str> {
        self.epoch.as_deref()
    }

    pub fn framework_id(&self) -> Option<&FrameworkId> {
        self.framework_id.as_ref()
    }

    /// A framework identity, once assigned, never changes for the life of
    /// the driver; a conflicting registration reply is ignored.
    pub fn set_framework_id(&mut self, framework_id: FrameworkId) {
        match &self.framework_id {
            Some(existing) if *existing != framework_id => {
                warn!("ignoring framework id {framework_id}; already registered as {existing}");
            }
            _ => self.framework_id = Some(framework_id),
        }
    }

    pub fn save_offer(&mut self, offer_id: OfferId, slots: &[SlaveOffer]) {
        let entry = self.saved_offers.entry(offer_id).or_default();
        for slot in slots {
            entry.insert(slot.slave_id.clone(), slot.slave_endpoint.clone());
        }
    }

    pub fn remove_offer(&mut self, offer_id: &OfferId) -> Option<HashMap<SlaveId, Endpoint>> {
        self.saved_offers.remove(offer_id)
    }

    pub fn offer_slave(&self, offer_id: &OfferId, slave_id: &SlaveId) -> Option<&Endpoint> {
        self.saved_offers.get(offer_id)?.get(slave_id)
    }

    pub fn save_slave(&mut self, slave_id: SlaveId, endpoint: Endpoint) {
        self.saved_slaves.insert(slave_id, endpoint);
    }

    pub fn remove_slave(&mut self, slave_id: &SlaveId) -> Option<Endpoint> {
        self.saved_slaves.remove(slave_id)
    }

    pub fn slave(&self, slave_id: &SlaveId) -> Option<&Endpoint> {
        self.saved_slaves.get(slave_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Params;

    fn slot(slave: &str, port: u16) -> SlaveOffer {
        SlaveOffer {
            slave_id: slave.into(),
            host: slave.to_string(),
            slave_endpoint: Endpoint::new(slave, "10.0.0.1", port),
            params: Params::new(),
        }
    }

    #[test]
    fn test_offer_lifecycle() {
        let mut state = SchedulerState::new();
        let offer_id = OfferId::from("offer-1");
        state.save_offer(offer_id.clone(), &[slot("s1", 1), slot("s2", 2)]);
        assert_eq!(
            state.offer_slave(&offer_id, &"s1".into()),
            Some(&Endpoint::new("s1", "10.0.0.1", 1))
        );

        let slaves = state.remove_offer(&offer_id).unwrap();
        assert_eq!(slaves.len(), 2);
        assert_eq!(state.offer_slave(&offer_id, &"s1".into()), None);
        assert!(state.remove_offer(&offer_id).is_none());
    }

    #[test]
    fn test_empty_offer_is_still_recorded() {
        let mut state = SchedulerState::new();
        let offer_id = OfferId::from("offer-2");
        state.save_offer(offer_id.clone(), &[]);
        assert_eq!(state.remove_offer(&offer_id).unwrap().len(), 0);
    }

    #[test]
    fn test_framework_id_never_changes() {
        let mut state = SchedulerState::new();
        state.set_framework_id("fw-1".into());
        state.set_framework_id("fw-2".into());
        assert_eq!(state.framework_id(), Some(&"fw-1".into()));
        // Re-assigning the same id is fine.
        state.set_framework_id("fw-1".into());
        assert_eq!(state.framework_id(), Some(&"fw-1".into()));
    }

    #[test]
    fn test_slave_table() {
        let mut state = SchedulerState::new();
        let endpoint = Endpoint::new("s1", "10.0.0.1", 1);
        state.save_slave("s1".into(), endpoint.clone());
        assert_eq!(state.slave(&"s1".into()), Some(&endpoint));
        assert_eq!(state.remove_slave(&"s1".into()), Some(endpoint));
        assert_eq!(state.slave(&"s1".into()), None);
    }
}
