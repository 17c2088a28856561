//! Per-device connection state machine. [`Lifecycle`] consumes
//! [`LinkEvent`]s and answers with the [`LinkAction`]s the caller performs;
//! the async side lives in [`crate::supervisor`].

use crate::error::Error;
use crate::firmware;
use crate::sensor::DeviceId;
use log::{debug, info, warn};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnected,
    Failed,
}

impl LinkState {
    pub fn is_pending(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::DiscoveringServices)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    RadioPoweredOn,
    RadioPoweredOff,
    Foreground,
    Background,
    Discovered { id: DeviceId, name: String },
    Connected(DeviceId),
    ServicesDiscovered(DeviceId),
    TransportFailed(DeviceId, Error),
    /// The partial connection of a failed attempt has been released.
    Released(DeviceId),
    /// The transport dropped an established link.
    LinkLost(DeviceId),
    Enable(DeviceId),
    Disable(DeviceId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkAction {
    StartScan,
    StopScan,
    AddRecord { id: DeviceId, name: String },
    SetEnabled { id: DeviceId, enabled: bool },
    Connect(DeviceId),
    DiscoverServices(DeviceId),
    LoadConfig(DeviceId),
    /// Tear down a half-open connection, answered with [`LinkEvent::Released`].
    Release(DeviceId),
    Disconnect(DeviceId),
    StartPolling(DeviceId),
    StopPolling(DeviceId),
}

#[derive(Clone, Debug)]
struct Link {
    state: LinkState,
    enabled: bool,
    simulated: bool,
    failures: u32,
}

#[derive(Clone, Debug)]
pub struct Lifecycle {
    name_prefixes: Vec<String>,
    max_retries: Option<u32>,
    radio_on: bool,
    foreground: bool,
    scanning: bool,
    pending: Option<DeviceId>,
    links: HashMap<DeviceId, Link>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(
            firmware::NAME_PREFIXES.iter().map(|p| p.to_string()).collect(),
            None,
        )
    }
}

impl Lifecycle {
    pub fn new(name_prefixes: Vec<String>, max_retries: Option<u32>) -> Self {
        Self {
            name_prefixes,
            max_retries,
            radio_on: false,
            foreground: true,
            scanning: false,
            pending: None,
            links: HashMap::new(),
        }
    }

    /// Registers a device that is already in the registry.
    pub fn track(&mut self, id: DeviceId, enabled: bool, simulated: bool) {
        self.links.entry(id).or_insert(Link {
            state: if enabled && !simulated {
                LinkState::Scanning
            } else {
                LinkState::Idle
            },
            enabled,
            simulated,
            failures: 0,
        });
    }

    pub fn state(&self, id: &DeviceId) -> Option<LinkState> {
        self.links.get(id).map(|link| link.state)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn pending(&self) -> Option<&DeviceId> {
        self.pending.as_ref()
    }

    pub fn is_ready(&self, id: &DeviceId) -> bool {
        self.state(id) == Some(LinkState::Ready)
    }

    pub fn states(&self) -> HashMap<DeviceId, LinkState> {
        self.links
            .iter()
            .map(|(id, link)| (id.clone(), link.state))
            .collect()
    }

    /// Devices holding a link that has to be closed on shutdown.
    pub fn connected(&self) -> Vec<DeviceId> {
        self.links
            .iter()
            .filter(|(_, link)| link.state == LinkState::Ready || link.state.is_pending())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn handle(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        debug!("lifecycle: {event:?}");
        let mut actions = Vec::new();
        match event {
            LinkEvent::RadioPoweredOn => {
                info!("Bluetooth is available");
                self.radio_on = true;
            }
            LinkEvent::RadioPoweredOff => {
                warn!("Bluetooth was switched off");
                self.radio_on = false;
                // the radio already stopped scanning
                self.scanning = false;
                self.drop_links(&mut actions, false);
            }
            LinkEvent::Foreground => {
                self.foreground = true;
                if self.links.values().any(|link| link.enabled) {
                    for link in self.links.values_mut() {
                        if link.enabled && !link.simulated && link.state == LinkState::Disconnected
                        {
                            link.state = LinkState::Scanning;
                        }
                    }
                }
            }
            LinkEvent::Background => {
                self.foreground = false;
                self.drop_links(&mut actions, true);
            }
            LinkEvent::Discovered { id, name } => self.on_discovered(id, name, &mut actions),
            LinkEvent::Connected(id) => {
                if self.transition(&id, LinkState::Connecting, LinkState::DiscoveringServices) {
                    actions.push(LinkAction::DiscoverServices(id));
                }
            }
            LinkEvent::ServicesDiscovered(id) => {
                if self.transition(&id, LinkState::DiscoveringServices, LinkState::Ready) {
                    info!("{id} is ready for use");
                    self.pending = None;
                    if let Some(link) = self.links.get_mut(&id) {
                        link.failures = 0;
                    }
                    actions.push(LinkAction::LoadConfig(id.clone()));
                    actions.push(LinkAction::StartPolling(id));
                }
            }
            LinkEvent::TransportFailed(id, err) => self.on_failure(id, err, &mut actions),
            LinkEvent::Released(id) => self.on_released(id, &mut actions),
            LinkEvent::LinkLost(id) => {
                let Some(link) = self.links.get_mut(&id) else {
                    return actions;
                };
                let state = link.state;
                match state {
                    LinkState::Ready => {
                        warn!("Lost connection to {id}");
                        link.state = if link.enabled {
                            LinkState::Scanning
                        } else {
                            LinkState::Disconnected
                        };
                        actions.push(LinkAction::StopPolling(id));
                    }
                    LinkState::DiscoveringServices => {
                        self.on_failure(id, Error::transport(3, "link lost"), &mut actions)
                    }
                    // the link is not up yet, any disconnect is left over
                    // from an earlier one
                    LinkState::Connecting => debug!("lifecycle: stale link loss for {id}"),
                    _ => {}
                }
            }
            LinkEvent::Enable(id) => self.on_enable(id, &mut actions),
            LinkEvent::Disable(id) => self.on_disable(id, &mut actions),
        }
        self.sync_scan(&mut actions);
        actions
    }

    fn active(&self) -> bool {
        self.radio_on && self.foreground
    }

    fn transition(&mut self, id: &DeviceId, from: LinkState, to: LinkState) -> bool {
        match self.links.get_mut(id) {
            Some(link) if link.state == from => {
                link.state = to;
                true
            }
            other => {
                debug!(
                    "lifecycle: ignoring {from:?} -> {to:?} for {id} in {:?}",
                    other.map(|link| link.state)
                );
                false
            }
        }
    }

    fn try_connect(&mut self, id: &DeviceId, actions: &mut Vec<LinkAction>) {
        if !self.active() || self.pending.is_some() {
            return;
        }
        let Some(link) = self.links.get_mut(id) else {
            return;
        };
        if link.enabled && !link.simulated && link.state == LinkState::Scanning {
            link.state = LinkState::Connecting;
            self.pending = Some(id.clone());
            actions.push(LinkAction::Connect(id.clone()));
        }
    }

    fn on_discovered(&mut self, id: DeviceId, name: String, actions: &mut Vec<LinkAction>) {
        if !firmware::matches_prefix(&name, &self.name_prefixes) {
            return;
        }
        if !self.links.contains_key(&id) {
            info!("Found a device named {name} with id {id}");
            self.links.insert(
                id.clone(),
                Link {
                    state: LinkState::Scanning,
                    enabled: true,
                    simulated: false,
                    failures: 0,
                },
            );
            actions.push(LinkAction::AddRecord {
                id: id.clone(),
                name,
            });
        }
        self.try_connect(&id, actions);
    }

    fn on_enable(&mut self, id: DeviceId, actions: &mut Vec<LinkAction>) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if !link.enabled {
            link.enabled = true;
            actions.push(LinkAction::SetEnabled {
                id: id.clone(),
                enabled: true,
            });
        }
        link.failures = 0;
        if link.simulated {
            actions.push(LinkAction::StartPolling(id));
            return;
        }
        if matches!(link.state, LinkState::Idle | LinkState::Disconnected) {
            link.state = LinkState::Scanning;
        }
        self.try_connect(&id, actions);
    }

    fn on_disable(&mut self, id: DeviceId, actions: &mut Vec<LinkAction>) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if link.enabled {
            link.enabled = false;
            actions.push(LinkAction::SetEnabled {
                id: id.clone(),
                enabled: false,
            });
        }
        if link.simulated {
            actions.push(LinkAction::StopPolling(id));
            return;
        }
        match link.state {
            LinkState::Ready => {
                link.state = LinkState::Disconnected;
                actions.push(LinkAction::StopPolling(id.clone()));
                actions.push(LinkAction::Disconnect(id));
            }
            LinkState::Connecting | LinkState::DiscoveringServices => {
                link.state = LinkState::Disconnected;
                self.pending = None;
                actions.push(LinkAction::Release(id));
            }
            LinkState::Scanning => link.state = LinkState::Idle,
            _ => {}
        }
    }

    fn on_failure(&mut self, id: DeviceId, err: Error, actions: &mut Vec<LinkAction>) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if !link.state.is_pending() {
            debug!("lifecycle: stale failure for {id}: {err}");
            return;
        }
        warn!("Connecting to {id} failed: {err}");
        link.state = LinkState::Failed;
        link.failures += 1;
        if self.pending.as_ref() == Some(&id) {
            self.pending = None;
        }
        actions.push(LinkAction::Release(id));
    }

    fn on_released(&mut self, id: DeviceId, actions: &mut Vec<LinkAction>) {
        let max_retries = self.max_retries;
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if link.state != LinkState::Failed {
            return;
        }
        if !link.enabled {
            link.state = LinkState::Disconnected;
            return;
        }
        match max_retries {
            Some(max) if link.failures > max => {
                warn!("Giving up on {id} after {} failed attempts", link.failures);
                link.state = LinkState::Disconnected;
                link.enabled = false;
                actions.push(LinkAction::SetEnabled { id, enabled: false });
            }
            _ => {
                info!("Resuming scan for {id}");
                link.state = LinkState::Scanning;
            }
        }
    }

    /// Tears down every established or half-open link. With `park` the
    /// devices wait in `Disconnected` for the next foreground transition,
    /// otherwise enabled ones go straight back to `Scanning`.
    fn drop_links(&mut self, actions: &mut Vec<LinkAction>, park: bool) {
        let mut ids: Vec<DeviceId> = self.links.keys().cloned().collect();
        ids.sort();
        for id in ids {
            let Some(link) = self.links.get_mut(&id) else {
                continue;
            };
            if link.simulated {
                continue;
            }
            let next = if park || !link.enabled {
                LinkState::Disconnected
            } else {
                LinkState::Scanning
            };
            match link.state {
                LinkState::Ready => {
                    link.state = next;
                    actions.push(LinkAction::StopPolling(id.clone()));
                    actions.push(LinkAction::Disconnect(id));
                }
                LinkState::Connecting | LinkState::DiscoveringServices => {
                    link.state = next;
                    actions.push(LinkAction::Release(id));
                }
                LinkState::Scanning if park => link.state = LinkState::Disconnected,
                _ => {}
            }
        }
        self.pending = None;
    }

    fn sync_scan(&mut self, actions: &mut Vec<LinkAction>) {
        let wanted = self.active() && self.pending.is_none();
        if wanted && !self.scanning {
            self.scanning = true;
            actions.push(LinkAction::StartScan);
        } else if !wanted && self.scanning {
            self.scanning = false;
            actions.push(LinkAction::StopScan);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s)
    }

    fn discovered(s: &str, name: &str) -> LinkEvent {
        LinkEvent::Discovered {
            id: id(s),
            name: name.into(),
        }
    }

    fn powered() -> Lifecycle {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(
            lifecycle.handle(LinkEvent::RadioPoweredOn),
            vec![LinkAction::StartScan]
        );
        lifecycle
    }

    fn ready(lifecycle: &mut Lifecycle, s: &str) {
        lifecycle.handle(discovered(s, "Clarkson 1"));
        lifecycle.handle(LinkEvent::Connected(id(s)));
        lifecycle.handle(LinkEvent::ServicesDiscovered(id(s)));
        assert_eq!(lifecycle.state(&id(s)), Some(LinkState::Ready));
    }

    #[test]
    fn test_new_device_connects_and_becomes_ready() {
        let mut lifecycle = powered();
        let actions = lifecycle.handle(discovered("a", "Clarkson Insole"));
        assert_eq!(
            actions,
            vec![
                LinkAction::AddRecord {
                    id: id("a"),
                    name: "Clarkson Insole".into()
                },
                LinkAction::Connect(id("a")),
                LinkAction::StopScan,
            ]
        );
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Connecting));

        let actions = lifecycle.handle(LinkEvent::Connected(id("a")));
        assert_eq!(actions, vec![LinkAction::DiscoverServices(id("a"))]);

        let actions = lifecycle.handle(LinkEvent::ServicesDiscovered(id("a")));
        assert_eq!(
            actions,
            vec![
                LinkAction::LoadConfig(id("a")),
                LinkAction::StartPolling(id("a")),
                LinkAction::StartScan,
            ]
        );
        assert!(lifecycle.is_ready(&id("a")));
        assert!(lifecycle.pending().is_none());
    }

    #[test]
    fn test_foreign_names_are_ignored() {
        let mut lifecycle = powered();
        assert!(lifecycle.handle(discovered("x", "PsyLink")).is_empty());
        assert_eq!(lifecycle.state(&id("x")), None);
    }

    #[test]
    fn test_no_scan_before_radio_is_on() {
        let mut lifecycle = Lifecycle::default();
        assert!(lifecycle.handle(LinkEvent::Foreground).is_empty());
        assert!(!lifecycle.is_scanning());
    }

    #[test]
    fn test_failure_returns_to_scanning_and_retries() {
        let mut lifecycle = powered();
        lifecycle.handle(discovered("a", "CU-1"));

        let actions = lifecycle.handle(LinkEvent::TransportFailed(
            id("a"),
            Error::transport(133, "GATT error"),
        ));
        assert_eq!(actions, vec![LinkAction::Release(id("a")), LinkAction::StartScan]);
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Failed));

        assert!(lifecycle.handle(LinkEvent::Released(id("a"))).is_empty());
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Scanning));

        // the next advertisement of the same device starts a new attempt
        let actions = lifecycle.handle(discovered("a", "CU-1"));
        assert_eq!(actions, vec![LinkAction::Connect(id("a")), LinkAction::StopScan]);
        lifecycle.handle(LinkEvent::Connected(id("a")));
        lifecycle.handle(LinkEvent::ServicesDiscovered(id("a")));
        assert!(lifecycle.is_ready(&id("a")));
    }

    #[test]
    fn test_single_pending_slot() {
        let mut lifecycle = powered();
        lifecycle.handle(discovered("a", "Clarkson A"));
        let actions = lifecycle.handle(discovered("b", "Clarkson B"));
        assert_eq!(
            actions,
            vec![LinkAction::AddRecord {
                id: id("b"),
                name: "Clarkson B".into()
            }]
        );
        assert_eq!(lifecycle.state(&id("b")), Some(LinkState::Scanning));
        assert_eq!(lifecycle.pending(), Some(&id("a")));

        lifecycle.handle(LinkEvent::Connected(id("a")));
        lifecycle.handle(LinkEvent::ServicesDiscovered(id("a")));
        let actions = lifecycle.handle(discovered("b", "Clarkson B"));
        assert_eq!(actions, vec![LinkAction::Connect(id("b")), LinkAction::StopScan]);
    }

    #[test]
    fn test_disable_ready_device() {
        let mut lifecycle = powered();
        ready(&mut lifecycle, "a");
        let actions = lifecycle.handle(LinkEvent::Disable(id("a")));
        assert_eq!(
            actions,
            vec![
                LinkAction::SetEnabled {
                    id: id("a"),
                    enabled: false
                },
                LinkAction::StopPolling(id("a")),
                LinkAction::Disconnect(id("a")),
            ]
        );
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Disconnected));

        // a known, disabled device is not reconnected by its advertisements
        assert!(lifecycle.handle(discovered("a", "Clarkson 1")).is_empty());

        let actions = lifecycle.handle(LinkEvent::Enable(id("a")));
        assert_eq!(
            actions,
            vec![
                LinkAction::SetEnabled {
                    id: id("a"),
                    enabled: true
                },
                LinkAction::Connect(id("a")),
                LinkAction::StopScan,
            ]
        );
    }

    #[test]
    fn test_background_tears_down_and_foreground_resumes() {
        let mut lifecycle = powered();
        ready(&mut lifecycle, "a");
        let actions = lifecycle.handle(LinkEvent::Background);
        assert_eq!(
            actions,
            vec![
                LinkAction::StopPolling(id("a")),
                LinkAction::Disconnect(id("a")),
                LinkAction::StopScan,
            ]
        );
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Disconnected));

        let actions = lifecycle.handle(LinkEvent::Foreground);
        assert_eq!(actions, vec![LinkAction::StartScan]);
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Scanning));
    }

    #[test]
    fn test_background_aborts_pending_connect() {
        let mut lifecycle = powered();
        lifecycle.handle(discovered("a", "Clarkson 1"));
        lifecycle.handle(LinkEvent::Connected(id("a")));
        let actions = lifecycle.handle(LinkEvent::Background);
        assert_eq!(actions, vec![LinkAction::Release(id("a"))]);
        assert!(lifecycle.pending().is_none());
        // late completion of the aborted attempt is ignored
        assert!(lifecycle
            .handle(LinkEvent::ServicesDiscovered(id("a")))
            .is_empty());
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Disconnected));
    }

    #[test]
    fn test_link_lost_while_ready() {
        let mut lifecycle = powered();
        ready(&mut lifecycle, "a");
        let actions = lifecycle.handle(LinkEvent::LinkLost(id("a")));
        assert_eq!(actions, vec![LinkAction::StopPolling(id("a"))]);
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Scanning));
    }

    #[test]
    fn test_link_lost_while_connecting() {
        let mut lifecycle = powered();
        lifecycle.handle(discovered("a", "Clarkson 1"));
        assert!(lifecycle.handle(LinkEvent::LinkLost(id("a"))).is_empty());
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Connecting));

        lifecycle.handle(LinkEvent::Connected(id("a")));
        let actions = lifecycle.handle(LinkEvent::LinkLost(id("a")));
        assert_eq!(actions, vec![LinkAction::Release(id("a")), LinkAction::StartScan]);
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Failed));
    }

    #[test]
    fn test_retry_cap_disables_device() {
        let mut lifecycle = Lifecycle::new(vec!["Clarkson".into()], Some(1));
        lifecycle.handle(LinkEvent::RadioPoweredOn);
        for _ in 0..2 {
            lifecycle.handle(discovered("a", "Clarkson 1"));
            lifecycle.handle(LinkEvent::TransportFailed(id("a"), Error::transport(1, "x")));
            lifecycle.handle(LinkEvent::Released(id("a")));
        }
        assert_eq!(lifecycle.state(&id("a")), Some(LinkState::Disconnected));
        assert!(lifecycle.handle(discovered("a", "Clarkson 1")).is_empty());
    }

    #[test]
    fn test_simulated_devices_skip_the_radio() {
        let mut lifecycle = Lifecycle::default();
        lifecycle.track(id("sim"), false, true);
        let actions = lifecycle.handle(LinkEvent::Enable(id("sim")));
        assert_eq!(
            actions,
            vec![
                LinkAction::SetEnabled {
                    id: id("sim"),
                    enabled: true
                },
                LinkAction::StartPolling(id("sim")),
            ]
        );
        assert_eq!(lifecycle.state(&id("sim")), Some(LinkState::Idle));
        let actions = lifecycle.handle(LinkEvent::Disable(id("sim")));
        assert_eq!(actions.last(), Some(&LinkAction::StopPolling(id("sim"))));
    }
}
