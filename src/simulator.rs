//! In-memory radio with TinyBLEStat sensors in range, for `demo` and tests.

use crate::bluetooth::{RadioState, Transport, TransportEvent};
use crate::error::{Error, Result};
use crate::firmware;
use crate::protocol;
use crate::sensor::{DeviceConfig, DeviceId};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

const ADVERTISING_INTERVAL: Duration = Duration::from_millis(100);

struct SimDevice {
    name: String,
    config: [u8; firmware::CONFIG_LEN],
    ticks: u32,
}

struct SimState {
    devices: BTreeMap<DeviceId, SimDevice>,
    connected: HashSet<DeviceId>,
    discovered: HashSet<DeviceId>,
    connect_failures: HashMap<DeviceId, u32>,
    connect_delay: Option<Duration>,
    read_delay: Option<Duration>,
    radio: RadioState,
    scanning: bool,
    connects: u32,
}

pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
    events: broadcast::Sender<TransportEvent>,
    advertiser: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(SimState {
                devices: BTreeMap::new(),
                connected: HashSet::new(),
                discovered: HashSet::new(),
                connect_failures: HashMap::new(),
                connect_delay: None,
                read_delay: None,
                radio: RadioState::PoweredOn,
                scanning: false,
                connects: 0,
            })),
            events,
            advertiser: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    fn emit(&self, event: TransportEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Puts a new sensor in range, configured with the factory defaults.
    pub fn add_device(&self, name: &str) -> DeviceId {
        let mut state = self.state();
        let id = DeviceId::new(format!("sim-{}", state.devices.len() + 1));
        state.devices.insert(
            id.clone(),
            SimDevice {
                name: name.to_string(),
                config: protocol::encode(&DeviceConfig::default()).unwrap_or_default(),
                ticks: 0,
            },
        );
        id
    }

    /// Marks a device connected with its services discovered.
    pub fn connect_now(&self, id: &DeviceId) {
        let mut state = self.state();
        state.connected.insert(id.clone());
        state.discovered.insert(id.clone());
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.state().connected.contains(id)
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    /// Number of connection attempts seen so far.
    pub fn connect_attempts(&self) -> u32 {
        self.state().connects
    }

    pub fn device_config(&self, id: &DeviceId) -> Option<[u8; firmware::CONFIG_LEN]> {
        self.state().devices.get(id).map(|device| device.config)
    }

    pub fn set_device_config(&self, id: &DeviceId, config: [u8; firmware::CONFIG_LEN]) {
        if let Some(device) = self.state().devices.get_mut(id) {
            device.config = config;
        }
    }

    /// The next `count` connection attempts to `id` fail.
    pub fn fail_connects(&self, id: &DeviceId, count: u32) {
        self.state().connect_failures.insert(id.clone(), count);
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state().connect_delay = delay;
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state().read_delay = delay;
    }

    pub fn set_radio(&self, radio: RadioState) {
        {
            let mut state = self.state();
            state.radio = radio;
            if radio != RadioState::PoweredOn {
                state.connected.clear();
                state.discovered.clear();
                state.scanning = false;
            }
        }
        self.emit(TransportEvent::RadioState(radio));
    }

    /// Simulates the device walking out of range.
    pub fn drop_link(&self, id: &DeviceId) {
        let was_connected = {
            let mut state = self.state();
            state.discovered.remove(id);
            state.connected.remove(id)
        };
        if was_connected {
            self.emit(TransportEvent::Disconnected(id.clone()));
        }
    }

    fn check_ready(state: &SimState, id: &DeviceId) -> Result<()> {
        if !state.devices.contains_key(id) {
            return Err(Error::transport(2, format!("no peripheral with id {id}")));
        }
        if !state.connected.contains(id) {
            return Err(Error::transport(3, "not connected"));
        }
        if !state.discovered.contains(id) {
            return Err(Error::NotReady(id.clone()));
        }
        Ok(())
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for SimTransport {
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>> {
        let rx = self.events.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("simulator: subscriber skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn radio_state(&self) -> Result<RadioState> {
        Ok(self.state().radio)
    }

    async fn start_scan(&self, _name_prefixes: &[String]) -> Result<()> {
        {
            let mut state = self.state();
            if state.radio != RadioState::PoweredOn {
                return Err(Error::transport(10, "radio is off"));
            }
            state.scanning = true;
        }
        let mut advertiser = self
            .advertiser
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if advertiser.as_ref().map_or(true, |task| task.is_finished()) {
            let state = Arc::clone(&self.state);
            let events = self.events.clone();
            *advertiser = Some(tokio::spawn(async move {
                loop {
                    let adverts: Vec<(DeviceId, String)> = {
                        let state = lock(&state);
                        if !state.scanning {
                            break;
                        }
                        state
                            .devices
                            .iter()
                            .filter(|(id, _)| !state.connected.contains(*id))
                            .map(|(id, device)| (id.clone(), device.name.clone()))
                            .collect()
                    };
                    for (id, name) in adverts {
                        let _ = events.send(TransportEvent::Discovered { id, name });
                    }
                    time::sleep(ADVERTISING_INTERVAL).await;
                }
            }));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state().scanning = false;
        let task = self
            .advertiser
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
        let mut state = self.state();
        state.connects += 1;
        if !state.devices.contains_key(id) {
            return Err(Error::transport(2, format!("no peripheral with id {id}")));
        }
        if state.radio != RadioState::PoweredOn {
            return Err(Error::transport(10, "radio is off"));
        }
        if let Some(failures) = state.connect_failures.get_mut(id) {
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::transport(133, "simulated connection failure"));
            }
        }
        state.connected.insert(id.clone());
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> Result<()> {
        let mut state = self.state();
        if !state.connected.contains(id) {
            return Err(Error::transport(3, "not connected"));
        }
        state.discovered.insert(id.clone());
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let was_connected = {
            let mut state = self.state();
            state.discovered.remove(id);
            state.connected.remove(id)
        };
        if was_connected {
            self.emit(TransportEvent::Disconnected(id.clone()));
        }
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> Result<bool> {
        Ok(self.state().connected.contains(id))
    }

    async fn read(&self, id: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let delay = self.state().read_delay;
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
        let mut state = self.state();
        Self::check_ready(&state, id)?;
        if service != firmware::SERVICE_UUID {
            return Err(Error::transport(4, format!("unknown service {service}")));
        }
        let Some(device) = state.devices.get_mut(id) else {
            return Err(Error::transport(2, format!("no peripheral with id {id}")));
        };
        if characteristic == firmware::CONFIG_CHARACTERISTIC_UUID {
            Ok(device.config.to_vec())
        } else if characteristic == firmware::VALUES_CHARACTERISTIC_UUID {
            device.ticks = device.ticks.wrapping_add(1);
            let mut value = device.ticks.to_le_bytes().to_vec();
            value.extend_from_slice(&device.ticks.wrapping_mul(2).to_le_bytes());
            Ok(value)
        } else {
            Err(Error::transport(
                4,
                format!("unknown characteristic {characteristic}"),
            ))
        }
    }

    async fn write(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let mut state = self.state();
        Self::check_ready(&state, id)?;
        if service != firmware::SERVICE_UUID
            || characteristic != firmware::CONFIG_CHARACTERISTIC_UUID
        {
            return Err(Error::transport(3, format!("{characteristic} is not writable")));
        }
        let Ok(config) = <[u8; firmware::CONFIG_LEN]>::try_from(value) else {
            return Err(Error::transport(13, "invalid attribute value length"));
        };
        if let Some(device) = state.devices.get_mut(id) {
            device.config = config;
        }
        Ok(())
    }
}
