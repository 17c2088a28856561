use crate::error::{Error, Result};
use crate::firmware;
use crate::prelude::App;
use crate::sensor::DeviceId;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unknown,
}

/// Notifications pushed by the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Discovered { id: DeviceId, name: String },
    RadioState(RadioState),
    Disconnected(DeviceId),
}

/// The BLE operations the fleet manager relies on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stream of discovery, radio and link notifications. Every call
    /// returns an independent subscription.
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>>;
    async fn radio_state(&self) -> Result<RadioState>;

    async fn start_scan(&self, name_prefixes: &[String]) -> Result<()>;
    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, id: &DeviceId) -> Result<()>;
    async fn discover_services(&self, id: &DeviceId) -> Result<()>;
    /// Must succeed when the device is not connected.
    async fn disconnect(&self, id: &DeviceId) -> Result<()>;
    async fn is_connected(&self, id: &DeviceId) -> Result<bool>;

    async fn read(&self, id: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;
    async fn write(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()>;
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::new(format!("{id:?}"))
}

/// [`Transport`] backed by the first btleplug adapter of the host.
#[derive(Clone)]
pub struct BtleTransport {
    adapter: Adapter,
    characteristics: Arc<Mutex<HashMap<DeviceId, Vec<Characteristic>>>>,
}

impl BtleTransport {
    pub async fn new(app: &App) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter_list = manager.adapters().await?;
        let Some(adapter) = adapter_list.into_iter().next() else {
            return Err(Error::transport(2, "No Bluetooth adapters found"));
        };
        if app.verbose > 0 {
            info!("Using bluetooth adapter {}", adapter.adapter_info().await?);
        }
        Ok(Self {
            adapter,
            characteristics: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn peripheral(&self, id: &DeviceId) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            if device_id(&peripheral.id()) == *id {
                return Ok(peripheral);
            }
        }
        Err(Error::transport(2, format!("no peripheral with id {id}")))
    }

    async fn characteristic(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        let known = self.characteristics.lock().await;
        known
            .get(id)
            .and_then(|list| {
                list.iter()
                    .find(|c| c.service_uuid == service && c.uuid == characteristic)
            })
            .cloned()
            .ok_or_else(|| Error::NotReady(id.clone()))
    }

    /// Scans for `app.scantime` seconds and lists every matching device.
    pub async fn scan(&self, app: &App) -> Result<Vec<(DeviceId, String)>> {
        self.start_scan(&app.name_prefixes).await?;
        time::sleep(Duration::from_secs_f32(app.scantime)).await;
        let mut found = Vec::new();

        let peripherals = self.adapter.peripherals().await?;
        if peripherals.is_empty() {
            warn!("No BLE peripheral devices found.");
        }
        for peripheral in peripherals.iter() {
            let properties = peripheral.properties().await?;
            if app.verbose > 1 {
                debug!("{:?}", &properties);
            }
            if let Some(PeripheralProperties {
                local_name: Some(name),
                ..
            }) = &properties
            {
                if firmware::matches_prefix(name, &app.name_prefixes) {
                    found.push((device_id(&peripheral.id()), name.clone()));
                }
            }
        }
        self.stop_scan().await?;
        Ok(found)
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>> {
        let adapter = self.adapter.clone();
        let events = self.adapter.events().await?;
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let peripheral = adapter.peripheral(&id).await.ok()?;
                        let properties = peripheral.properties().await.ok()??;
                        let name = properties.local_name?;
                        Some(TransportEvent::Discovered {
                            id: device_id(&id),
                            name,
                        })
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        Some(TransportEvent::Disconnected(device_id(&id)))
                    }
                    CentralEvent::StateUpdate(state) => {
                        Some(TransportEvent::RadioState(radio_state(state)))
                    }
                    _ => None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn radio_state(&self) -> Result<RadioState> {
        Ok(radio_state(self.adapter.adapter_state().await?))
    }

    async fn start_scan(&self, _name_prefixes: &[String]) -> Result<()> {
        // Name filtering happens on discovery, the platform filter only
        // knows about service UUIDs which the sensors do not advertise.
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;
        let characteristics: Vec<Characteristic> =
            peripheral.characteristics().into_iter().collect();
        debug!("{id}: {} characteristics", characteristics.len());
        self.characteristics
            .lock()
            .await
            .insert(id.clone(), characteristics);
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.characteristics.lock().await.remove(id);
        let peripheral = match self.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(_) => return Ok(()),
        };
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> Result<bool> {
        match self.peripheral(id).await {
            Ok(peripheral) => Ok(peripheral.is_connected().await?),
            Err(_) => Ok(false),
        }
    }

    async fn read(&self, id: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let chr = self.characteristic(id, service, characteristic).await?;
        let peripheral = self.peripheral(id).await?;
        Ok(peripheral.read(&chr).await?)
    }

    async fn write(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let chr = self.characteristic(id, service, characteristic).await?;
        let peripheral = self.peripheral(id).await?;
        peripheral
            .write(&chr, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }
}
