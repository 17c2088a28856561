//! Async driver of the connection [`Lifecycle`]: feeds it commands,
//! transport notifications and step completions, and carries out the
//! actions it answers with.

use crate::bluetooth::{RadioState, Transport, TransportEvent};
use crate::config_worker::{ConfigDone, ConfigOp, ConfigWorker, Reply};
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, LinkAction, LinkEvent, LinkState};
use crate::poller::{self, PollSettings, PollerHandle};
use crate::prelude::App;
use crate::protocol;
use crate::registry::DeviceRegistry;
use crate::sensor::{DeviceConfig, DeviceId, SensorRecord};
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

pub type LinkStates = HashMap<DeviceId, LinkState>;

#[derive(Debug)]
pub enum Command {
    Enable(DeviceId),
    Disable(DeviceId),
    Foreground,
    Background,
    WriteConfig {
        id: DeviceId,
        config: DeviceConfig,
        reply: Reply,
    },
    ReloadConfig {
        id: DeviceId,
        reply: Reply,
    },
    Shutdown(oneshot::Sender<()>),
}

pub struct Supervisor {
    app: App,
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    lifecycle: Lifecycle,
    commands: mpsc::Receiver<Command>,
    steps_tx: mpsc::UnboundedSender<LinkEvent>,
    steps_rx: mpsc::UnboundedReceiver<LinkEvent>,
    config_tx: mpsc::UnboundedSender<ConfigDone>,
    config_rx: mpsc::UnboundedReceiver<ConfigDone>,
    inflight: HashMap<DeviceId, JoinHandle<()>>,
    pollers: HashMap<DeviceId, PollerHandle>,
    config_workers: HashMap<DeviceId, ConfigWorker>,
    next_worker: u64,
    states: watch::Sender<LinkStates>,
}

impl Supervisor {
    pub fn new(
        app: App,
        transport: Arc<dyn Transport>,
        registry: DeviceRegistry,
    ) -> (Self, SupervisorHandle) {
        let (commands_tx, commands) = mpsc::channel(32);
        let (steps_tx, steps_rx) = mpsc::unbounded_channel();
        let (config_tx, config_rx) = mpsc::unbounded_channel();
        let (states, states_rx) = watch::channel(LinkStates::new());
        let lifecycle = Lifecycle::new(app.name_prefixes.clone(), app.max_retries);
        let handle = SupervisorHandle {
            commands: commands_tx,
            registry: registry.clone(),
            states: states_rx,
        };
        let supervisor = Self {
            app,
            transport,
            registry,
            lifecycle,
            commands,
            steps_tx,
            steps_rx,
            config_tx,
            config_rx,
            inflight: HashMap::new(),
            pollers: HashMap::new(),
            config_workers: HashMap::new(),
            next_worker: 0,
            states,
        };
        (supervisor, handle)
    }

    /// Runs until [`SupervisorHandle::shutdown`] is called or every handle
    /// has been dropped. Pollers are stopped and links closed on the way out.
    pub async fn run(mut self) -> Result<()> {
        let mut events = self.transport.events().await?;
        let mut events_open = true;

        for record in self.registry.snapshot().iter() {
            let id = record.device_id().clone();
            self.lifecycle
                .track(id.clone(), record.enabled, record.is_simulated);
            if record.enabled && record.is_simulated {
                self.start_polling(id);
            }
        }
        match self.transport.radio_state().await {
            Ok(RadioState::PoweredOn) => self.dispatch(LinkEvent::RadioPoweredOn).await,
            Ok(state) => info!("Waiting for bluetooth, radio is {state:?}"),
            Err(err) => warn!("Could not query the radio state: {err}"),
        }
        self.publish_states();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command).await {
                            return Ok(());
                        }
                    }
                    None => break,
                },
                Some(event) = self.steps_rx.recv() => self.dispatch(event).await,
                Some(done) = self.config_rx.recv() => self.on_config_done(done),
                event = events.next(), if events_open => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        error!("Transport event stream ended");
                        events_open = false;
                    }
                },
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let event = match event {
            TransportEvent::Discovered { id, name } => LinkEvent::Discovered { id, name },
            TransportEvent::RadioState(RadioState::PoweredOn) => LinkEvent::RadioPoweredOn,
            TransportEvent::RadioState(RadioState::PoweredOff) => LinkEvent::RadioPoweredOff,
            TransportEvent::RadioState(RadioState::Unknown) => {
                debug!("Radio state is unknown");
                return;
            }
            TransportEvent::Disconnected(id) => {
                // A teardown we issued earlier may report in after the next
                // link is already up.
                if self.still_connected(&id).await {
                    debug!("{id}: ignoring the disconnect of an earlier link");
                    return;
                }
                LinkEvent::LinkLost(id)
            }
        };
        self.dispatch(event).await;
    }

    async fn still_connected(&self, id: &DeviceId) -> bool {
        matches!(
            time::timeout(self.app.read_timeout, self.transport.is_connected(id)).await,
            Ok(Ok(true))
        )
    }

    /// Returns `false` once the supervisor has shut down.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Enable(id) => {
                self.track_from_registry(&id);
                self.dispatch(LinkEvent::Enable(id)).await;
            }
            Command::Disable(id) => {
                self.track_from_registry(&id);
                self.dispatch(LinkEvent::Disable(id)).await;
            }
            Command::Foreground => self.dispatch(LinkEvent::Foreground).await,
            Command::Background => self.dispatch(LinkEvent::Background).await,
            Command::WriteConfig { id, config, reply } => self.write_config(id, config, reply),
            Command::ReloadConfig { id, reply } => self.reload_config(id, reply),
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Records inserted into the registry after startup join the lifecycle
    /// on their first command.
    fn track_from_registry(&mut self, id: &DeviceId) {
        if let Some(record) = self.registry.get(id) {
            self.lifecycle
                .track(id.clone(), record.enabled, record.is_simulated);
        }
    }

    async fn dispatch(&mut self, event: LinkEvent) {
        let actions = self.lifecycle.handle(event);
        self.publish_states();
        for action in actions {
            self.execute(action).await;
        }
    }

    fn publish_states(&self) {
        self.states.send_replace(self.lifecycle.states());
    }

    async fn execute(&mut self, action: LinkAction) {
        debug!("supervisor: {action:?}");
        match action {
            LinkAction::StartScan => {
                if let Err(err) = self.transport.start_scan(&self.app.name_prefixes).await {
                    warn!("Could not start scanning: {err}");
                }
            }
            LinkAction::StopScan => {
                if let Err(err) = self.transport.stop_scan().await {
                    warn!("Could not stop scanning: {err}");
                }
            }
            LinkAction::AddRecord { id, name } => match SensorRecord::new(id.clone(), name) {
                Ok(record) => {
                    let record = record
                        .with_enabled(true)
                        .with_telemetry_capacity(self.app.telemetry_capacity);
                    if !self.registry.insert_if_absent(record) {
                        debug!("{id} is already registered");
                    }
                }
                Err(err) => warn!("Not registering {id}: {err}"),
            },
            LinkAction::SetEnabled { id, enabled } => {
                self.registry.update(&id, |record| record.with_enabled(enabled));
            }
            LinkAction::Connect(id) => {
                let transport = Arc::clone(&self.transport);
                let target = id.clone();
                self.spawn_step(id.clone(), LinkEvent::Connected(id), async move {
                    transport.connect(&target).await
                });
            }
            LinkAction::DiscoverServices(id) => {
                let transport = Arc::clone(&self.transport);
                let target = id.clone();
                self.spawn_step(id.clone(), LinkEvent::ServicesDiscovered(id), async move {
                    transport.discover_services(&target).await
                });
            }
            LinkAction::LoadConfig(id) => self.submit_config(&id, ConfigOp::Load(None)),
            LinkAction::Release(id) => {
                // Finish the teardown before the loop can start another
                // attempt on the same device.
                self.teardown(&id);
                self.disconnect(&id).await;
                let _ = self.steps_tx.send(LinkEvent::Released(id));
            }
            LinkAction::Disconnect(id) => {
                self.teardown(&id);
                self.disconnect(&id).await;
            }
            LinkAction::StartPolling(id) => self.start_polling(id),
            LinkAction::StopPolling(id) => {
                self.config_workers.remove(&id);
                if let Some(poller) = self.pollers.remove(&id) {
                    poller.stop().await;
                }
            }
        }
    }

    /// Runs one connection step in the background and reports its outcome
    /// back to the loop, so that a `Background` can abort it.
    fn spawn_step<F>(&mut self, id: DeviceId, done: LinkEvent, step: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let steps = self.steps_tx.clone();
        let timeout = self.app.connect_timeout;
        let target = id.clone();
        let task = tokio::spawn(async move {
            let event = match time::timeout(timeout, step).await {
                Ok(Ok(())) => done,
                Ok(Err(err)) => LinkEvent::TransportFailed(target, err),
                Err(_) => LinkEvent::TransportFailed(target, Error::Timeout(timeout)),
            };
            let _ = steps.send(event);
        });
        if let Some(previous) = self.inflight.insert(id, task) {
            previous.abort();
        }
    }

    /// Cancels the connection step and the config operations of `id`.
    fn teardown(&mut self, id: &DeviceId) {
        if let Some(task) = self.inflight.remove(id) {
            task.abort();
        }
        self.config_workers.remove(id);
    }

    fn start_polling(&mut self, id: DeviceId) {
        if self.pollers.get(&id).is_some_and(|p| !p.is_finished()) {
            return;
        }
        let handle = poller::spawn(
            id.clone(),
            self.registry.clone(),
            Some(Arc::clone(&self.transport)),
            PollSettings::from(&self.app),
        );
        self.pollers.insert(id, handle);
    }

    async fn disconnect(&self, id: &DeviceId) {
        match time::timeout(self.app.connect_timeout, self.transport.disconnect(id)).await {
            Ok(Ok(())) => info!("Disconnected from {id}"),
            Ok(Err(err)) => warn!("Disconnecting {id} failed: {err}"),
            Err(_) => warn!("Disconnecting {id} timed out"),
        }
    }

    fn submit_config(&mut self, id: &DeviceId, op: ConfigOp) {
        let op = match self.config_workers.get(id) {
            Some(worker) => match worker.submit(op) {
                Ok(()) => return,
                Err(op) => op,
            },
            None => op,
        };
        self.next_worker += 1;
        let worker = ConfigWorker::spawn(
            id.clone(),
            self.next_worker,
            Arc::clone(&self.transport),
            self.app.connect_timeout,
            self.config_tx.clone(),
        );
        if let Err(op) = worker.submit(op) {
            op.reject(id);
        }
        self.config_workers.insert(id.clone(), worker);
    }

    /// Publishes a finished config operation, unless the link it ran on
    /// has been torn down since.
    fn on_config_done(&mut self, done: ConfigDone) {
        let ConfigDone {
            id,
            worker,
            result,
            reply,
        } = done;
        let current = self
            .config_workers
            .get(&id)
            .is_some_and(|w| w.serial() == worker)
            && self.lifecycle.is_ready(&id);
        let outcome = if current {
            result.and_then(|config| {
                self.registry
                    .try_update(&id, |record| Ok(record.with_config(config)))
            })
        } else {
            Err(Error::NotReady(id.clone()))
        };
        match reply {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => match outcome {
                Ok(record) => info!("{id}: configuration loaded, {:?}", record.config),
                Err(err) => warn!("Could not read the configuration of {id}: {err}"),
            },
        }
    }

    fn reload_config(&mut self, id: DeviceId, reply: Reply) {
        let Some(record) = self.registry.get(&id) else {
            let _ = reply.send(Err(Error::UnknownDevice(id)));
            return;
        };
        if record.is_simulated {
            let _ = reply.send(Ok(record));
        } else if !self.lifecycle.is_ready(&id) {
            let _ = reply.send(Err(Error::NotReady(id)));
        } else {
            self.submit_config(&id, ConfigOp::Load(Some(reply)));
        }
    }

    /// Encodes before touching anything. The record keeps the decoded form
    /// of the bytes that reached the device.
    fn write_config(&mut self, id: DeviceId, config: DeviceConfig, reply: Reply) {
        let bytes = match protocol::encode(&config) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let Some(record) = self.registry.get(&id) else {
            let _ = reply.send(Err(Error::UnknownDevice(id)));
            return;
        };
        if record.is_simulated {
            let stored = protocol::decode(&bytes).and_then(|stored| {
                self.registry
                    .try_update(&id, |record| Ok(record.with_config(stored)))
            });
            let _ = reply.send(stored);
        } else if !self.lifecycle.is_ready(&id) {
            let _ = reply.send(Err(Error::NotReady(id)));
        } else {
            self.submit_config(&id, ConfigOp::Write { bytes, reply });
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down");
        self.config_workers.clear();
        for (_, poller) in self.pollers.drain() {
            poller.stop().await;
        }
        for (_, task) in self.inflight.drain() {
            task.abort();
        }
        if self.lifecycle.is_scanning() {
            if let Err(err) = self.transport.stop_scan().await {
                warn!("Could not stop scanning: {err}");
            }
        }
        for id in self.lifecycle.connected() {
            self.disconnect(&id).await;
        }
    }
}

/// Cheap, cloneable front end of a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    registry: DeviceRegistry,
    states: watch::Receiver<LinkStates>,
}

impl SupervisorHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| Error::Closed)
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<Arc<SensorRecord>> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| Error::Closed)?
    }

    fn known(&self, id: &DeviceId) -> Result<()> {
        if self.registry.contains(id) {
            Ok(())
        } else {
            Err(Error::UnknownDevice(id.clone()))
        }
    }

    pub async fn enable(&self, id: &DeviceId) -> Result<()> {
        self.known(id)?;
        self.send(Command::Enable(id.clone())).await
    }

    pub async fn disable(&self, id: &DeviceId) -> Result<()> {
        self.known(id)?;
        self.send(Command::Disable(id.clone())).await
    }

    pub async fn foreground(&self) -> Result<()> {
        self.send(Command::Foreground).await
    }

    pub async fn background(&self) -> Result<()> {
        self.send(Command::Background).await
    }

    /// Writes `config` to the device and publishes the updated record.
    /// Values that do not fit their register fields are rejected before
    /// anything is sent, leaving device and record unchanged.
    pub async fn write_config(
        &self,
        id: &DeviceId,
        config: DeviceConfig,
    ) -> Result<Arc<SensorRecord>> {
        self.known(id)?;
        let id = id.clone();
        self.request(|reply| Command::WriteConfig { id, config, reply })
            .await
    }

    pub async fn reload_config(&self, id: &DeviceId) -> Result<Arc<SensorRecord>> {
        self.known(id)?;
        let id = id.clone();
        self.request(|reply| Command::ReloadConfig { id, reply }).await
    }

    pub fn rename(&self, id: &DeviceId, name: &str) -> Result<Arc<SensorRecord>> {
        self.registry
            .try_update(id, |record| record.with_display_name(name))
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn link_state(&self, id: &DeviceId) -> Option<LinkState> {
        self.states.borrow().get(id).copied()
    }

    pub fn link_states(&self) -> watch::Receiver<LinkStates> {
        self.states.clone()
    }

    /// Stops pollers, closes every link and waits for the loop to exit.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Shutdown(reply)).await?;
        done.await.map_err(|_| Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimTransport;
    use std::time::Duration;

    fn start(sim: &Arc<SimTransport>, registry: DeviceRegistry) -> SupervisorHandle {
        let transport: Arc<dyn Transport> = sim.clone();
        let (supervisor, handle) = Supervisor::new(App::default(), transport, registry);
        tokio::spawn(supervisor.run());
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_record_is_enabled_without_radio() {
        let sim = Arc::new(SimTransport::new());
        sim.set_radio(RadioState::PoweredOff);
        let registry = DeviceRegistry::new();
        let id = DeviceId::new("dummy");
        registry.upsert(SensorRecord::simulated(id.clone(), "Dummy").unwrap());
        let handle = start(&sim, registry.clone());

        handle.enable(&id).await.unwrap();
        time::sleep(Duration::from_millis(1100)).await;
        let record = registry.get(&id).unwrap();
        assert!(record.enabled);
        assert_eq!(record.telemetry.len(), 5);
        assert_eq!(handle.link_state(&id), Some(LinkState::Idle));

        handle.disable(&id).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        let frozen = registry.get(&id).unwrap().telemetry.len();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.get(&id).unwrap().telemetry.len(), frozen);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_write_skips_the_radio() {
        let sim = Arc::new(SimTransport::new());
        let registry = DeviceRegistry::new();
        let id = DeviceId::new("dummy");
        registry.upsert(SensorRecord::simulated(id.clone(), "Dummy").unwrap());
        let handle = start(&sim, registry.clone());

        let config = DeviceConfig::default().with_dac_percent(25.0);
        let record = handle.write_config(&id, config).await.unwrap();
        assert_eq!(record.config, config);
        assert_eq!(handle.reload_config(&id).await.unwrap().config, config);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_devices_are_rejected() {
        let sim = Arc::new(SimTransport::new());
        let handle = start(&sim, DeviceRegistry::new());
        let id = DeviceId::new("nope");
        assert_eq!(handle.enable(&id).await, Err(Error::UnknownDevice(id.clone())));
        assert_eq!(
            handle.write_config(&id, DeviceConfig::default()).await,
            Err(Error::UnknownDevice(id.clone()))
        );
        assert!(handle.rename(&id, "x").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_the_handle() {
        let sim = Arc::new(SimTransport::new());
        let handle = start(&sim, DeviceRegistry::new());
        handle.shutdown().await.unwrap();
        assert_eq!(handle.foreground().await, Err(Error::Closed));
    }
}
