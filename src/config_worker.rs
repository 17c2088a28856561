use crate::bluetooth::Transport;
use crate::error::{Error, Result};
use crate::firmware::{self, CONFIG_LEN};
use crate::protocol;
use crate::sensor::{DeviceConfig, DeviceId, SensorRecord};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;

pub type Reply = oneshot::Sender<Result<Arc<SensorRecord>>>;

#[derive(Debug)]
pub enum ConfigOp {
    /// Read and decode the config characteristic.
    Load(Option<Reply>),
    /// Write an already encoded image.
    Write {
        bytes: [u8; CONFIG_LEN],
        reply: Reply,
    },
}

impl ConfigOp {
    fn into_reply(self) -> Option<Reply> {
        match self {
            ConfigOp::Load(reply) => reply,
            ConfigOp::Write { reply, .. } => Some(reply),
        }
    }

    /// Answers a caller whose operation will never run.
    pub fn reject(self, id: &DeviceId) {
        if let Some(reply) = self.into_reply() {
            let _ = reply.send(Err(Error::NotReady(id.clone())));
        }
    }
}

/// Outcome of one operation, applied to the registry by the supervisor.
#[derive(Debug)]
pub struct ConfigDone {
    pub id: DeviceId,
    pub worker: u64,
    pub result: Result<DeviceConfig>,
    pub reply: Option<Reply>,
}

/// Runs the config reads and writes of one connected device, one at a
/// time and in submission order. Dropping the handle cancels the operation
/// in flight and rejects everything still queued.
pub struct ConfigWorker {
    serial: u64,
    ops: mpsc::UnboundedSender<ConfigOp>,
    stop: watch::Sender<bool>,
}

impl ConfigWorker {
    pub fn spawn(
        id: DeviceId,
        serial: u64,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        done: mpsc::UnboundedSender<ConfigDone>,
    ) -> Self {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(run(id, serial, transport, timeout, ops_rx, stop_rx, done));
        Self { serial, ops, stop }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Queues `op`, handing it back if the worker is gone.
    pub fn submit(&self, op: ConfigOp) -> Result<(), ConfigOp> {
        self.ops.send(op).map_err(|err| err.0)
    }
}

impl Drop for ConfigWorker {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

async fn perform(transport: &dyn Transport, id: &DeviceId, op: &ConfigOp) -> Result<DeviceConfig> {
    match op {
        ConfigOp::Load(_) => {
            let bytes = transport
                .read(
                    id,
                    firmware::SERVICE_UUID,
                    firmware::CONFIG_CHARACTERISTIC_UUID,
                )
                .await?;
            protocol::decode(&bytes)
        }
        ConfigOp::Write { bytes, .. } => {
            transport
                .write(
                    id,
                    firmware::SERVICE_UUID,
                    firmware::CONFIG_CHARACTERISTIC_UUID,
                    bytes,
                )
                .await?;
            info!("{id}: wrote configuration {}", protocol::config_as_csv(bytes));
            protocol::decode(bytes)
        }
    }
}

async fn run(
    id: DeviceId,
    serial: u64,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    mut ops: mpsc::UnboundedReceiver<ConfigOp>,
    mut stop: watch::Receiver<bool>,
    done: mpsc::UnboundedSender<ConfigDone>,
) {
    loop {
        let op = tokio::select! {
            biased;
            _ = stop.changed() => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let outcome = tokio::select! {
            biased;
            _ = stop.changed() => None,
            outcome = time::timeout(timeout, perform(transport.as_ref(), &id, &op)) => {
                Some(outcome.unwrap_or_else(|_| Err(Error::Timeout(timeout))))
            }
        };
        let Some(result) = outcome else {
            debug!("{id}: config operation cancelled");
            op.reject(&id);
            break;
        };
        let _ = done.send(ConfigDone {
            id: id.clone(),
            worker: serial,
            result,
            reply: op.into_reply(),
        });
    }

    ops.close();
    while let Ok(op) = ops.try_recv() {
        op.reject(&id);
    }
}
