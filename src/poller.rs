use crate::bluetooth::Transport;
use crate::error::Error;
use crate::firmware;
use crate::prelude::App;
use crate::protocol::Sample;
use crate::registry::DeviceRegistry;
use crate::sensor::DeviceId;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub period: Duration,
    pub read_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            period: firmware::POLL_PERIOD,
            read_timeout: firmware::READ_TIMEOUT,
        }
    }
}

impl From<&App> for PollSettings {
    fn from(app: &App) -> Self {
        Self {
            period: app.poll_period,
            read_timeout: app.read_timeout,
        }
    }
}

/// Owner of a running poll loop. Dropping the handle stops the loop.
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Cancels the pending delay or in-flight read and waits for the loop
    /// to exit. No sample is appended once this returns.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Starts polling `id` every `settings.period`. Simulated records get
/// synthesized values, everything else reads the values characteristic
/// through `transport`.
pub fn spawn(
    id: DeviceId,
    registry: DeviceRegistry,
    transport: Option<Arc<dyn Transport>>,
    settings: PollSettings,
) -> PollerHandle {
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(id, registry, transport, settings, stop_rx));
    PollerHandle {
        stop,
        task: Some(task),
    }
}

async fn run(
    id: DeviceId,
    registry: DeviceRegistry,
    transport: Option<Arc<dyn Transport>>,
    settings: PollSettings,
    mut stop: watch::Receiver<bool>,
) {
    info!("Polling {id} every {:?}", settings.period);
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = time::sleep(settings.period) => {}
        }

        let Some(record) = registry.get(&id) else {
            warn!("{id} left the registry, polling stopped");
            break;
        };
        if !record.enabled {
            break;
        }

        let timestamp = chrono::Utc::now().timestamp_millis();
        let sample = if record.is_simulated {
            Sample {
                timestamp,
                channel0: rand::random::<f64>() * 50.0,
                channel1: rand::random::<f64>() * 50.0,
            }
        } else {
            let Some(transport) = transport.as_ref() else {
                warn!("{id} has no transport, polling stopped");
                break;
            };
            let read = time::timeout(
                settings.read_timeout,
                transport.read(
                    &id,
                    firmware::SERVICE_UUID,
                    firmware::VALUES_CHARACTERISTIC_UUID,
                ),
            );
            let outcome = tokio::select! {
                biased;
                _ = stop.changed() => break,
                outcome = read => outcome,
            };
            let decoded = match outcome {
                Ok(Ok(bytes)) => Sample::decode(&bytes, timestamp),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::Timeout(settings.read_timeout)),
            };
            match decoded {
                Ok(sample) => sample,
                Err(err) => {
                    warn!("Skipping poll of {id}: {err}");
                    continue;
                }
            }
        };

        let appended = registry.try_update(&id, |record| {
            if record.enabled {
                Ok(record.with_sample(sample.timestamp, sample.channel0, sample.channel1))
            } else {
                Err(Error::NotReady(id.clone()))
            }
        });
        if appended.is_err() {
            break;
        }
        debug!("{id}: {} / {}", sample.channel0, sample.channel1);
    }
    info!("Stopped polling {id}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorRecord;
    use crate::simulator::SimTransport;

    fn simulated(registry: &DeviceRegistry) -> DeviceId {
        let id = DeviceId::new("sim");
        registry.upsert(SensorRecord::simulated(id.clone(), "Dummy").unwrap().with_enabled(true));
        id
    }

    fn sample_count(registry: &DeviceRegistry, id: &DeviceId) -> usize {
        registry.get(id).unwrap().telemetry.len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_record_is_polled() {
        let registry = DeviceRegistry::new();
        let id = simulated(&registry);
        let poller = spawn(id.clone(), registry.clone(), None, PollSettings::default());

        time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(sample_count(&registry, &id), 5);
        let record = registry.get(&id).unwrap();
        assert!(record
            .telemetry
            .samples(crate::sensor::Channel::Afe1)
            .iter()
            .all(|v| (0.0..50.0).contains(v)));
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_stops_growth() {
        let registry = DeviceRegistry::new();
        let id = simulated(&registry);
        let poller = spawn(id.clone(), registry.clone(), None, PollSettings::default());

        time::sleep(Duration::from_millis(450)).await;
        registry.update(&id, |r| r.with_enabled(false));
        let frozen = sample_count(&registry, &id);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sample_count(&registry, &id), frozen);
        assert!(poller.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_immediate() {
        let registry = DeviceRegistry::new();
        let id = simulated(&registry);
        let poller = spawn(id.clone(), registry.clone(), None, PollSettings::default());
        time::sleep(Duration::from_millis(250)).await;
        poller.stop().await;
        let frozen = sample_count(&registry, &id);
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sample_count(&registry, &id), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reads_leave_gaps() {
        let sim = Arc::new(SimTransport::new());
        let id = sim.add_device("Clarkson 1");
        sim.connect_now(&id);
        sim.set_read_delay(Some(Duration::from_millis(1500)));

        let registry = DeviceRegistry::new();
        registry.upsert(SensorRecord::new(id.clone(), "Clarkson 1").unwrap().with_enabled(true));
        let transport: Arc<dyn Transport> = sim.clone();
        let poller = spawn(id.clone(), registry.clone(), Some(transport), PollSettings::default());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sample_count(&registry, &id), 0);
        assert!(!poller.is_finished());

        // the device recovers, polling carries on without intervention
        sim.set_read_delay(None);
        time::sleep(Duration::from_secs(2)).await;
        assert!(sample_count(&registry, &id) > 0);
        // the link itself was never touched
        assert!(sim.is_connected(&id));
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_a_slow_read() {
        let sim = Arc::new(SimTransport::new());
        let id = sim.add_device("Clarkson 1");
        sim.connect_now(&id);
        sim.set_read_delay(Some(Duration::from_millis(600)));

        let registry = DeviceRegistry::new();
        registry.upsert(SensorRecord::new(id.clone(), "Clarkson 1").unwrap().with_enabled(true));
        let transport: Arc<dyn Transport> = sim.clone();
        let poller = spawn(id.clone(), registry.clone(), Some(transport), PollSettings::default());

        // the first read started at 200 ms and is still in flight
        time::sleep(Duration::from_millis(500)).await;
        let started = time::Instant::now();
        poller.stop().await;
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(sample_count(&registry, &id), 0);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sample_count(&registry, &id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hardware_values_are_decoded() {
        let sim = Arc::new(SimTransport::new());
        let id = sim.add_device("CU-7");
        sim.connect_now(&id);

        let registry = DeviceRegistry::new();
        registry.upsert(SensorRecord::new(id.clone(), "CU-7").unwrap().with_enabled(true));
        let poller = spawn(
            id.clone(),
            registry.clone(),
            Some(sim.clone() as Arc<dyn Transport>),
            PollSettings::default(),
        );
        time::sleep(Duration::from_millis(650)).await;
        poller.stop().await;

        let record = registry.get(&id).unwrap();
        let rows: Vec<_> = record.telemetry.rows().map(|(_, a, b)| (a, b)).collect();
        assert_eq!(rows, vec![(1.0, 2.0), (2.0, 4.0), (3.0, 6.0)]);
    }
}
