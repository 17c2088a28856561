use crate::error::{Error, Result};
use crate::sensor::{DeviceId, SensorRecord};
use log::{debug, error};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::watch;

/// An immutable view of every known device, sorted by display name.
pub type Snapshot = Arc<Vec<Arc<SensorRecord>>>;

/// Ordered, deduplicated set of sensor records.
///
/// Writers never touch a published record: each change builds a new record
/// and a new snapshot, and readers holding an older snapshot keep seeing a
/// consistent state. Cloning the registry yields another handle to the same
/// collection.
#[derive(Clone)]
pub struct DeviceRegistry {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<SensorRecord>> {
        self.tx
            .borrow()
            .iter()
            .find(|r| r.device_id() == id)
            .cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.tx.borrow().iter().any(|r| r.device_id() == id)
    }

    pub fn any_enabled(&self) -> bool {
        self.tx.borrow().iter().any(|r| r.enabled)
    }

    /// Adds a record or replaces the one with the same device id.
    pub fn upsert(&self, record: SensorRecord) -> Arc<SensorRecord> {
        let record = Arc::new(record);
        self.tx.send_modify(|snapshot| {
            let mut next = snapshot.as_ref().clone();
            match next.iter().position(|r| r.device_id() == record.device_id()) {
                Some(index) => next[index] = Arc::clone(&record),
                None => next.push(Arc::clone(&record)),
            }
            next.sort_by(|a, b| by_display_name(a, b));
            *snapshot = Arc::new(next);
        });
        debug!("registry: published {}", record.device_id());
        record
    }

    /// Adds the record unless its device id is already known. Returns
    /// whether it was added.
    pub fn insert_if_absent(&self, record: SensorRecord) -> bool {
        let record = Arc::new(record);
        self.tx.send_if_modified(|snapshot| {
            if snapshot.iter().any(|r| r.device_id() == record.device_id()) {
                return false;
            }
            let mut next = snapshot.as_ref().clone();
            next.push(Arc::clone(&record));
            next.sort_by(|a, b| by_display_name(a, b));
            *snapshot = Arc::new(next);
            true
        })
    }

    /// Replaces one record with the result of `f`.
    pub fn try_update<F>(&self, id: &DeviceId, f: F) -> Result<Arc<SensorRecord>>
    where
        F: FnOnce(&SensorRecord) -> Result<SensorRecord>,
    {
        let mut outcome = Err(Error::UnknownDevice(id.clone()));
        self.tx.send_if_modified(|snapshot| {
            let Some(index) = snapshot.iter().position(|r| r.device_id() == id) else {
                return false;
            };
            let replacement = match f(&snapshot[index]) {
                Ok(replacement) => replacement,
                Err(err) => {
                    outcome = Err(err);
                    return false;
                }
            };
            if replacement.device_id() != id {
                error!(
                    "registry: refusing to replace {id} with a record for {}",
                    replacement.device_id()
                );
                outcome = Err(Error::Validation(format!(
                    "device id of {id} cannot change"
                )));
                return false;
            }
            let replacement = Arc::new(replacement);
            let mut next = snapshot.as_ref().clone();
            next[index] = Arc::clone(&replacement);
            next.sort_by(|a, b| by_display_name(a, b));
            *snapshot = Arc::new(next);
            outcome = Ok(replacement);
            true
        });
        outcome
    }

    pub fn update<F>(&self, id: &DeviceId, f: F) -> Option<Arc<SensorRecord>>
    where
        F: FnOnce(&SensorRecord) -> SensorRecord,
    {
        self.try_update(id, |record| Ok(f(record))).ok()
    }
}

fn by_display_name(a: &SensorRecord, b: &SensorRecord) -> Ordering {
    a.display_name()
        .to_lowercase()
        .cmp(&b.display_name().to_lowercase())
}
