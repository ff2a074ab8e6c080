use log::{debug, info};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// There is no realistic use case for more simultaneous controllers.
pub const MAX_TRACKED: usize = 16;

/// Slot of a tracked device. Valid until the next removal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotId(pub usize);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("already tracking {MAX_TRACKED} devices")]
    CapacityExceeded,
    #[error("device {} is already tracked", .0.display())]
    AlreadyTracked(PathBuf),
}

pub struct TrackedDevice<R> {
    pub identity: PathBuf,
    pub resource: R,
    pub label: String,
    pub events_seen: u64,
}

/// Unordered, fixed-capacity collection of live controller devices.
/// Removal swaps the last entry into the freed slot.
pub struct Registry<R> {
    devices: Vec<TrackedDevice<R>>,
}

impl<R> Registry<R> {
    pub fn new() -> Self {
        Self {
            devices: Vec::with_capacity(MAX_TRACKED),
        }
    }

    pub fn add(
        &mut self,
        identity: PathBuf,
        resource: R,
        label: String,
    ) -> Result<SlotId, RegistryError> {
        if self.contains(&identity) {
            return Err(RegistryError::AlreadyTracked(identity));
        }
        if self.devices.len() >= MAX_TRACKED {
            return Err(RegistryError::CapacityExceeded);
        }
        info!(
            "tracking {label} ({}); {} device(s) total",
            identity.display(),
            self.devices.len() + 1
        );
        self.devices.push(TrackedDevice {
            identity,
            resource,
            label,
            events_seen: 0,
        });
        Ok(SlotId(self.devices.len() - 1))
    }

    /// Idempotent: a slot that is already gone is a no-op.
    pub fn remove(&mut self, slot: SlotId) {
        if slot.0 >= self.devices.len() {
            debug!("remove for stale slot {}", slot.0);
            return;
        }
        let dev = self.devices.swap_remove(slot.0);
        info!(
            "dropped {} after {} event(s); {} device(s) remain",
            dev.label,
            dev.events_seen,
            self.devices.len()
        );
    }

    pub fn remove_all(&mut self) {
        if self.devices.is_empty() {
            return;
        }
        info!("dropping all {} tracked device(s)", self.devices.len());
        self.devices.clear();
    }

    pub fn contains(&self, identity: &Path) -> bool {
        self.devices.iter().any(|dev| dev.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut TrackedDevice<R>> {
        self.devices.get_mut(slot.0)
    }

    pub fn slots(&self) -> impl Iterator<Item = (SlotId, &TrackedDevice<R>)> {
        self.devices
            .iter()
            .enumerate()
            .map(|(idx, dev)| (SlotId(idx), dev))
    }
}
