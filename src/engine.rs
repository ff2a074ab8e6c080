use log::{debug, warn};
use std::path::PathBuf;
use std::time::Instant;

use crate::inhibit::{Inhibitor, SaverClient};
use crate::registry::{Registry, RegistryError, SlotId};

/// Everything the daemon reacts to, delivered to one central handler.
pub enum Event<R> {
    Activity { label: String },
    DeviceGone { slot: SlotId },
    HotplugAdd { identity: PathBuf, resource: R, label: String },
    PresenceChanged { present: bool },
    TimerFired,
}

/// The state machine proper: device registry, inhibition cookie and timer,
/// and the screen saver's bus presence. Single-owner; all mutation goes
/// through `handle`.
pub struct Engine<R, C> {
    pub registry: Registry<R>,
    pub inhibitor: Inhibitor<C>,
    saver_present: bool,
}

impl<R, C: SaverClient> Engine<R, C> {
    pub fn new(inhibitor: Inhibitor<C>, saver_present: bool) -> Self {
        Self {
            registry: Registry::new(),
            inhibitor,
            saver_present,
        }
    }

    pub fn saver_present(&self) -> bool {
        self.saver_present
    }

    pub fn handle(&mut self, event: Event<R>, now: Instant) {
        match event {
            Event::Activity { label } => {
                if self.saver_present {
                    self.inhibitor.on_activity(&label, now);
                }
            }
            Event::DeviceGone { slot } => self.registry.remove(slot),
            Event::HotplugAdd {
                identity,
                resource,
                label,
            } => {
                if !self.saver_present {
                    debug!(
                        "ignoring {} while the screen saver service is absent",
                        identity.display()
                    );
                    return;
                }
                match self.registry.add(identity, resource, label) {
                    Ok(_) => {}
                    Err(RegistryError::AlreadyTracked(path)) => {
                        debug!("{} already tracked", path.display());
                    }
                    Err(err @ RegistryError::CapacityExceeded) => {
                        warn!("{err}; device not tracked");
                    }
                }
            }
            Event::PresenceChanged { present } => {
                self.saver_present = present;
                if !present {
                    // Nobody is left to act on activity, so stop reading it.
                    self.inhibitor.on_saver_vanished();
                    self.registry.remove_all();
                }
            }
            Event::TimerFired => self.inhibitor.on_timer(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inhibit::testing::MockSaver;
    use crate::inhibit::INHIBIT_TIMEOUT;
    use crate::registry::MAX_TRACKED;
    use std::fs::File;
    use std::time::Duration;

    fn engine(present: bool) -> (Engine<File, MockSaver>, MockSaver) {
        let saver = MockSaver::new();
        (
            Engine::new(Inhibitor::new(saver.clone(), INHIBIT_TIMEOUT), present),
            saver,
        )
    }

    fn add(engine: &mut Engine<File, MockSaver>, n: usize, now: Instant) {
        engine.handle(
            Event::HotplugAdd {
                identity: PathBuf::from(format!("/dev/input/event{n}")),
                resource: File::open("/dev/null").unwrap(),
                label: format!("pad {n}"),
            },
            now,
        );
    }

    #[test]
    fn adds_are_ignored_while_saver_is_absent() {
        let (mut engine, saver) = engine(false);
        let now = Instant::now();
        add(&mut engine, 0, now);
        assert!(engine.registry.is_empty());

        engine.handle(Event::Activity { label: "pad 0".into() }, now);
        assert!(saver.calls().is_empty());
    }

    #[test]
    fn duplicate_add_from_enumeration_race_is_tracked_once() {
        let (mut engine, _saver) = engine(true);
        let now = Instant::now();
        add(&mut engine, 0, now);
        add(&mut engine, 0, now);
        assert_eq!(engine.registry.len(), 1);
    }

    #[test]
    fn capacity_overflow_leaves_existing_devices() {
        let (mut engine, _saver) = engine(true);
        let now = Instant::now();
        for n in 0..MAX_TRACKED + 3 {
            add(&mut engine, n, now);
        }
        assert_eq!(engine.registry.len(), MAX_TRACKED);
    }

    #[test]
    fn presence_loss_drops_cookie_and_devices_without_release() {
        let (mut engine, saver) = engine(true);
        let now = Instant::now();
        add(&mut engine, 0, now);
        add(&mut engine, 1, now);
        engine.handle(Event::Activity { label: "pad 0".into() }, now);
        assert!(engine.inhibitor.is_inhibiting());

        engine.handle(Event::PresenceChanged { present: false }, now);
        assert!(!engine.inhibitor.is_inhibiting());
        assert!(engine.registry.is_empty());
        assert!(!engine.saver_present());
        assert_eq!(saver.uninhibit_count(), 0);
    }

    #[test]
    fn activity_from_two_devices_shares_one_cookie() {
        let (mut engine, saver) = engine(true);
        let t0 = Instant::now();
        add(&mut engine, 0, t0);
        engine.handle(Event::Activity { label: "pad 0".into() }, t0);

        // pad 1 is hotplugged mid-session and rearms the same inhibition.
        let t300 = t0 + Duration::from_secs(300);
        add(&mut engine, 1, t300);
        engine.handle(Event::Activity { label: "pad 1".into() }, t300);

        engine.handle(Event::TimerFired, t0 + Duration::from_secs(600));
        assert!(engine.inhibitor.is_inhibiting());
        engine.handle(Event::TimerFired, t0 + Duration::from_secs(900));
        assert!(!engine.inhibitor.is_inhibiting());
        assert_eq!(saver.inhibit_count(), 1);
        assert_eq!(saver.uninhibit_count(), 1);
    }

    #[test]
    fn device_gone_removes_only_that_device() {
        let (mut engine, _saver) = engine(true);
        let now = Instant::now();
        for n in 0..3 {
            add(&mut engine, n, now);
        }
        engine.handle(Event::DeviceGone { slot: SlotId(0) }, now);
        assert_eq!(engine.registry.len(), 2);
        assert!(!engine.registry.contains(std::path::Path::new("/dev/input/event0")));
    }
}
