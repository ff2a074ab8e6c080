use anyhow::{Context, Result};
use log::{info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Instant;

use crate::engine::{Engine, Event};
use crate::hotplug::{self, HotplugWatcher};
use crate::inhibit::{DbusSaver, Inhibitor, INHIBIT_TIMEOUT, SAVER_NAME};
use crate::presence::PresenceWatcher;
use crate::reader::{self, Drained};
use crate::registry::SlotId;

#[derive(Copy, Clone)]
enum Source {
    Signal,
    Presence,
    Hotplug,
    Device(SlotId),
}

/// Wires the state machine to the real event sources: one poll set over the
/// signal pipe, the presence pipe, the udev monitor socket and every tracked
/// device, serviced by a single thread.
pub struct Daemon {
    engine: Engine<evdev::Device, DbusSaver>,
    hotplug: HotplugWatcher,
    presence: PresenceWatcher,
    signals: UnixStream,
}

impl Daemon {
    pub fn new(conn: &zbus::blocking::Connection) -> Result<Self> {
        let (presence, present) = PresenceWatcher::spawn(conn)?;
        let saver = DbusSaver::new(conn).context("create screen saver proxy")?;
        let signals = register_signals().context("install signal handlers")?;

        let mut daemon = Self {
            engine: Engine::new(Inhibitor::new(saver, INHIBIT_TIMEOUT), present),
            hotplug: HotplugWatcher::new(),
            presence,
            signals,
        };

        if present {
            daemon.arm();
        } else {
            info!("{SAVER_NAME} has no owner; waiting");
        }
        Ok(daemon)
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            let timeout = match self.engine.inhibitor.poll_timeout(Instant::now()) {
                Some(remaining) => {
                    PollTimeout::from(remaining.as_millis().min(u16::MAX as u128) as u16)
                }
                None => PollTimeout::NONE,
            };

            let mut ready: Vec<Source> = Vec::new();
            {
                let mut sources: Vec<Source> = vec![Source::Signal, Source::Presence];
                let mut fds: Vec<PollFd> = vec![
                    PollFd::new(self.signals.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.presence.stream().as_fd(), PollFlags::POLLIN),
                ];
                if let Some(fd) = self.hotplug.fd() {
                    sources.push(Source::Hotplug);
                    fds.push(PollFd::new(
                        unsafe { BorrowedFd::borrow_raw(fd) },
                        PollFlags::POLLIN,
                    ));
                }
                for (slot, dev) in self.engine.registry.slots() {
                    sources.push(Source::Device(slot));
                    fds.push(PollFd::new(
                        unsafe { BorrowedFd::borrow_raw(dev.resource.as_raw_fd()) },
                        PollFlags::POLLIN,
                    ));
                }

                match poll(&mut fds, timeout) {
                    Ok(_) => {}
                    // A signal landed; its pipe byte is picked up next round.
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err).context("poll failed"),
                }

                for (source, fd) in sources.iter().zip(&fds) {
                    let revents = fd.revents().unwrap_or(PollFlags::empty());
                    if revents
                        .intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
                    {
                        ready.push(*source);
                    }
                }
            }

            let now = Instant::now();
            let mut shutdown = false;
            let mut gone: Vec<SlotId> = Vec::new();

            for source in ready {
                match source {
                    Source::Signal => shutdown = true,
                    Source::Presence => {
                        let transitions = self
                            .presence
                            .drain()
                            .context("lost track of the screen saver's bus presence")?;
                        for present in transitions {
                            let was_present = self.engine.saver_present();
                            self.engine.handle(Event::PresenceChanged { present }, now);
                            if present && !was_present {
                                self.arm();
                            } else if !present {
                                self.hotplug.stop();
                            }
                        }
                    }
                    Source::Hotplug => {
                        for path in self.hotplug.drain() {
                            self.track(path);
                        }
                    }
                    Source::Device(slot) => {
                        let Some(dev) = self.engine.registry.get_mut(slot) else {
                            continue;
                        };
                        match reader::drain(&mut dev.resource) {
                            Drained::Events { total, releases } => {
                                dev.events_seen += total;
                                if releases > 0 {
                                    let label = dev.label.clone();
                                    self.engine.handle(Event::Activity { label }, now);
                                }
                            }
                            Drained::Gone => gone.push(slot),
                        }
                    }
                }
            }

            // Highest slot first, so swap-removal never moves an entry into a
            // slot that is still pending removal.
            for slot in gone.into_iter().rev() {
                self.engine.handle(Event::DeviceGone { slot }, now);
            }

            if self.engine.inhibitor.is_inhibiting() {
                self.engine.handle(Event::TimerFired, Instant::now());
            }

            if shutdown {
                break;
            }
        }

        info!("shutting down");
        self.engine.inhibitor.release_now();
        self.engine.registry.remove_all();
        Ok(())
    }

    /// The screen saver service is (now) present: consume hotplug
    /// notifications and pick up every already-connected gamepad.
    fn arm(&mut self) {
        self.hotplug.start();
        match hotplug::enumerate() {
            Ok(paths) => {
                for path in paths {
                    self.track(path);
                }
                info!(
                    "enumeration complete; tracking {} device(s)",
                    self.engine.registry.len()
                );
            }
            Err(err) => warn!("device enumeration failed: {err}"),
        }
    }

    fn track(&mut self, path: PathBuf) {
        match hotplug::open_gamepad(&path) {
            Ok((device, label)) => {
                self.engine.handle(
                    Event::HotplugAdd {
                        identity: path,
                        resource: device,
                        label,
                    },
                    Instant::now(),
                );
            }
            Err(err) => warn!("skipping {}: {err:#}", path.display()),
        }
    }
}

fn register_signals() -> Result<UnixStream> {
    let (rx, tx) = UnixStream::pair()?;
    rx.set_nonblocking(true)?;
    signal_hook::low_level::pipe::register(SIGINT, tx.try_clone()?)?;
    signal_hook::low_level::pipe::register(SIGTERM, tx)?;
    Ok(rx)
}
