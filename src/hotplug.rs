use anyhow::{Context, Result};
use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::ffi::OsStr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub fn is_event_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("event"))
        .unwrap_or(false)
}

fn is_joystick(property: Option<&OsStr>) -> bool {
    property.map(|value| value == "1").unwrap_or(false)
}

/// A qualifying device is an event-interface node udev marks as a joystick.
fn qualifies(device: &udev::Device) -> bool {
    let Some(node) = device.devnode() else {
        return false;
    };
    if !is_event_node(node) {
        return false;
    }
    is_joystick(device.property_value("ID_INPUT_JOYSTICK"))
}

/// One full scan over the input subsystem for already-present gamepads.
pub fn enumerate() -> Result<Vec<PathBuf>> {
    let mut enumerator = udev::Enumerator::new().context("create udev enumerator")?;
    enumerator
        .match_subsystem("input")
        .context("match input subsystem")?;

    let mut paths = Vec::new();
    for device in enumerator.scan_devices().context("scan input devices")? {
        if !qualifies(&device) {
            continue;
        }
        if let Some(node) = device.devnode() {
            debug!("enumerated gamepad: {}", node.display());
            paths.push(node.to_path_buf());
        }
    }
    Ok(paths)
}

pub fn open_gamepad(path: &Path) -> Result<(evdev::Device, String)> {
    let device = evdev::Device::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let flags = fcntl(device.as_raw_fd(), FcntlArg::F_GETFL)
        .with_context(|| format!("failed to read fd flags for {}", path.display()))?;
    fcntl(
        device.as_raw_fd(),
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )
    .with_context(|| format!("failed to set non-blocking on {}", path.display()))?;
    let label = device
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|| "unknown gamepad".to_string());
    Ok((device, label))
}

/// Consumes udev add notifications for the input subsystem. Remove
/// notifications are ignored: removal is only ever detected on the read
/// path, after the device has genuinely stopped being serviceable.
pub struct HotplugWatcher {
    socket: Option<udev::MonitorSocket>,
    armed: bool,
}

impl HotplugWatcher {
    pub fn new() -> Self {
        let socket = match open_monitor() {
            Ok(socket) => Some(socket),
            Err(err) => {
                // Degraded mode: enumeration still works, live hotplug does not.
                warn!("udev monitor unavailable, no hotplug detection: {err}");
                None
            }
        };
        Self {
            socket,
            armed: false,
        }
    }

    pub fn start(&mut self) {
        if !self.armed {
            debug!("hotplug watch armed");
        }
        self.armed = true;
    }

    pub fn stop(&mut self) {
        if self.armed {
            debug!("hotplug watch disarmed");
        }
        self.armed = false;
    }

    pub fn fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.socket.as_ref().map(|socket| socket.as_raw_fd())
    }

    /// Empties the monitor socket; returns qualifying added devnodes.
    /// While disarmed the socket is still drained but nothing is reported.
    pub fn drain(&mut self) -> Vec<PathBuf> {
        let armed = self.armed;
        let Some(socket) = self.socket.as_ref() else {
            return Vec::new();
        };
        let mut added = Vec::new();
        for event in socket.iter() {
            if !armed || event.event_type() != udev::EventType::Add {
                continue;
            }
            let device = event.device();
            if !qualifies(&device) {
                continue;
            }
            if let Some(node) = device.devnode() {
                debug!("hotplug add: {}", node.display());
                added.push(node.to_path_buf());
            }
        }
        added
    }
}

fn open_monitor() -> Result<udev::MonitorSocket> {
    Ok(udev::MonitorBuilder::new()
        .context("create udev monitor")?
        .match_subsystem("input")
        .context("match input subsystem")?
        .listen()
        .context("listen on udev monitor")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_nodes_are_recognized() {
        assert!(is_event_node(Path::new("/dev/input/event3")));
        assert!(is_event_node(Path::new("/dev/input/event17")));
    }

    #[test]
    fn non_event_nodes_are_rejected() {
        assert!(!is_event_node(Path::new("/dev/input/js0")));
        assert!(!is_event_node(Path::new("/dev/input/mouse1")));
        assert!(!is_event_node(Path::new(
            "/dev/input/by-id/usb-pad-event-joystick"
        )));
        assert!(!is_event_node(Path::new("/dev/input")));
    }

    #[test]
    fn joystick_property_must_be_exactly_one() {
        assert!(is_joystick(Some(OsStr::new("1"))));
        assert!(!is_joystick(Some(OsStr::new("0"))));
        assert!(!is_joystick(Some(OsStr::new(""))));
        assert!(!is_joystick(Some(OsStr::new("yes"))));
        assert!(!is_joystick(None));
    }
}
