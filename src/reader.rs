use evdev::{Device, InputEvent, InputEventKind};
use log::warn;
use nix::errno::Errno;
use std::io;

pub enum Drained {
    /// Events were read (possibly zero); `releases` counts qualifying
    /// button-release events in the batch.
    Events { total: u64, releases: u32 },
    /// The underlying device node no longer exists.
    Gone,
}

/// A press-and-hold produces a single release once finished, so the release
/// edge (value 0), not the press, is the activity signal. Autorepeat (2) and
/// press (1) do not count.
pub fn is_button_release(event: &InputEvent) -> bool {
    matches!(event.kind(), InputEventKind::Key(_)) && event.value() == 0
}

/// Reads whatever is pending on a device signaled as readable.
pub fn drain(device: &mut Device) -> Drained {
    match device.fetch_events() {
        Ok(events) => {
            let mut total = 0u64;
            let mut releases = 0u32;
            for event in events {
                total += 1;
                if is_button_release(&event) {
                    releases += 1;
                }
            }
            Drained::Events { total, releases }
        }
        Err(err) if err.raw_os_error() == Some(Errno::ENODEV as i32) => Drained::Gone,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Drained::Events {
            total: 0,
            releases: 0,
        },
        Err(err) => {
            // Non-fatal; the next readiness notification retries.
            warn!("device read failed: {err}");
            Drained::Events {
                total: 0,
                releases: 0,
            }
        }
    }
}
