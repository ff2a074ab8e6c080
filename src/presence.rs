use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use zbus::blocking::fdo::DBusProxy;
use zbus::blocking::Connection;
use zbus::fdo::NameOwnerChanged;
use zbus::names::BusName;

use crate::inhibit::SAVER_NAME;

/// Watches ownership of the screen saver's well-known name. A background
/// thread consumes the NameOwnerChanged stream and forwards one byte per
/// transition through a pipe, so the main poll loop stays the single owner
/// of all state.
pub struct PresenceWatcher {
    rx: UnixStream,
}

impl PresenceWatcher {
    /// Returns the watcher plus whether the name currently has an owner.
    /// The signal subscription is created before the ownership query so a
    /// transition between the two cannot be missed.
    pub fn spawn(conn: &Connection) -> Result<(Self, bool)> {
        let dbus = DBusProxy::new(conn).context("create org.freedesktop.DBus proxy")?;
        let signals = dbus
            .receive_name_owner_changed()
            .context("subscribe to NameOwnerChanged")?;

        let name = BusName::try_from(SAVER_NAME).context("parse screen saver bus name")?;
        let present = dbus
            .name_has_owner(name)
            .context("NameHasOwner query failed")?;

        let (rx, tx) = UnixStream::pair().context("create presence pipe")?;
        rx.set_nonblocking(true)
            .context("set presence pipe non-blocking")?;
        thread::spawn(move || forward(signals, tx));

        Ok((Self { rx }, present))
    }

    pub fn stream(&self) -> &UnixStream {
        &self.rx
    }

    /// Pending transitions in arrival order; `true` means appeared.
    /// `Err` means the watcher thread is gone and ownership changes can no
    /// longer be observed.
    pub fn drain(&mut self) -> Result<Vec<bool>> {
        let mut transitions = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            match self.rx.read(&mut buf) {
                Ok(0) => {
                    // EOF: the forwarder thread exited and closed its end.
                    // Deliver what was read first; the next drain reports
                    // the death (the pipe stays readable).
                    if transitions.is_empty() {
                        bail!("presence watcher thread terminated");
                    }
                    break;
                }
                Ok(n) => transitions.extend(buf[..n].iter().map(|byte| *byte == b'1')),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("presence pipe read failed: {err}");
                    break;
                }
            }
        }
        Ok(transitions)
    }
}

fn forward<I>(signals: I, mut tx: UnixStream)
where
    I: IntoIterator<Item = NameOwnerChanged>,
{
    for signal in signals {
        let args = match signal.args() {
            Ok(args) => args,
            Err(err) => {
                warn!("malformed NameOwnerChanged signal: {err}");
                continue;
            }
        };
        if args.name().as_str() != SAVER_NAME {
            continue;
        }
        let present = args.new_owner().is_some();
        debug!(
            "{SAVER_NAME} {}",
            if present { "appeared" } else { "disappeared" }
        );
        let byte = if present { b'1' } else { b'0' };
        if tx.write_all(&[byte]).is_err() {
            // Main loop is gone; nothing left to notify.
            return;
        }
    }
}
