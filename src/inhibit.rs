use log::{info, warn};
use std::time::{Duration, Instant};
use zbus::proxy;

pub const APP_NAME: &str = "padwake";
pub const SAVER_NAME: &str = "org.freedesktop.ScreenSaver";

/// How long a single button release keeps the screen saver inhibited.
pub const INHIBIT_TIMEOUT: Duration = Duration::from_secs(600);
/// Expiry check granularity; the deadline is re-checked at least this often.
pub const CHECK_GRANULARITY: Duration = Duration::from_secs(60);

#[proxy(
    interface = "org.freedesktop.ScreenSaver",
    default_service = "org.freedesktop.ScreenSaver",
    default_path = "/org/freedesktop/ScreenSaver"
)]
trait ScreenSaver {
    fn inhibit(&self, application_name: &str, reason_for_inhibit: &str) -> zbus::Result<u32>;
    fn un_inhibit(&self, cookie: u32) -> zbus::Result<()>;
}

pub trait SaverClient {
    fn inhibit(&self, app_name: &str, reason: &str) -> zbus::Result<u32>;
    fn uninhibit(&self, cookie: u32) -> zbus::Result<()>;
}

pub struct DbusSaver {
    proxy: ScreenSaverProxyBlocking<'static>,
}

impl DbusSaver {
    pub fn new(conn: &zbus::blocking::Connection) -> zbus::Result<Self> {
        Ok(Self {
            proxy: ScreenSaverProxyBlocking::new(conn)?,
        })
    }
}

impl SaverClient for DbusSaver {
    fn inhibit(&self, app_name: &str, reason: &str) -> zbus::Result<u32> {
        self.proxy.inhibit(app_name, reason)
    }

    fn uninhibit(&self, cookie: u32) -> zbus::Result<()> {
        self.proxy.un_inhibit(cookie)
    }
}

enum State {
    Idle,
    Inhibiting { cookie: u32, deadline: Instant },
}

/// Owns the single inhibition cookie and the single countdown deadline.
/// The deadline exists iff a cookie is held.
pub struct Inhibitor<C> {
    client: C,
    timeout: Duration,
    state: State,
}

impl<C: SaverClient> Inhibitor<C> {
    pub fn new(client: C, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            state: State::Idle,
        }
    }

    pub fn is_inhibiting(&self) -> bool {
        matches!(self.state, State::Inhibiting { .. })
    }

    /// A qualifying button release on any tracked device.
    pub fn on_activity(&mut self, label: &str, now: Instant) {
        match &mut self.state {
            State::Inhibiting { deadline, .. } => {
                *deadline = now + self.timeout;
            }
            State::Idle => match self.client.inhibit(APP_NAME, label) {
                Ok(cookie) => {
                    info!("screen saver inhibited; cookie={cookie}");
                    self.state = State::Inhibiting {
                        cookie,
                        deadline: now + self.timeout,
                    };
                }
                // The next activity event retries.
                Err(err) => warn!("Inhibit request failed: {err}"),
            },
        }
    }

    /// Releases the inhibition if the deadline has passed.
    pub fn on_timer(&mut self, now: Instant) {
        if let State::Inhibiting { cookie, deadline } = self.state {
            if now >= deadline {
                self.release(cookie);
            }
        }
    }

    /// The service is gone; its cookie is presumptively invalid and is
    /// discarded without an UnInhibit request.
    pub fn on_saver_vanished(&mut self) {
        if let State::Inhibiting { cookie, .. } = self.state {
            info!("screen saver service vanished; dropping cookie {cookie}");
            self.state = State::Idle;
        }
    }

    /// Shutdown path: release a held inhibition immediately.
    pub fn release_now(&mut self) {
        if let State::Inhibiting { cookie, .. } = self.state {
            self.release(cookie);
        }
    }

    fn release(&mut self, cookie: u32) {
        // Cleared before the call so a failed UnInhibit cannot leave a stale
        // cookie behind.
        self.state = State::Idle;
        match self.client.uninhibit(cookie) {
            Ok(()) => info!("screen saver restored; cookie={cookie}"),
            Err(err) => warn!("UnInhibit request failed; dropping cookie {cookie}: {err}"),
        }
    }

    /// Time until the next expiry check; `None` while idle.
    pub fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        match self.state {
            State::Idle => None,
            State::Inhibiting { deadline, .. } => {
                Some(deadline.saturating_duration_since(now).min(CHECK_GRANULARITY))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::SaverClient;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Clone, Debug, PartialEq)]
    pub enum Call {
        Inhibit(String, String),
        Uninhibit(u32),
    }

    /// Records every request; failures are still recorded as attempts.
    #[derive(Clone)]
    pub struct MockSaver {
        calls: Rc<RefCell<Vec<Call>>>,
        pub fail_inhibit: Rc<Cell<bool>>,
        pub fail_uninhibit: Rc<Cell<bool>>,
        next_cookie: Rc<Cell<u32>>,
    }

    impl MockSaver {
        pub fn new() -> Self {
            Self {
                calls: Rc::new(RefCell::new(Vec::new())),
                fail_inhibit: Rc::new(Cell::new(false)),
                fail_uninhibit: Rc::new(Cell::new(false)),
                next_cookie: Rc::new(Cell::new(1)),
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }

        pub fn inhibit_count(&self) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|call| matches!(call, Call::Inhibit(..)))
                .count()
        }

        pub fn uninhibit_count(&self) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|call| matches!(call, Call::Uninhibit(..)))
                .count()
        }
    }

    impl SaverClient for MockSaver {
        fn inhibit(&self, app_name: &str, reason: &str) -> zbus::Result<u32> {
            self.calls
                .borrow_mut()
                .push(Call::Inhibit(app_name.into(), reason.into()));
            if self.fail_inhibit.get() {
                return Err(zbus::fdo::Error::Failed("inhibit refused".into()).into());
            }
            let cookie = self.next_cookie.get();
            self.next_cookie.set(cookie + 1);
            Ok(cookie)
        }

        fn uninhibit(&self, cookie: u32) -> zbus::Result<()> {
            self.calls.borrow_mut().push(Call::Uninhibit(cookie));
            if self.fail_uninhibit.get() {
                return Err(zbus::fdo::Error::Failed("uninhibit refused".into()).into());
            }
            Ok(())
        }
    }
}
