//! Service-manager readiness and watchdog notifications.
//!
//! Every method is a no-op when disabled or off Linux, so callers never need
//! `#[cfg]` conditionals.

#[derive(Debug, Clone, Copy)]
pub struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `READY=1`: the scheduler has started.
    pub fn notify_ready(&self) {
        self.send("READY", Message::Ready);
    }

    /// `STOPPING=1`: the scheduler is shutting down.
    pub fn notify_stopping(&self) {
        self.send("STOPPING", Message::Stopping);
    }

    /// `STATUS=<msg>`: human-readable outcome of the last cycle.
    pub fn notify_status(&self, msg: &str) {
        self.send("STATUS", Message::Status(msg));
    }

    /// `WATCHDOG=1`: keepalive, sent once per sync tick.
    pub fn notify_watchdog(&self) {
        self.send("WATCHDOG", Message::Watchdog);
    }

    #[cfg(target_os = "linux")]
    fn send(&self, name: &str, message: Message<'_>) {
        if !self.enabled {
            return;
        }
        let state = match message {
            Message::Ready => sd_notify::NotifyState::Ready,
            Message::Stopping => sd_notify::NotifyState::Stopping,
            Message::Status(msg) => sd_notify::NotifyState::Status(msg),
            Message::Watchdog => sd_notify::NotifyState::Watchdog,
        };
        if let Err(e) = sd_notify::notify(false, &[state]) {
            tracing::debug!(error = %e, "sd_notify {} failed", name);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn send(&self, _name: &str, _message: Message<'_>) {
        let _ = self.enabled;
    }
}

enum Message<'a> {
    Ready,
    Stopping,
    Status(&'a str),
    Watchdog,
}
