use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local counters rendered as a plain-text exposition.
#[derive(Debug, Default)]
pub struct Metrics {
    pub sessions_active: AtomicU64,
    pub sessions_created_total: AtomicU64,
    pub sessions_closed_total: AtomicU64,
    pub ws_clients_connected: AtomicU64,
    pub transcript_write_errors_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_created(&self) {
        self.sessions_created_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed_total.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in [
            ("opsdeck_sessions_active", &self.sessions_active),
            ("opsdeck_sessions_created_total", &self.sessions_created_total),
            ("opsdeck_sessions_closed_total", &self.sessions_closed_total),
            ("opsdeck_ws_clients_connected", &self.ws_clients_connected),
            (
                "opsdeck_transcript_write_errors_total",
                &self.transcript_write_errors_total,
            ),
        ] {
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.load(Ordering::Relaxed).to_string());
            out.push('\n');
        }
        out
    }
}
