use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters shared between the link task and anyone inspecting the link.
#[derive(Debug, Default)]
pub struct Diagnostics {
    connect_attempts: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    snapshots_accepted: AtomicU64,
    decode_failures: AtomicU64,
    commands_sent: AtomicU64,
    commands_rejected: AtomicU64,
    remote_restarts: AtomicU64,
    last_decode_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsReport {
    pub connect_attempts: u64,
    pub opens: u64,
    pub closes: u64,
    pub snapshots_accepted: u64,
    pub decode_failures: u64,
    pub commands_sent: u64,
    pub commands_rejected: u64,
    pub remote_restarts: u64,
    pub last_decode_error: Option<String>,
}

impl Diagnostics {
    pub fn connect_attempted(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn opened(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn closed(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_accepted(&self) {
        self.snapshots_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failed(&self, err: &impl std::fmt::Display) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .last_decode_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(err.to_string());
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remote_restarted(&self) {
        self.remote_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> DiagnosticsReport {
        DiagnosticsReport {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            snapshots_accepted: self.snapshots_accepted.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            remote_restarts: self.remote_restarts.load(Ordering::Relaxed),
            last_decode_error: self
                .last_decode_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}
