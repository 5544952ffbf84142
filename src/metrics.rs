use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Metrics {
    mints_started: Arc<AtomicU64>,
    mints_completed: Arc<AtomicU64>,
    spends_started: Arc<AtomicU64>,
    spends_completed: Arc<AtomicU64>,
    spends_rejected: Arc<AtomicU64>,
    mix_sessions_started: Arc<AtomicU64>,
    mix_sessions_completed: Arc<AtomicU64>,
    mix_sessions_timed_out: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_mints_started(&self) {
        self.mints_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mints_completed(&self) {
        self.mints_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_spends_started(&self) {
        self.spends_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_spends_completed(&self) {
        self.spends_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_spends_rejected(&self) {
        self.spends_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mix_sessions_started(&self) {
        self.mix_sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mix_sessions_completed(&self) {
        self.mix_sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mix_sessions_timed_out(&self) {
        self.mix_sessions_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) {
        tracing::info!(
            "Metrics: mints={}/{} spends={}/{} rejected={} mixes={}/{} timed_out={}",
            self.mints_completed.load(Ordering::Relaxed),
            self.mints_started.load(Ordering::Relaxed),
            self.spends_completed.load(Ordering::Relaxed),
            self.spends_started.load(Ordering::Relaxed),
            self.spends_rejected.load(Ordering::Relaxed),
            self.mix_sessions_completed.load(Ordering::Relaxed),
            self.mix_sessions_started.load(Ordering::Relaxed),
            self.mix_sessions_timed_out.load(Ordering::Relaxed),
        );
    }
}
