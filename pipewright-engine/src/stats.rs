//! Step statistics
//!
//! A small stand-in for the stats sampling collaborator: each step gets a
//! watcher that counts rows and records when the step's main loop started
//! and stopped. Workers receive a [`StatsHandle`], which is a no-op when no
//! stats manager is attached.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Per-step counters
#[derive(Debug)]
pub struct StepWatcher {
    name: String,
    rows: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    stopped_at: Mutex<Option<DateTime<Utc>>>,
}

impl StepWatcher {
    fn new(name: String) -> Self {
        Self {
            name,
            rows: AtomicU64::new(0),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) {
        if let Ok(mut started) = self.started_at.lock() {
            started.get_or_insert_with(Utc::now);
        }
    }

    pub fn stop(&self) {
        if let Ok(mut stopped) = self.stopped_at.lock() {
            *stopped = Some(Utc::now());
        }
    }

    pub fn add_rows(&self, rows: u64) {
        self.rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        let started = self.started_at.lock().map(|s| s.is_some()).unwrap_or(false);
        let stopped = self.stopped_at.lock().map(|s| s.is_some()).unwrap_or(false);
        started && !stopped
    }
}

/// Collects watchers for every step of a run
#[derive(Debug, Default)]
pub struct StatsManager {
    watchers: Mutex<BTreeMap<String, Arc<StepWatcher>>>,
    stopped: AtomicBool,
}

impl StatsManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the watcher for `name`, creating it on first use
    pub fn add_step_watcher(&self, name: &str) -> Arc<StepWatcher> {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            watchers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(StepWatcher::new(name.to_string()))),
        )
    }

    /// Stops sampling; watchers still running are marked stopped
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for watcher in watchers.values().filter(|w| w.is_running()) {
            watcher.stop();
        }
        debug!("Stats sampling stopped for {} step(s)", watchers.len());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Row counts per watched step
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, w)| (name.clone(), w.rows()))
            .collect()
    }
}

/// Nil-safe watcher handle given to workers
#[derive(Debug, Clone, Default)]
pub struct StatsHandle(Option<Arc<StepWatcher>>);

impl StatsHandle {
    pub fn new(watcher: Option<Arc<StepWatcher>>) -> Self {
        Self(watcher)
    }

    /// A handle that records nothing
    pub fn disabled() -> Self {
        Self(None)
    }

    pub fn start(&self) {
        if let Some(w) = &self.0 {
            w.start();
        }
    }

    pub fn stop(&self) {
        if let Some(w) = &self.0 {
            w.stop();
        }
    }

    pub fn add_rows(&self, rows: u64) {
        if let Some(w) = &self.0 {
            w.add_rows(rows);
        }
    }
}
