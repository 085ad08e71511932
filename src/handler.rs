//! The middleware handler: per-key supervisor registry and the two entry
//! points the reverse-proxy engine calls around every request.
//!
//! `select_upstream` runs before dispatch and guarantees a ready backend;
//! `begin_request` wraps dispatch with in-flight accounting so idle
//! backends are reclaimed. One handler instance supervises one route
//! block; hosts provision one per block.

use crate::config::HandlerConfig;
use crate::error::Error;
use crate::expand::Expander;
use crate::process::{self, Slot};
use crate::upstream::{self, Upstream};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// On-demand backend launcher middleware.
///
/// For each distinct request key the handler supervises one child
/// process: it spawns the child on the first request, gates dispatch on
/// readiness, respawns after crashes, and terminates the child after a
/// bounded idle period. Slots are created on first use and kept for the
/// life of the handler, so memory is bounded by the number of distinct
/// detector outputs.
pub struct ReverseBin {
    config: HandlerConfig,
    slots: DashMap<String, Arc<Slot>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Snapshot of one slot, for status surfaces and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    /// Pid of the live child, if any
    pub pid: Option<i32>,
    /// In-flight requests routed through the slot
    pub active: u64,
}

impl ReverseBin {
    /// Validate the configuration and create a handler.
    ///
    /// Returns `Arc<Self>` because the handler is shared across the
    /// engine's per-request tasks.
    pub fn new(mut config: HandlerConfig) -> Result<Arc<Self>, Error> {
        config.provision()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            slots: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// The supervisor key for a request: empty in static mode, otherwise
    /// the expanded detector command line joined by single spaces.
    pub fn request_key(&self, expander: &dyn Expander) -> String {
        if self.config.detector.is_empty() {
            return String::new();
        }
        self.config
            .detector
            .iter()
            .map(|arg| expander.expand(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Upstream-selection entry point, called by the engine before every
    /// dispatch. Ensures a live, ready backend exists for the request's
    /// key and returns the address to dial: `host:port` or `unix/<path>`.
    pub async fn select_upstream(&self, expander: &dyn Expander) -> Result<String, Error> {
        let key = self.request_key(expander);
        debug!(key = %key, "selecting upstream");
        let slot = self.slot(&key);
        let mut state = slot.state.lock().await;

        // The exit watcher is authoritative but asynchronous; this guards
        // the window where it has not run yet.
        let dead_pid = match &state.child {
            Some(child) if !process::process_alive(child.pid) => Some(child.pid),
            _ => None,
        };
        if let Some(pid) = dead_pid {
            warn!(pid, "recorded backend is not alive, discarding it");
            if let Some(dead) = state.child.take() {
                if let Ok(Upstream::Unix { path }) = Upstream::classify(&dead.params.upstream) {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        let recorded = state.child.as_ref().map(|child| child.params.clone());
        let params = match recorded {
            Some(params) => params,
            None => {
                process::start_backend(
                    &self.config,
                    &slot,
                    &mut state,
                    &key,
                    self.shutdown_rx.clone(),
                )
                .await?
            }
        };

        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }

        let target = Upstream::classify(&params.upstream)?;
        if let Upstream::Unix { path } = &target {
            // Catches a crash-and-respawn between the liveness check above
            // and this dispatch.
            if !upstream::socket_ready(path) {
                return Err(Error::SocketNotReady(path.clone()));
            }
        }

        Ok(target.dial_addr())
    }

    /// Accounting entry point, called around dispatch. Increments the
    /// slot's in-flight count; the returned guard decrements it when
    /// dropped and arms the idle timer once the count reaches zero.
    pub async fn begin_request(&self, expander: &dyn Expander) -> RequestGuard {
        let key = self.request_key(expander);
        let slot = self.slot(&key);
        {
            let mut state = slot.state.lock().await;
            state.active += 1;
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
        }
        RequestGuard {
            slot,
            idle_timeout: self.config.idle_timeout(),
        }
    }

    /// Snapshot a slot by key. Returns `None` for keys that never served
    /// a request.
    pub async fn slot_status(&self, key: &str) -> Option<SlotStatus> {
        let slot = self.slots.get(key).map(|entry| Arc::clone(entry.value()))?;
        let state = slot.state.lock().await;
        Some(SlotStatus {
            pid: state.child.as_ref().map(|c| c.pid),
            active: state.active,
        })
    }

    /// Tear down every slot: stop idle timers and terminate live process
    /// groups. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let slots: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for slot in slots {
            let mut state = slot.state.lock().await;
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
            if state.child.is_some() {
                state.termination_reason = Some("shutting down".to_string());
            }
            if let Some(child) = &state.child {
                info!(pid = child.pid, "terminating backend on shutdown");
                child.terminate();
            }
        }
    }

    /// Get or create the slot for a key. The registry is only locked for
    /// the lookup, never across I/O.
    fn slot(&self, key: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        let entry = self
            .slots
            .entry(key.to_string())
            .or_insert_with(Slot::new);
        Arc::clone(entry.value())
    }
}

/// In-flight request marker returned by [`ReverseBin::begin_request`].
///
/// Dropping the guard finishes the request: the count is decremented and,
/// at zero, the idle timer is armed. Must be dropped inside the runtime.
pub struct RequestGuard {
    slot: Arc<Slot>,
    idle_timeout: Duration,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let slot = Arc::clone(&self.slot);
        tokio::spawn(slot.finish_request(self.idle_timeout));
    }
}
