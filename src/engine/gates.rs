//! The snapshot and level compaction gates (spec.md §4.1, §9).
//!
//! A reference-counted disable gate: a counter plus a stop signal, with no raw channel exposed
//! outside this module. A single `Mutex` around each gate's state does double duty as the "wait
//! for a prior disable to finish" rule: a second disabler blocks on the same lock and, by the
//! time it acquires it, any in-flight teardown already completed.

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

/// Single-flight gate for the snapshot-compaction loop.
#[derive(Default)]
pub struct SnapshotGate {
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SnapshotGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().stop_tx.is_some()
    }

    /// No-ops if already enabled.
    pub fn enable(&self, spawn: impl FnOnce(Receiver<()>) -> JoinHandle<()>) {
        let mut state = self.state.lock();
        if state.stop_tx.is_some() {
            return;
        }
        let (tx, rx) = bounded(0);
        state.handle = Some(spawn(rx));
        state.stop_tx = Some(tx);
        tracing::debug!("snapshot gate enabled");
    }

    /// No-ops if already disabled.
    pub fn disable(&self) {
        let mut state = self.state.lock();
        let Some(tx) = state.stop_tx.take() else { return };
        drop(tx);
        if let Some(handle) = state.handle.take() {
            let _ = handle.join();
        }
        tracing::debug!("snapshot gate disabled");
    }
}

/// Reference-counted gate for the level-compaction loop (spec.md §4.1).
#[derive(Default)]
pub struct LevelGate {
    state: Mutex<LevelGateState>,
}

#[derive(Default)]
struct LevelGateState {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    level_workers: i32,
}

impl LevelGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().stop_tx.is_some()
    }

    /// `wait = true` holds compactions off until a matching [`LevelGate::enable`] call, even if
    /// other callers also disable concurrently (used by `DeleteSeriesRange`, spec.md §4.1).
    pub fn disable(&self, wait: bool) {
        let mut state = self.state.lock();
        let old = state.level_workers;
        if wait {
            state.level_workers += 1;
        }
        if old == 0 {
            if let Some(tx) = state.stop_tx.take() {
                drop(tx);
                if let Some(handle) = state.handle.take() {
                    let _ = handle.join();
                }
            }
            tracing::debug!(level_workers = state.level_workers, "level gate disabled");
        }
    }

    pub fn enable(&self, wait: bool, spawn: impl FnOnce(Receiver<()>) -> JoinHandle<()>) {
        let mut state = self.state.lock();
        if wait {
            state.level_workers -= 1;
        }
        if state.level_workers != 0 || state.stop_tx.is_some() {
            return;
        }
        let (tx, rx) = bounded(0);
        state.handle = Some(spawn(rx));
        state.stop_tx = Some(tx);
        tracing::debug!("level gate enabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn snapshot_gate_enable_disable_round_trip() {
        let gate = SnapshotGate::new();
        let running = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&running);
        gate.enable(move |rx| {
            r.store(true, Ordering::SeqCst);
            std::thread::spawn(move || {
                let _ = rx.recv();
            })
        });
        assert!(gate.is_enabled());
        assert!(running.load(Ordering::SeqCst));
        gate.disable();
        assert!(!gate.is_enabled());
        gate.disable();
        assert!(!gate.is_enabled());
    }

    #[test]
    fn level_gate_wait_holds_off_reenable_until_matched() {
        let gate = LevelGate::new();
        gate.enable(false, |rx| std::thread::spawn(move || { let _ = rx.recv(); }));
        assert!(gate.is_enabled());

        gate.disable(true);
        assert!(!gate.is_enabled());

        gate.enable(true, |rx| std::thread::spawn(move || { let _ = rx.recv(); }));
        assert!(gate.is_enabled(), "enable(wait=true) balancing the only outstanding disable(wait=true) restarts the loop");
        gate.disable(false);
    }
}
