use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::models::SyncStatus;

pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_secs(2);

/// Observable idle/syncing/synced/error indicator. Purely for the UI; it
/// gates nothing in the rest of the engine.
///
/// `synced` decays to `idle` after `idle_delay` via a timer thread. The
/// timer is cancelled only by `teardown`: a refresh racing the window can be
/// flipped back to `idle` when the timer fires, which is the UI contract.
/// `error` is left only by the next refresh.
#[derive(Clone)]
pub struct SyncStatusMachine {
    status: Arc<RwLock<SyncStatus>>,
    history: Arc<Mutex<Vec<SyncStatus>>>,
    timers: Arc<Mutex<Vec<(Sender<()>, JoinHandle<()>)>>>,
    idle_delay: Duration,
}

impl std::fmt::Debug for SyncStatusMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStatusMachine")
            .field("status", &self.current())
            .finish_non_exhaustive()
    }
}

impl SyncStatusMachine {
    #[must_use]
    pub fn new(status: Arc<RwLock<SyncStatus>>, idle_delay: Duration) -> Self {
        let initial = status.read().map(|s| *s).unwrap_or(SyncStatus::Idle);
        Self {
            status,
            history: Arc::new(Mutex::new(vec![initial])),
            timers: Arc::new(Mutex::new(Vec::new())),
            idle_delay,
        }
    }

    #[must_use]
    pub fn current(&self) -> SyncStatus {
        self.status.read().map(|s| *s).unwrap_or(SyncStatus::Idle)
    }

    /// Every state observed since construction, in order.
    #[must_use]
    pub fn history(&self) -> Vec<SyncStatus> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub(crate) fn begin_sync(&self) {
        self.set(SyncStatus::Syncing);
    }

    pub(crate) fn fail(&self) {
        self.set(SyncStatus::Error);
    }

    /// All fetches resolved: `synced` now, `idle` after the delay window.
    pub(crate) fn complete(&self) {
        self.set(SyncStatus::Synced);

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let status = Arc::clone(&self.status);
        let history = Arc::clone(&self.history);
        let delay = self.idle_delay;

        let handle = thread::spawn(move || {
            if cancel_rx.recv_timeout(delay) == Err(mpsc::RecvTimeoutError::Timeout) {
                if let Ok(mut guard) = status.write() {
                    *guard = SyncStatus::Idle;
                }
                if let Ok(mut entries) = history.lock() {
                    entries.push(SyncStatus::Idle);
                }
            }
        });

        if let Ok(mut timers) = self.timers.lock() {
            timers.push((cancel_tx, handle));
        }
    }

    /// Cancels any outstanding idle timers and waits for them.
    pub fn teardown(&self) {
        let drained: Vec<(Sender<()>, JoinHandle<()>)> = match self.timers.lock() {
            Ok(mut timers) => timers.drain(..).collect(),
            Err(_) => return,
        };
        for (cancel, handle) in drained {
            let _ = cancel.send(());
            let _ = handle.join();
        }
    }

    fn set(&self, next: SyncStatus) {
        if let Ok(mut guard) = self.status.write() {
            *guard = next;
        }
        if let Ok(mut entries) = self.history.lock() {
            entries.push(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn machine(delay_ms: u64) -> SyncStatusMachine {
        SyncStatusMachine::new(
            Arc::new(RwLock::new(SyncStatus::Idle)),
            Duration::from_millis(delay_ms),
        )
    }

    fn wait_for_idle(machine: &SyncStatusMachine) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while machine.current() != SyncStatus::Idle {
            assert!(Instant::now() < deadline, "never returned to idle");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn successful_refresh_walks_idle_syncing_synced_idle() {
        let machine = machine(20);
        machine.begin_sync();
        assert_eq!(machine.current(), SyncStatus::Syncing);
        machine.complete();
        assert_eq!(machine.current(), SyncStatus::Synced);

        wait_for_idle(&machine);
        assert_eq!(
            machine.history(),
            vec![
                SyncStatus::Idle,
                SyncStatus::Syncing,
                SyncStatus::Synced,
                SyncStatus::Idle,
            ]
        );
        machine.teardown();
    }

    #[test]
    fn error_state_persists_until_next_refresh() {
        let machine = machine(10);
        machine.begin_sync();
        machine.fail();
        assert_eq!(machine.current(), SyncStatus::Error);

        thread::sleep(Duration::from_millis(40));
        assert_eq!(machine.current(), SyncStatus::Error);

        machine.begin_sync();
        assert_eq!(machine.current(), SyncStatus::Syncing);
        machine.teardown();
    }

    #[test]
    fn teardown_cancels_the_idle_timer() {
        let machine = machine(5_000);
        machine.begin_sync();
        machine.complete();
        machine.teardown();
        assert_eq!(machine.current(), SyncStatus::Synced);
    }
}
