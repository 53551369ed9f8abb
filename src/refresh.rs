use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub type RefreshFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type RefreshTask = Arc<dyn Fn() -> RefreshFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Ran { runs: u64 },
    Coalesced,
}

struct GateState {
    in_flight: AtomicBool,
    dirty: AtomicBool,
    completed: AtomicU64,
    task: RefreshTask,
}

// Requests that arrive mid-run are dropped. Only a data change reported
// during the run earns one follow-up.
#[derive(Clone)]
pub struct RefreshGate {
    state: Arc<GateState>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RefreshGate {
    pub fn new(task: RefreshTask) -> Self {
        Self {
            state: Arc::new(GateState {
                in_flight: AtomicBool::new(false),
                dirty: AtomicBool::new(false),
                completed: AtomicU64::new(0),
                task,
            }),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.in_flight.load(Ordering::Acquire)
    }

    pub fn completed_runs(&self) -> u64 {
        self.state.completed.load(Ordering::Acquire)
    }

    pub fn mark_changed(&self) {
        if self.is_in_flight() {
            self.state.dirty.store(true, Ordering::Release);
        }
    }

    pub async fn request(&self) -> RefreshOutcome {
        if !self.try_begin() {
            tracing::debug!("refresh already in flight; request ignored");
            return RefreshOutcome::Coalesced;
        }

        let mut runs = 0;
        loop {
            {
                let _in_flight = InFlight(&self.state.in_flight);
                self.state.dirty.store(false, Ordering::Release);
                loop {
                    (self.state.task)().await;
                    runs += 1;
                    self.state.completed.fetch_add(1, Ordering::AcqRel);
                    if !self.state.dirty.swap(false, Ordering::AcqRel) {
                        break;
                    }
                }
            }
            // A change may have landed between the last check and release.
            if !self.state.dirty.load(Ordering::Acquire) || !self.try_begin() {
                break;
            }
        }
        RefreshOutcome::Ran { runs }
    }

    fn try_begin(&self) -> bool {
        self.state
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug)]
pub struct PeriodicRefresh {
    task: JoinHandle<()>,
}

impl PeriodicRefresh {
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PeriodicRefresh {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn spawn_periodic(gate: RefreshGate, period: Duration) -> PeriodicRefresh {
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let outcome = gate.request().await;
            tracing::debug!(?outcome, "periodic refresh tick");
        }
    });
    PeriodicRefresh { task }
}
