//! Preemption watcher
//!
//! A watcher is a background task registered at the kernel as the preempter
//! of one thread. It counts timeslice overruns into a counter buffer shared
//! with the client and, with monitoring enabled, feeds the CPU time consumed
//! between period ends into a histogram.
//!
//! Teardown is a rendezvous: the server sends a wake-up from its control
//! identity, the worker acknowledges and stops. The table lock must not be
//! held while waiting, as the worker takes it for counter lookups.

use crate::config::WatchConfig;
use crate::error::{ReserveError, Result};
use crate::kernel::{
    KernelScheduler, Notification, NotificationKind, PreemptionReceiver, PreemptionSender,
};
use crate::monitor::{DeadlineHistogram, DeadlineMonitor, HistogramSummary};
use crate::reservation::ThreadId;
use crate::table::ReservationTable;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Number of counter slots, one 4 KiB page of `u32`
pub const WATCH_SLOTS: usize = 1024;

/// Counter buffer shared with the watching client
///
/// Slot `i` counts overruns of timeslice id `i`. The worker only ever
/// increments; resetting is up to the client.
#[derive(Debug)]
pub struct WatchBuffer {
    counters: Box<[AtomicU32]>,
}

impl WatchBuffer {
    pub fn new() -> Self {
        Self {
            counters: (0..WATCH_SLOTS).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Increment slot `id`; out-of-range ids are ignored
    pub fn increment(&self, id: u32) -> bool {
        match self.counters.get(id as usize) {
            Some(slot) => {
                slot.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: u32) -> u32 {
        self.counters
            .get(id as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        for c in self.counters.iter() {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// Copy of all counters
    pub fn snapshot(&self) -> Vec<u32> {
        self.counters.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }
}

impl Default for WatchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Watcher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    /// Not watched
    Idle,
    /// Resources allocated, worker not yet listening
    Armed,
    /// Worker waiting for notifications
    Running,
    /// Shutdown received, acknowledging
    ShuttingDown,
    /// Worker gone
    Stopped,
}

/// What the client gets back from `watch`
#[derive(Debug, Clone)]
pub struct WatchGrant {
    /// Shared counter buffer
    pub buffer: Arc<WatchBuffer>,
    /// Identity registered at the kernel as the thread's preempter
    pub preempter: ThreadId,
}

/// Watcher handle owned by the watched table entry
pub struct Watcher {
    buffer: Arc<WatchBuffer>,
    preempter: ThreadId,
    control: PreemptionSender,
    state: watch::Receiver<WatcherState>,
    monitor: Option<Arc<Mutex<DeadlineMonitor>>>,
    done: Option<oneshot::Receiver<()>>,
    task: Option<JoinHandle<()>>,
}

/// Pending shutdown, awaited without the table lock
pub struct Shutdown {
    thread: ThreadId,
    done: Option<oneshot::Receiver<()>>,
    task: Option<JoinHandle<()>>,
    state: watch::Receiver<WatcherState>,
}

impl Shutdown {
    /// Block until the worker acknowledged and exited
    pub async fn wait(mut self) {
        if let Some(done) = self.done.take() {
            if done.await.is_err() {
                warn!("Watcher for {} stopped without acknowledging", self.thread);
            }
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Watcher for {} failed: {}", self.thread, e);
            }
        }
        // Without the handles, the worker's own state says when it is gone
        let stopped = self
            .state
            .wait_for(|s| *s == WatcherState::Stopped)
            .await
            .is_ok();
        if !stopped {
            warn!("Watcher for {} vanished before stopping", self.thread);
        }
        debug!("Watcher for {} shut down", self.thread);
    }
}

impl Watcher {
    /// Allocate the buffer, register at the kernel and start the worker
    pub fn spawn(
        thread: ThreadId,
        name: &str,
        control_id: ThreadId,
        kernel: Arc<dyn KernelScheduler>,
        table: Weak<Mutex<ReservationTable>>,
        config: &WatchConfig,
    ) -> Result<(Watcher, WatchGrant)> {
        let buffer = Arc::new(WatchBuffer::new());

        let monitor = if config.monitor {
            let histogram = DeadlineHistogram::new(name, &config.histogram)?;
            Some(Arc::new(Mutex::new(DeadlineMonitor::new(histogram))))
        } else {
            None
        };

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let preempter = kernel
            .register_preempter(thread, inbox_tx.clone())
            .map_err(ReserveError::from)?;

        let (state_tx, state_rx) = watch::channel(WatcherState::Armed);
        let (done_tx, done_rx) = oneshot::channel();

        let worker = Worker {
            thread,
            control_id,
            kernel,
            table,
            buffer: buffer.clone(),
            monitor: monitor.clone(),
            state: state_tx,
            verbose: config.verbose,
        };
        let task = tokio::spawn(worker.run(inbox_rx, done_tx));

        info!("Watching {} (preempter {})", thread, preempter);

        let watcher = Watcher {
            buffer: buffer.clone(),
            preempter,
            control: inbox_tx,
            state: state_rx,
            monitor,
            done: Some(done_rx),
            task: Some(task),
        };
        Ok((watcher, WatchGrant { buffer, preempter }))
    }

    pub fn buffer(&self) -> &Arc<WatchBuffer> {
        &self.buffer
    }

    pub fn preempter(&self) -> ThreadId {
        self.preempter
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Histogram summary, if monitoring is enabled
    pub async fn histogram(&self) -> Option<HistogramSummary> {
        match &self.monitor {
            Some(monitor) => Some(monitor.lock().await.histogram().summary()),
            None => None,
        }
    }

    /// Signal the worker to stop
    ///
    /// Sends the wake-up from `control_id` and hands back the rendezvous,
    /// which the caller awaits after releasing the table lock. Only the
    /// first call signals; later ones wait for the worker to stop all the
    /// same.
    pub fn begin_shutdown(&mut self, thread: ThreadId, control_id: ThreadId) -> Shutdown {
        let done = self.done.take();
        let task = self.task.take();
        if done.is_some() || task.is_some() {
            let wake = Notification {
                from: control_id,
                kind: NotificationKind::Wakeup,
            };
            if self.control.send(wake).is_err() {
                warn!("Watcher for {} already gone", thread);
            }
        }
        Shutdown {
            thread,
            done,
            task,
            state: self.state.clone(),
        }
    }
}

/// State moved into the worker task
struct Worker {
    thread: ThreadId,
    control_id: ThreadId,
    kernel: Arc<dyn KernelScheduler>,
    table: Weak<Mutex<ReservationTable>>,
    buffer: Arc<WatchBuffer>,
    monitor: Option<Arc<Mutex<DeadlineMonitor>>>,
    state: watch::Sender<WatcherState>,
    verbose: bool,
}

impl Worker {
    async fn run(self, mut inbox: PreemptionReceiver, done: oneshot::Sender<()>) {
        self.state.send_replace(WatcherState::Running);

        while let Some(msg) = inbox.recv().await {
            if msg.from == self.control_id {
                self.state.send_replace(WatcherState::ShuttingDown);
                let _ = done.send(());
                break;
            }

            match msg.kind {
                NotificationKind::TimeslicePreempted { id } => self.count_overrun(id).await,
                NotificationKind::DeadlinePreempted => self.period_end().await,
                NotificationKind::Wakeup => {
                    trace!("Watcher {}: stray wake-up from {}", self.thread, msg.from);
                }
            }
        }

        self.state.send_replace(WatcherState::Stopped);
    }

    async fn count_overrun(&self, id: u32) {
        if self.verbose {
            info!("{}: timeslice {} preempted", self.thread, id);
        } else {
            trace!("{}: timeslice {} preempted", self.thread, id);
        }

        // The entry may already be on its way out during teardown
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.lock().await;
        let Some(entry) = table.primary_mut(self.thread) else {
            return;
        };
        if let Some(watcher) = &entry.watcher {
            if Arc::ptr_eq(&watcher.buffer, &self.buffer) {
                watcher.buffer.increment(id);
            }
        }
    }

    async fn period_end(&self) {
        if self.verbose {
            info!("{}: deadline preemption", self.thread);
        } else {
            trace!("{}: deadline preemption", self.thread);
        }

        let Some(monitor) = &self.monitor else {
            return;
        };
        // Sampling may block in the kernel
        let kernel = self.kernel.clone();
        let thread = self.thread;
        match tokio::task::spawn_blocking(move || kernel.sample_consumed_time(thread)).await {
            Ok(Ok(sample)) => monitor.lock().await.record(sample.consumed_us),
            Ok(Err(e)) => debug!("{}: consumed time unavailable: {}", self.thread, e),
            Err(e) => warn!("{}: consumed time sampling failed: {}", self.thread, e),
        }
    }
}
