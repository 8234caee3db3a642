//! Admission control
//!
//! Every operation runs analyze-then-commit inside one critical section on
//! the table lock, so two concurrent requests can never both be admitted on
//! the strength of a table state that only one of them will see. Nothing is
//! written to the table or the kernel until every check has passed.
//!
//! Deletes are the exception: they release the lock while watchers shut
//! down. The threads involved stay marked in the table until the delete is
//! through, and every other request on them is turned away as busy.

use crate::analysis::{self, Unschedulable};
use crate::config::{CpuReserveConfig, WatchConfig};
use crate::error::{ReserveError, Result};
use crate::granularity::Granularity;
use crate::kernel::{KernelScheduler, PeriodicMode};
use crate::monitor::HistogramSummary;
use crate::reservation::{Reservation, ThreadId, PRIMARY_ID};
use crate::table::{ReservationEntry, ReservationTable, SharedTable};
use crate::watch::{Shutdown, WatchGrant, Watcher, WatcherState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Name suffix of delayed-preemption entries
const DP_SUFFIX: &str = ".dp";

/// Parameters of a new periodic reservation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRequest {
    pub thread: ThreadId,
    pub name: String,
    pub priority: u32,
    pub period_us: u64,
    pub wcet_us: u64,
    /// 0 for an optional reservation
    #[serde(default)]
    pub deadline_us: u64,
}

/// Fields of a reservation to change; `None` leaves a field as it is
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub priority: Option<u32>,
    pub wcet_us: Option<u64>,
    pub deadline_us: Option<u64>,
}

/// Result of a successful admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    /// Timeslice id assigned to the reservation
    pub id: u32,
    /// Budget actually reserved, rounded to granularity
    pub wcet_us: u64,
}

/// Result of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    /// Number of table entries removed
    pub removed: usize,
    /// False if the kernel failed to drop some reservation; the table
    /// entries are removed regardless
    pub kernel_consistent: bool,
}

/// One row of the reservation listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationInfo {
    pub name: String,
    pub thread: ThreadId,
    pub creator: ThreadId,
    pub id: u32,
    pub priority: u32,
    pub period_us: u64,
    pub wcet_us: u64,
    pub deadline_us: u64,
    pub delayed_preemption: bool,
    pub watcher: WatcherState,
    pub preempter: Option<ThreadId>,
    pub histogram: Option<HistogramSummary>,
}

/// CPU reservation admission controller
pub struct Controller {
    table: SharedTable,
    kernel: Arc<dyn KernelScheduler>,
    granularity: Granularity,
    control_id: ThreadId,
    watch_config: WatchConfig,
}

fn infeasible(r: &Reservation, err: Unschedulable) -> ReserveError {
    ReserveError::Infeasible(format!("{}/{} p={}: {}", r.thread, r.id, r.priority, err))
}

fn ensure_not_deleting(table: &ReservationTable, thread: ThreadId) -> Result<()> {
    if table.is_deleting(thread) {
        return Err(ReserveError::Busy(format!("{} is being deleted", thread)));
    }
    Ok(())
}

/// Re-run the analysis for every periodic entry with a deadline in `affected`
fn check_affected<'a>(
    snapshot: &[Reservation],
    affected: impl Iterator<Item = &'a Reservation>,
    pending: Option<&Reservation>,
) -> Result<()> {
    for e in affected.filter(|e| !e.is_dp() && e.has_deadline()) {
        let scan_from = analysis::insert_position(snapshot, e.priority);
        let time = analysis::response_time(snapshot, e, scan_from, pending);
        debug!(
            "  -> {}/{} p={} T={} C={} D={}: time={:?}",
            e.thread, e.id, e.priority, e.period_us, e.wcet_us, e.deadline_us, time
        );
        time.map_err(|err| infeasible(e, err))?;
    }
    Ok(())
}

impl Controller {
    /// Create a controller with an empty table
    ///
    /// `control_id` is the server's own identity; watchers treat a message
    /// from it as the shutdown signal.
    pub fn new(
        kernel: Arc<dyn KernelScheduler>,
        control_id: ThreadId,
        config: &CpuReserveConfig,
    ) -> Self {
        Self {
            table: Arc::new(Mutex::new(ReservationTable::new(
                config.table.max_reservations,
            ))),
            granularity: Granularity::new(kernel.clone()),
            kernel,
            control_id,
            watch_config: config.watch.clone(),
        }
    }

    /// Scheduler tick size, 0 if unknown
    pub fn granularity(&self) -> u64 {
        self.granularity.get()
    }

    /// Refuse reservations for the server's own task
    fn ensure_client_thread(&self, thread: ThreadId) -> Result<()> {
        if thread.same_task(&self.control_id) {
            return Err(ReserveError::Invalid(format!(
                "task {:x} is reserved for the server",
                thread.task
            )));
        }
        Ok(())
    }

    /// Admit a periodic reservation
    pub async fn add(&self, req: AddRequest, creator: ThreadId) -> Result<Admission> {
        debug!(
            "add {} {:?}: p={} T={} C={} D={}",
            req.thread, req.name, req.priority, req.period_us, req.wcet_us, req.deadline_us
        );

        self.ensure_client_thread(req.thread)?;
        let wcet_us = self.granularity.round_up(req.wcet_us);
        if req.period_us == 0 {
            return Err(ReserveError::Invalid(
                "periodic reservation needs a period".into(),
            ));
        }
        if req.deadline_us > req.period_us {
            return Err(ReserveError::Invalid(format!(
                "deadline {} exceeds period {}",
                req.deadline_us, req.period_us
            )));
        }

        let mut table = self.table.lock().await;
        ensure_not_deleting(&table, req.thread)?;
        if table.is_full() {
            return Err(ReserveError::OutOfCapacity {
                capacity: table.capacity(),
            });
        }

        // Further timeslices of a thread must share its period
        let mut id = PRIMARY_ID;
        for e in table.periodic_of(req.thread) {
            if e.params.period_us != req.period_us {
                return Err(ReserveError::Invalid(format!(
                    "{} already runs with period {}",
                    req.thread, e.params.period_us
                )));
            }
            id += 1;
        }

        let params = Reservation {
            thread: req.thread,
            id,
            priority: req.priority,
            period_us: req.period_us,
            wcet_us,
            deadline_us: req.deadline_us,
        };
        let snapshot = table.snapshot();
        let pos = analysis::insert_position(&snapshot, params.priority);

        if params.has_deadline() {
            let time = analysis::response_time(&snapshot, &params, pos, None)
                .map_err(|err| infeasible(&params, err))?;
            debug!("  reserved wcet: {}, response_time: {}", wcet_us, time);
        }

        // Everything at or below the new priority gets additional interference
        check_affected(
            &snapshot,
            snapshot.iter().take_while(|e| e.priority <= params.priority),
            Some(&params),
        )?;

        if let Err(e) = self.kernel.add_timeslice(req.thread, req.priority, wcet_us) {
            error!("add_timeslice({}, p={} C={}) failed: {}", req.thread, req.priority, wcet_us, e);
            return Err(e.into());
        }
        if id == PRIMARY_ID {
            debug!("  setting period at kernel to {}", req.period_us);
            if let Err(e) = self.kernel.set_period(req.thread, req.period_us) {
                warn!("set_period({}, {}) failed: {}", req.thread, req.period_us, e);
            }
        }

        table.insert_at(pos, ReservationEntry::new(params, req.name, creator));
        info!(
            "Admitted {}/{} p={} T={} C={} D={}",
            req.thread, id, req.priority, req.period_us, wcet_us, req.deadline_us
        );
        Ok(Admission { id, wcet_us })
    }

    /// Register a delayed-preemption section for timeslice `id` of `thread`
    ///
    /// The entry inherits the priority of the timeslice it extends (0 for
    /// the non-real-time timeslice `id == 0`) and is bookkeeping only: the
    /// kernel is not involved. Returns the reserved delay.
    pub async fn delayed_preempt(
        &self,
        thread: ThreadId,
        id: u32,
        delay_us: u64,
        creator: ThreadId,
    ) -> Result<u64> {
        debug!("delayed_preempt {}: id={} C={}", thread, id, delay_us);

        self.ensure_client_thread(thread)?;
        let delay_us = self.granularity.round_up(delay_us);
        let mut table = self.table.lock().await;
        ensure_not_deleting(&table, thread)?;
        if table.is_full() {
            return Err(ReserveError::OutOfCapacity {
                capacity: table.capacity(),
            });
        }

        let mut base = None;
        for e in table
            .iter()
            .filter(|e| e.params.thread == thread && e.params.id == id)
        {
            if e.params.is_dp() {
                return Err(ReserveError::Invalid(format!(
                    "{}/{} already has a delayed preemption",
                    thread, id
                )));
            }
            base = Some((e.params.priority, e.name.clone()));
        }
        if base.is_none() && id != 0 {
            return Err(ReserveError::Invalid(format!(
                "{}/{} has no reservation to extend",
                thread, id
            )));
        }
        let (priority, name) = base.unwrap_or_default();

        let params = Reservation {
            thread,
            id,
            priority,
            period_us: 0,
            wcet_us: delay_us,
            deadline_us: 0,
        };

        // A non-preemptible section can block anything above it
        let snapshot = table.snapshot();
        check_affected(&snapshot, snapshot.iter(), Some(&params))?;

        table.insert_sorted(ReservationEntry::new(params, name + DP_SUFFIX, creator));
        info!("Admitted delayed preemption {}/{} p={} C={}", thread, id, priority, delay_us);
        Ok(delay_us)
    }

    /// Change priority, WCET or deadline of a periodic reservation
    ///
    /// The new parameters are validated against a snapshot of the table
    /// without the old entry and only swapped in once the kernel accepted
    /// them.
    pub async fn change(&self, thread: ThreadId, id: u32, req: ChangeRequest) -> Result<Reservation> {
        debug!(
            "change {}/{}: p={:?} C={:?} D={:?}",
            thread, id, req.priority, req.wcet_us, req.deadline_us
        );

        let new_wcet = req.wcet_us.map(|w| self.granularity.round_up(w));
        let mut table = self.table.lock().await;
        let pos = table
            .position(thread, id)
            .ok_or_else(|| ReserveError::NotFound(format!("{}/{}", thread, id)))?;
        ensure_not_deleting(&table, thread)?;
        let old = table.snapshot()[pos];
        let mut working = old;

        // prio up   -> check all at or below the new prio (and local blocking)
        // prio down -> check local
        // wcet up   -> check local and all at or below
        // dl down   -> check local
        let mut check_local = false;
        let mut check_others = false;
        if let Some(priority) = req.priority {
            working.priority = priority;
            check_local = priority != old.priority;
            check_others = priority > old.priority;
        }
        if let Some(wcet_us) = new_wcet {
            working.wcet_us = wcet_us;
            if wcet_us > old.wcet_us {
                check_local = true;
                check_others = true;
            }
        }
        if let Some(deadline_us) = req.deadline_us {
            if deadline_us > working.period_us {
                return Err(ReserveError::Invalid(format!(
                    "deadline {} exceeds period {}",
                    deadline_us, working.period_us
                )));
            }
            working.deadline_us = deadline_us;
            if deadline_us != 0 && (old.deadline_us == 0 || deadline_us < old.deadline_us) {
                check_local = true;
            }
        }

        let mut others = table.snapshot();
        others.remove(pos);

        if check_local && working.has_deadline() {
            let scan_from = analysis::insert_position(&others, working.priority);
            let time = analysis::response_time(&others, &working, scan_from, None)
                .map_err(|err| infeasible(&working, err))?;
            debug!("  reserved wcet: {}, response_time: {}", working.wcet_us, time);
        }
        if check_others {
            check_affected(
                &others,
                others.iter().take_while(|e| e.priority <= working.priority),
                Some(&working),
            )?;
        }

        if let Err(e) = self
            .kernel
            .change_timeslice(thread, id, working.priority, working.wcet_us)
        {
            error!("change_timeslice({}/{}) failed: {}", thread, id, e);
            return Err(e.into());
        }

        if req.priority.is_some() {
            let mut entry = table.remove_at(pos);
            entry.params = working;
            table.insert_sorted(entry);
        } else if let Some(entry) = table.get_mut(pos) {
            entry.params = working;
        }

        info!(
            "Changed {}/{}: p={} C={} D={}",
            thread, id, working.priority, working.wcet_us, working.deadline_us
        );
        Ok(working)
    }

    /// Remove all reservations of a thread
    pub async fn delete_thread(&self, thread: ThreadId) -> Result<DeleteOutcome> {
        debug!("delete_thread {}", thread);
        self.delete_matching(|t| *t == thread, &thread.to_string()).await
    }

    /// Remove all reservations of every thread in `task`'s task
    pub async fn delete_task(&self, task: ThreadId) -> Result<DeleteOutcome> {
        debug!("delete_task {:x}", task.task);
        self.delete_matching(|t| t.same_task(&task), &format!("task {:x}", task.task))
            .await
    }

    /// Delete every entry whose thread `matches`
    ///
    /// The entries to remove are fixed under the first lock. The lock is
    /// then released until every watcher among them acknowledged, and only
    /// those entries are dropped afterwards. A delete overlapping one that
    /// is already running waits for it and then looks again.
    async fn delete_matching<F>(&self, matches: F, what: &str) -> Result<DeleteOutcome>
    where
        F: Fn(&ThreadId) -> bool,
    {
        let mut table = loop {
            let table = self.table.lock().await;
            let running: Vec<watch::Receiver<bool>> = table
                .iter()
                .filter(|e| matches(&e.params.thread))
                .filter_map(|e| table.deletion(e.params.thread))
                .collect();
            if running.is_empty() {
                break table;
            }
            drop(table);
            for mut done in running {
                let _ = done.wait_for(|finished| *finished).await;
            }
        };

        let mut threads: Vec<ThreadId> = table
            .iter()
            .map(|e| e.params.thread)
            .filter(|t| matches(t))
            .collect();
        if threads.is_empty() {
            return Err(ReserveError::NotFound(what.to_string()));
        }
        threads.sort();
        threads.dedup();

        let (done, _) = watch::channel(false);
        for thread in &threads {
            table.begin_deletion(*thread, done.subscribe());
        }

        let mut kernel_consistent = true;
        for thread in &threads {
            if let Err(e) = self.kernel.remove_all(*thread) {
                warn!("remove_all({}) failed, dropping bookkeeping anyway: {}", thread, e);
                kernel_consistent = false;
            }
        }

        let doomed: Vec<Reservation> = table
            .iter()
            .map(|e| e.params)
            .filter(|r| matches(&r.thread))
            .collect();

        let mut shutdowns: Vec<Shutdown> = Vec::new();
        for i in 0..table.len() {
            let Some(entry) = table.get_mut(i) else {
                continue;
            };
            if !matches(&entry.params.thread) {
                continue;
            }
            let thread = entry.params.thread;
            if let Some(watcher) = entry.watcher.as_mut() {
                shutdowns.push(watcher.begin_shutdown(thread, self.control_id));
            }
        }

        // The watchers may need the lock to drain pending notifications
        drop(table);
        for shutdown in shutdowns {
            shutdown.wait().await;
        }

        let mut table = self.table.lock().await;
        let removed = table.drain_matching(|e| doomed.iter().any(|d| d.same_slot(&e.params)));
        for thread in &threads {
            table.end_deletion(*thread);
        }
        drop(table);
        done.send_replace(true);

        for entry in &removed {
            info!("Removed {}/{} {:?}", entry.params.thread, entry.params.id, entry.name);
        }
        Ok(DeleteOutcome {
            removed: removed.len(),
            kernel_consistent,
        })
    }

    /// Start watching preemptions of `thread`'s primary reservation
    pub async fn watch(&self, thread: ThreadId, caller: ThreadId) -> Result<WatchGrant> {
        debug!("watch {} for {}", thread, caller);
        self.ensure_client_thread(thread)?;

        let mut table = self.table.lock().await;
        ensure_not_deleting(&table, thread)?;
        let entry = table
            .primary_mut(thread)
            .ok_or_else(|| ReserveError::NotFound(format!("{}/{}", thread, PRIMARY_ID)))?;
        if entry.watcher.is_some() {
            return Err(ReserveError::Busy(format!("{} is already watched", thread)));
        }

        let (watcher, grant) = Watcher::spawn(
            thread,
            &entry.name,
            self.control_id,
            self.kernel.clone(),
            Arc::downgrade(&self.table),
            &self.watch_config,
        )?;
        entry.watcher = Some(watcher);
        Ok(grant)
    }

    /// Counters of a watched reservation, trailing zero slots trimmed
    pub async fn watch_counters(&self, thread: ThreadId) -> Result<Vec<u32>> {
        let mut table = self.table.lock().await;
        let watcher = table
            .primary_mut(thread)
            .and_then(|e| e.watcher.as_ref())
            .ok_or_else(|| ReserveError::NotFound(format!("{} is not watched", thread)))?;
        let mut counters = watcher.buffer().snapshot();
        let used = counters.iter().rposition(|c| *c != 0).map_or(0, |i| i + 1);
        counters.truncate(used);
        Ok(counters)
    }

    /// Worst-case response time of a periodic reservation
    pub async fn time_demand(&self, thread: ThreadId, id: u32) -> Result<u64> {
        let table = self.table.lock().await;
        let pos = table
            .position(thread, id)
            .ok_or_else(|| ReserveError::NotFound(format!("{}/{}", thread, id)))?;
        let params = table.snapshot()[pos];
        match table.response_time_at(pos) {
            Some(Ok(time)) => Ok(time),
            Some(Err(err)) => Err(infeasible(&params, err)),
            None => Err(ReserveError::NotFound(format!("{}/{}", thread, id))),
        }
    }

    /// All reservations in table order
    pub async fn list(&self) -> Vec<ReservationInfo> {
        let table = self.table.lock().await;
        let mut infos = Vec::with_capacity(table.len());
        for e in table.iter() {
            let (watcher, preempter, histogram) = match &e.watcher {
                Some(w) => (w.state(), Some(w.preempter()), w.histogram().await),
                None => (WatcherState::Idle, None, None),
            };
            infos.push(ReservationInfo {
                name: e.name.clone(),
                thread: e.params.thread,
                creator: e.creator,
                id: e.params.id,
                priority: e.params.priority,
                period_us: e.params.period_us,
                wcet_us: e.params.wcet_us,
                deadline_us: e.params.deadline_us,
                delayed_preemption: e.params.is_dp(),
                watcher,
                preempter,
                histogram,
            });
        }
        infos
    }

    /// Number of reservations
    pub async fn count(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Start periodic execution of `thread` at absolute `clock`
    pub async fn begin_periodic(&self, thread: ThreadId, mode: PeriodicMode, clock: u64) -> Result<()> {
        debug!("begin_periodic {} {:?} at clock={}", thread, mode, clock);
        self.kernel.begin_periodic(thread, mode, clock).map_err(|e| {
            error!("begin_periodic({}) failed: {}", thread, e);
            ReserveError::from(e)
        })
    }

    /// Start releases exactly at period boundaries from `clock` on
    pub async fn begin_strictly_periodic(&self, thread: ThreadId, clock: u64) -> Result<()> {
        self.begin_periodic(thread, PeriodicMode::Strict, clock).await
    }

    /// Start releases at least one period apart from `clock` on
    pub async fn begin_minimal_periodic(&self, thread: ThreadId, clock: u64) -> Result<()> {
        self.begin_periodic(thread, PeriodicMode::Minimal, clock).await
    }

    /// Stop periodic execution of `thread`
    pub async fn end_periodic(&self, thread: ThreadId) -> Result<()> {
        debug!("end_periodic {}", thread);
        self.kernel
            .end_periodic(thread)
            .map_err(ReserveError::from)
    }

    /// Scheduling parameters in table order
    pub async fn snapshot(&self) -> Vec<Reservation> {
        self.table.lock().await.snapshot()
    }
}
