//! In-memory kernel scheduler
//!
//! Keeps per-thread timeslice bookkeeping the way the real scheduler would
//! and lets callers inject failures and preemption notifications. The host
//! daemon runs against it; tests use it to observe what was committed.

use super::{
    ConsumedTime, KernelResult, KernelScheduler, Notification, NotificationKind, PeriodicMode,
    PreemptionSender,
};
use crate::error::KernelError;
use crate::reservation::ThreadId;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Kernel operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelOp {
    AddTimeslice,
    SetPeriod,
    ChangeTimeslice,
    RemoveAll,
    BeginPeriodic,
    EndPeriodic,
    RegisterPreempter,
    SampleConsumedTime,
    Granularity,
}

impl KernelOp {
    fn name(&self) -> &'static str {
        match self {
            KernelOp::AddTimeslice => "add_timeslice",
            KernelOp::SetPeriod => "set_period",
            KernelOp::ChangeTimeslice => "change_timeslice",
            KernelOp::RemoveAll => "remove_all",
            KernelOp::BeginPeriodic => "begin_periodic",
            KernelOp::EndPeriodic => "end_periodic",
            KernelOp::RegisterPreempter => "register_preempter",
            KernelOp::SampleConsumedTime => "sample_consumed_time",
            KernelOp::Granularity => "scheduler_granularity",
        }
    }
}

/// A committed timeslice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTimeslice {
    pub priority: u32,
    pub wcet_us: u64,
}

#[derive(Debug, Default)]
struct SimThread {
    timeslices: Vec<SimTimeslice>,
    period_us: u64,
    periodic: Option<(PeriodicMode, u64)>,
    consumed_us: u64,
    preempter: Option<PreemptionSender>,
}

/// Simulated kernel scheduler
pub struct SimulatedKernel {
    granularity_us: u64,
    threads: DashMap<ThreadId, SimThread>,
    failing: DashSet<KernelOp>,
    granularity_queries: AtomicUsize,
    samples: AtomicUsize,
    sample_delay_ms: AtomicU64,
    next_preempter: AtomicU32,
}

/// Task number used for preempter identities handed out by the simulation
const PREEMPTER_TASK: u32 = 0xfff;

impl SimulatedKernel {
    /// Create a kernel with the given scheduler tick size
    pub fn new(granularity_us: u64) -> Self {
        Self {
            granularity_us,
            threads: DashMap::new(),
            failing: DashSet::new(),
            granularity_queries: AtomicUsize::new(0),
            samples: AtomicUsize::new(0),
            sample_delay_ms: AtomicU64::new(0),
            next_preempter: AtomicU32::new(1),
        }
    }

    /// Make every subsequent call of `op` fail
    pub fn fail(&self, op: KernelOp) {
        self.failing.insert(op);
    }

    /// Undo a previous [`fail`](Self::fail)
    pub fn recover(&self, op: KernelOp) {
        self.failing.remove(&op);
    }

    fn check(&self, op: KernelOp) -> KernelResult<()> {
        if self.failing.contains(&op) {
            return Err(KernelError::new(op.name(), "injected failure"));
        }
        Ok(())
    }

    /// Committed timeslices of a thread, indexed by `id - 1`
    pub fn timeslices(&self, thread: ThreadId) -> Vec<SimTimeslice> {
        self.threads
            .get(&thread)
            .map(|t| t.timeslices.clone())
            .unwrap_or_default()
    }

    /// Period set for a thread
    pub fn period(&self, thread: ThreadId) -> Option<u64> {
        self.threads
            .get(&thread)
            .map(|t| t.period_us)
            .filter(|p| *p != 0)
    }

    /// Periodic mode and start clock, if the thread runs periodically
    pub fn periodic(&self, thread: ThreadId) -> Option<(PeriodicMode, u64)> {
        self.threads.get(&thread).and_then(|t| t.periodic)
    }

    /// Check if the kernel holds any state for a thread
    pub fn knows(&self, thread: ThreadId) -> bool {
        self.threads.contains_key(&thread)
    }

    /// Account CPU time to a thread
    pub fn consume(&self, thread: ThreadId, us: u64) {
        self.threads.entry(thread).or_default().consumed_us += us;
    }

    /// Delay every consumed-time sample by `delay`
    pub fn set_sample_delay(&self, delay: Duration) {
        self.sample_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of granularity queries served
    pub fn granularity_queries(&self) -> usize {
        self.granularity_queries.load(Ordering::SeqCst)
    }

    /// Number of consumed-time sample requests, failed ones included
    pub fn samples_taken(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }

    /// Report that timeslice `id` of `thread` ran out of budget
    ///
    /// Returns false if no preempter is registered for the thread.
    pub fn preempt_timeslice(&self, thread: ThreadId, id: u32) -> bool {
        self.notify(thread, NotificationKind::TimeslicePreempted { id })
    }

    /// Report that `thread` reached the end of its period
    pub fn preempt_deadline(&self, thread: ThreadId) -> bool {
        self.notify(thread, NotificationKind::DeadlinePreempted)
    }

    fn notify(&self, thread: ThreadId, kind: NotificationKind) -> bool {
        let preempter = self.threads.get(&thread).and_then(|t| t.preempter.clone());
        match preempter {
            Some(inbox) => inbox
                .send(Notification { from: thread, kind })
                .is_ok(),
            None => false,
        }
    }
}

impl KernelScheduler for SimulatedKernel {
    fn add_timeslice(&self, thread: ThreadId, priority: u32, wcet_us: u64) -> KernelResult<()> {
        self.check(KernelOp::AddTimeslice)?;
        let mut t = self.threads.entry(thread).or_default();
        t.timeslices.push(SimTimeslice { priority, wcet_us });
        debug!(
            "kernel: {} timeslice {} p={} C={}",
            thread,
            t.timeslices.len(),
            priority,
            wcet_us
        );
        Ok(())
    }

    fn set_period(&self, thread: ThreadId, period_us: u64) -> KernelResult<()> {
        self.check(KernelOp::SetPeriod)?;
        self.threads.entry(thread).or_default().period_us = period_us;
        Ok(())
    }

    fn change_timeslice(
        &self,
        thread: ThreadId,
        id: u32,
        priority: u32,
        wcet_us: u64,
    ) -> KernelResult<()> {
        self.check(KernelOp::ChangeTimeslice)?;
        let mut t = self
            .threads
            .get_mut(&thread)
            .ok_or_else(|| KernelError::new("change_timeslice", format!("unknown thread {}", thread)))?;
        if id == 0 || id as usize > t.timeslices.len() {
            return Err(KernelError::new("change_timeslice", format!("no timeslice {}", id)));
        }
        t.timeslices[id as usize - 1] = SimTimeslice { priority, wcet_us };
        Ok(())
    }

    fn remove_all(&self, thread: ThreadId) -> KernelResult<()> {
        self.check(KernelOp::RemoveAll)?;
        self.threads.remove(&thread);
        Ok(())
    }

    fn begin_periodic(&self, thread: ThreadId, mode: PeriodicMode, clock: u64) -> KernelResult<()> {
        self.check(KernelOp::BeginPeriodic)?;
        let mut t = self
            .threads
            .get_mut(&thread)
            .ok_or_else(|| KernelError::new("begin_periodic", format!("unknown thread {}", thread)))?;
        if t.period_us == 0 {
            return Err(KernelError::new("begin_periodic", "no period set"));
        }
        t.periodic = Some((mode, clock));
        Ok(())
    }

    fn end_periodic(&self, thread: ThreadId) -> KernelResult<()> {
        self.check(KernelOp::EndPeriodic)?;
        let mut t = self
            .threads
            .get_mut(&thread)
            .ok_or_else(|| KernelError::new("end_periodic", format!("unknown thread {}", thread)))?;
        if t.periodic.take().is_none() {
            return Err(KernelError::new("end_periodic", "not periodic"));
        }
        Ok(())
    }

    fn register_preempter(
        &self,
        thread: ThreadId,
        inbox: PreemptionSender,
    ) -> KernelResult<ThreadId> {
        self.check(KernelOp::RegisterPreempter)?;
        self.threads.entry(thread).or_default().preempter = Some(inbox);
        let lthread = self.next_preempter.fetch_add(1, Ordering::SeqCst);
        Ok(ThreadId::new(PREEMPTER_TASK, lthread))
    }

    fn sample_consumed_time(&self, thread: ThreadId) -> KernelResult<ConsumedTime> {
        let delay = self.sample_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let sample = self.check(KernelOp::SampleConsumedTime).and_then(|_| {
            let t = self.threads.get(&thread).ok_or_else(|| {
                KernelError::new("sample_consumed_time", format!("unknown thread {}", thread))
            })?;
            Ok(ConsumedTime {
                next_recipient: thread,
                consumed_us: t.consumed_us,
                priority: t.timeslices.first().map(|s| s.priority).unwrap_or(0),
            })
        });
        // Counted once the sample is taken, failed ones included
        self.samples.fetch_add(1, Ordering::SeqCst);
        if let Ok(sample) = &sample {
            trace!("kernel: sampled {} consumed={}", thread, sample.consumed_us);
        }
        sample
    }

    fn scheduler_granularity(&self) -> KernelResult<u64> {
        self.granularity_queries.fetch_add(1, Ordering::SeqCst);
        self.check(KernelOp::Granularity)?;
        Ok(self.granularity_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const T: ThreadId = ThreadId::new(5, 1);

    #[test]
    fn test_timeslices_and_period() {
        let kernel = SimulatedKernel::new(1000);
        kernel.add_timeslice(T, 50, 2000).unwrap();
        kernel.set_period(T, 10_000).unwrap();
        kernel.add_timeslice(T, 40, 1000).unwrap();
        kernel.change_timeslice(T, 2, 45, 3000).unwrap();

        assert_eq!(
            kernel.timeslices(T),
            vec![
                SimTimeslice { priority: 50, wcet_us: 2000 },
                SimTimeslice { priority: 45, wcet_us: 3000 },
            ]
        );
        assert_eq!(kernel.period(T), Some(10_000));
        assert!(kernel.change_timeslice(T, 3, 1, 1).is_err());

        kernel.remove_all(T).unwrap();
        assert!(!kernel.knows(T));
    }

    #[test]
    fn test_injected_failure() {
        let kernel = SimulatedKernel::new(1000);
        kernel.fail(KernelOp::AddTimeslice);
        assert!(kernel.add_timeslice(T, 1, 1).is_err());
        kernel.recover(KernelOp::AddTimeslice);
        assert!(kernel.add_timeslice(T, 1, 1).is_ok());
    }

    #[test]
    fn test_periodic_requires_period() {
        let kernel = SimulatedKernel::new(1000);
        kernel.add_timeslice(T, 1, 1).unwrap();
        assert!(kernel.begin_periodic(T, PeriodicMode::Strict, 0).is_err());
        kernel.set_period(T, 100).unwrap();
        kernel.begin_periodic(T, PeriodicMode::Minimal, 42).unwrap();
        assert_eq!(kernel.periodic(T), Some((PeriodicMode::Minimal, 42)));
        kernel.end_periodic(T).unwrap();
        assert!(kernel.end_periodic(T).is_err());
    }

    #[test]
    fn test_notifications_reach_preempter() {
        let kernel = SimulatedKernel::new(1000);
        assert!(!kernel.preempt_deadline(T));

        let (tx, mut rx) = mpsc::unbounded_channel();
        kernel.register_preempter(T, tx).unwrap();
        assert!(kernel.preempt_timeslice(T, 2));
        assert!(kernel.preempt_deadline(T));

        assert_eq!(
            rx.try_recv().unwrap(),
            Notification {
                from: T,
                kind: NotificationKind::TimeslicePreempted { id: 2 }
            }
        );
        assert_eq!(rx.try_recv().unwrap().kind, NotificationKind::DeadlinePreempted);
    }
}
