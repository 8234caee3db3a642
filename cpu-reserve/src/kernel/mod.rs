//! Kernel scheduler interface
//!
//! The admission controller never dispatches CPU time itself. It commits
//! admitted reservations to the kernel through [`KernelScheduler`] and
//! receives preemption notifications for watched threads through the
//! channel handed over in [`KernelScheduler::register_preempter`].

mod simulated;

pub use simulated::{KernelOp, SimTimeslice, SimulatedKernel};

use crate::error::KernelError;
use crate::reservation::ThreadId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Result type for kernel calls
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Sending half of a watcher's notification inbox
pub type PreemptionSender = mpsc::UnboundedSender<Notification>;

/// Receiving half of a watcher's notification inbox
pub type PreemptionReceiver = mpsc::UnboundedReceiver<Notification>;

/// How a thread's periodic execution is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodicMode {
    /// Releases happen exactly at period boundaries
    Strict,
    /// Releases are at least one period apart
    Minimal,
}

/// Message delivered to a preempter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// Sender: the watched thread for kernel notifications, the server's
    /// control identity for shutdown
    pub from: ThreadId,
    pub kind: NotificationKind,
}

/// Kind of preemption notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Timeslice `id` ran out of budget
    TimeslicePreempted { id: u32 },
    /// The thread reached the end of its period
    DeadlinePreempted,
    /// Wake-up carrying no preemption, used by the control identity
    Wakeup,
}

/// Per-thread CPU accounting sampled from the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumedTime {
    /// Thread that will receive the CPU next
    pub next_recipient: ThreadId,
    /// Total CPU time consumed by the sampled thread
    pub consumed_us: u64,
    /// Current priority of the sampled thread
    pub priority: u32,
}

/// Operations consumed from the kernel scheduler
pub trait KernelScheduler: Send + Sync {
    /// Create a new timeslice for the thread
    fn add_timeslice(&self, thread: ThreadId, priority: u32, wcet_us: u64) -> KernelResult<()>;

    /// Set the thread's period
    fn set_period(&self, thread: ThreadId, period_us: u64) -> KernelResult<()>;

    /// Change priority and budget of an existing timeslice
    fn change_timeslice(
        &self,
        thread: ThreadId,
        id: u32,
        priority: u32,
        wcet_us: u64,
    ) -> KernelResult<()>;

    /// Drop all timeslices of the thread
    fn remove_all(&self, thread: ThreadId) -> KernelResult<()>;

    /// Start periodic execution at the absolute `clock`
    fn begin_periodic(&self, thread: ThreadId, mode: PeriodicMode, clock: u64) -> KernelResult<()>;

    /// Stop periodic execution
    fn end_periodic(&self, thread: ThreadId) -> KernelResult<()>;

    /// Route the thread's preemption notifications into `inbox`
    ///
    /// Returns the identity the kernel assigned to the preempter.
    fn register_preempter(&self, thread: ThreadId, inbox: PreemptionSender)
        -> KernelResult<ThreadId>;

    /// Sample the thread's consumed CPU time
    fn sample_consumed_time(&self, thread: ThreadId) -> KernelResult<ConsumedTime>;

    /// Read the scheduler tick size
    fn scheduler_granularity(&self) -> KernelResult<u64>;
}
