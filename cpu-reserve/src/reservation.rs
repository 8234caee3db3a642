//! Reservation parameters and thread identities

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reservation id of a thread's primary (first, periodic) timeslice
pub const PRIMARY_ID: u32 = 1;

/// Task number reserved for the server's own control identity
///
/// Never handed out to clients, so a wake-up from [`CONTROL_ID`] can only
/// come from the server.
pub const CONTROL_TASK: u32 = 0xffe;

/// Identity the server signals its watchers from
pub const CONTROL_ID: ThreadId = ThreadId::new(CONTROL_TASK, 0);

/// Thread identity as seen by the kernel scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId {
    /// Task (address space) number
    pub task: u32,
    /// Thread number within the task
    pub lthread: u32,
}

impl ThreadId {
    pub const fn new(task: u32, lthread: u32) -> Self {
        Self { task, lthread }
    }

    /// Check whether both ids belong to the same task
    pub fn same_task(&self, other: &ThreadId) -> bool {
        self.task == other.task
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.task, self.lthread)
    }
}

impl std::str::FromStr for ThreadId {
    type Err = String;

    /// Parse the `task.lthread` hex form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (task, lthread) = s
            .split_once('.')
            .ok_or_else(|| format!("expected <task>.<thread>, got {:?}", s))?;
        let task = u32::from_str_radix(task, 16).map_err(|e| format!("bad task: {}", e))?;
        let lthread =
            u32::from_str_radix(lthread, 16).map_err(|e| format!("bad thread: {}", e))?;
        Ok(Self { task, lthread })
    }
}

/// Scheduling parameters of one table entry
///
/// This is the plain-data view the analyzer works on. A `period_us` of zero
/// marks a delayed-preemption (DP) entry: a bound on a non-preemptible
/// section rather than a periodic timeslice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Thread owning the CPU budget
    pub thread: ThreadId,
    /// Timeslice id within the thread
    pub id: u32,
    /// Larger is more important
    pub priority: u32,
    /// Replenishment period, 0 for DP entries
    pub period_us: u64,
    /// Budget per period, already rounded to granularity
    pub wcet_us: u64,
    /// Hard deadline within the period, 0 for optional reservations
    pub deadline_us: u64,
}

impl Reservation {
    /// Check if this is a delayed-preemption entry
    pub fn is_dp(&self) -> bool {
        self.period_us == 0
    }

    /// Check if this reservation has a hard deadline
    pub fn has_deadline(&self) -> bool {
        self.deadline_us != 0
    }

    /// Response-time limit used by the analyzer
    pub fn limit_us(&self) -> u64 {
        if self.deadline_us != 0 {
            self.deadline_us
        } else {
            self.period_us
        }
    }

    /// Check whether `other` is the same table slot
    ///
    /// A DP entry shares thread and id with the timeslice it extends, so the
    /// DP flag is part of the identity.
    pub fn same_slot(&self, other: &Reservation) -> bool {
        self.thread == other.thread && self.id == other.id && self.is_dp() == other.is_dp()
    }
}
