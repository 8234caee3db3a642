//! CPU reservation admission control
//!
//! Clients reserve periodic CPU budgets (period, WCET, optional deadline) at
//! fixed priorities. A reservation is only admitted if time-demand analysis
//! shows that it and every previously admitted hard deadline still hold:
//! - Reservation table sorted by priority behind a single lock
//! - Response-time analysis with delayed-preemption blocking
//! - All-or-nothing add, change and delete against the kernel scheduler
//! - Preemption watchers with overrun counters and deadline histograms

pub mod analysis;
pub mod config;
pub mod controller;
pub mod error;
pub mod granularity;
pub mod ipc;
pub mod kernel;
pub mod monitor;
pub mod reservation;
pub mod table;
pub mod watch;

pub use controller::Controller;
pub use error::{ReserveError, Result};
pub use reservation::{Reservation, ThreadId};
