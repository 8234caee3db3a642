//! Scheduler granularity
//!
//! The kernel accounts timeslices in whole scheduler ticks, so every WCET
//! is rounded up to a multiple of the tick size before it is analysed or
//! committed.

use crate::kernel::KernelScheduler;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{info, warn};

/// Cached scheduler tick size
pub struct Granularity {
    kernel: Arc<dyn KernelScheduler>,
    tick_us: OnceCell<u64>,
}

impl Granularity {
    pub fn new(kernel: Arc<dyn KernelScheduler>) -> Self {
        Self {
            kernel,
            tick_us: OnceCell::new(),
        }
    }

    /// Scheduler tick size in microseconds
    ///
    /// Queried from the kernel on first use only. A failed query caches 0,
    /// which callers treat as "unknown".
    pub fn get(&self) -> u64 {
        *self.tick_us.get_or_init(|| match self.kernel.scheduler_granularity() {
            Ok(tick) => {
                info!("Scheduling granularity: {}us", tick);
                tick
            }
            Err(e) => {
                warn!("Could not read scheduling granularity: {}", e);
                0
            }
        })
    }

    /// Round `requested_us` up to the next multiple of the tick size
    pub fn round_up(&self, requested_us: u64) -> u64 {
        round_up(requested_us, self.get())
    }
}

/// Round `value` up to a multiple of `tick`; a zero tick leaves it unchanged
pub fn round_up(value: u64, tick: u64) -> u64 {
    if value == 0 || tick == 0 {
        return value;
    }
    value.div_ceil(tick).saturating_mul(tick)
}
