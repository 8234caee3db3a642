//! Schedulability analysis
//!
//! Fixed-priority time-demand analysis with blocking by delayed-preemption
//! (DP) entries. All functions work on a snapshot of the reservation table
//! sorted ascending by priority; nothing here mutates state.
//!
//! The response time of an entry `i` is the least fixed point of
//!
//! ```text
//! R = C_i + B_i + sum over interfering j of ceil(R / T_j) * C_j
//! ```
//!
//! where `B_i` is the longest DP section below `i`'s priority and the
//! interfering entries are all periodic entries at or above `i`'s priority.

use crate::reservation::Reservation;
use thiserror::Error;

/// Upper bound on fixed-point iterations before giving up
pub const MAX_ITERATIONS: usize = 10_000;

/// The analysed entry cannot meet its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Unschedulable {
    /// Demand grew beyond the deadline (or the period)
    #[error("response time {demand_us}us exceeds limit {limit_us}us")]
    LimitExceeded { demand_us: u64, limit_us: u64 },
    /// No fixed point within [`MAX_ITERATIONS`]
    #[error("no fixed point after {0} iterations")]
    Diverged(usize),
}

/// Lowest index whose entry has priority `>= priority`
///
/// Equal priorities keep arrival order: a new entry lands in front of the
/// existing ones of its priority.
pub fn insert_position(entries: &[Reservation], priority: u32) -> usize {
    entries.partition_point(|e| e.priority < priority)
}

/// Longest DP section strictly below `priority`
///
/// `pending` is an entry that is about to be added and takes part in the
/// comparison if it is a DP entry.
pub fn max_blocking(entries: &[Reservation], priority: u32, pending: Option<&Reservation>) -> u64 {
    entries
        .iter()
        .chain(pending)
        .filter(|e| e.is_dp() && e.priority < priority)
        .map(|e| e.wcet_us)
        .max()
        .unwrap_or(0)
}

/// Interference of one periodic entry within a window of `window_us`
fn interference(window_us: u64, other: &Reservation) -> u64 {
    window_us
        .div_ceil(other.period_us)
        .saturating_mul(other.wcet_us)
}

/// Worst-case response time of `entry`
///
/// Every periodic entry at index `>= scan_from` other than `entry` itself
/// interferes, as does a periodic `pending` entry. Fails if the demand
/// exceeds the entry's deadline, or its period for optional reservations.
pub fn response_time(
    entries: &[Reservation],
    entry: &Reservation,
    scan_from: usize,
    pending: Option<&Reservation>,
) -> Result<u64, Unschedulable> {
    let base = entry
        .wcet_us
        .saturating_add(max_blocking(entries, entry.priority, pending));
    let limit_us = entry.limit_us();
    let interfering: Vec<&Reservation> = entries
        .get(scan_from..)
        .unwrap_or_default()
        .iter()
        .filter(|e| !e.is_dp() && !e.same_slot(entry))
        .chain(pending.filter(|p| !p.is_dp()))
        .collect();

    let mut r = base;
    for _ in 0..MAX_ITERATIONS {
        let next = interfering
            .iter()
            .fold(base, |acc, other| acc.saturating_add(interference(r, other)));

        if next > limit_us {
            return Err(Unschedulable::LimitExceeded {
                demand_us: next,
                limit_us,
            });
        }
        if next == r {
            return Ok(r);
        }
        r = next;
    }
    Err(Unschedulable::Diverged(MAX_ITERATIONS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::ThreadId;

    fn periodic(task: u32, priority: u32, period_us: u64, wcet_us: u64, deadline_us: u64) -> Reservation {
        Reservation {
            thread: ThreadId::new(task, 0),
            id: 1,
            priority,
            period_us,
            wcet_us,
            deadline_us,
        }
    }

    fn dp(task: u32, priority: u32, wcet_us: u64) -> Reservation {
        Reservation {
            thread: ThreadId::new(task, 0),
            id: 1,
            priority,
            period_us: 0,
            wcet_us,
            deadline_us: 0,
        }
    }

    #[test]
    fn test_insert_position_lower_bound() {
        let table = vec![
            periodic(1, 5, 100, 1, 0),
            periodic(2, 10, 100, 1, 0),
            periodic(3, 10, 100, 1, 0),
            periodic(4, 20, 100, 1, 0),
        ];
        assert_eq!(insert_position(&table, 1), 0);
        assert_eq!(insert_position(&table, 5), 0);
        assert_eq!(insert_position(&table, 10), 1);
        assert_eq!(insert_position(&table, 15), 3);
        assert_eq!(insert_position(&table, 30), 4);
        assert_eq!(insert_position(&[], 7), 0);
    }

    #[test]
    fn test_max_blocking_only_lower_dp() {
        let table = vec![dp(1, 1, 30), periodic(2, 3, 100, 50, 0), dp(3, 8, 70)];
        assert_eq!(max_blocking(&table, 5, None), 30);
        assert_eq!(max_blocking(&table, 1, None), 0);
        assert_eq!(max_blocking(&table, 9, None), 70);

        let pending = dp(4, 2, 40);
        assert_eq!(max_blocking(&table, 5, Some(&pending)), 40);
        // Pending at or above the priority does not block
        let high = dp(4, 5, 400);
        assert_eq!(max_blocking(&table, 5, Some(&high)), 30);
    }

    #[test]
    fn test_max_blocking_without_dp() {
        let table = vec![periodic(1, 1, 100, 30, 0)];
        assert_eq!(max_blocking(&table, 5, None), 0);
    }

    #[test]
    fn test_single_entry_response_time() {
        let a = periodic(1, 10, 100, 20, 100);
        assert_eq!(response_time(&[a], &a, 0, None), Ok(20));
    }

    #[test]
    fn test_classic_fixed_point() {
        // Textbook set: (C=1,T=4), (C=2,T=6), (C=3,T=13) -> R3 = 10
        let table = vec![
            periodic(3, 1, 13, 3, 13),
            periodic(2, 2, 6, 2, 6),
            periodic(1, 3, 4, 1, 4),
        ];
        assert_eq!(response_time(&table, &table[2], 2, None), Ok(1));
        assert_eq!(response_time(&table, &table[1], 1, None), Ok(3));
        assert_eq!(response_time(&table, &table[0], 0, None), Ok(10));
    }

    #[test]
    fn test_deadline_exceeded() {
        let a = periodic(1, 10, 100, 20, 100);
        let b = periodic(2, 5, 50, 10, 50);
        // A above B: A = 20, B = 10 + ceil(R/100)*20 = 30
        let table = vec![b, a];
        assert_eq!(response_time(&table, &b, 0, None), Ok(30));

        let heavy_a = periodic(1, 10, 100, 45, 100);
        let table = vec![b, heavy_a];
        assert_eq!(
            response_time(&table, &b, 0, None),
            Err(Unschedulable::LimitExceeded {
                demand_us: 55,
                limit_us: 50
            })
        );
    }

    #[test]
    fn test_pending_contributes() {
        let low = periodic(1, 5, 100, 40, 100);
        let table = vec![low];
        assert_eq!(response_time(&table, &low, 0, None), Ok(40));

        let pending = periodic(2, 10, 50, 20, 0);
        // 40 + ceil(40/50)*20 = 60; 40 + ceil(60/50)*20 = 80; stable at 80
        assert_eq!(response_time(&table, &low, 0, Some(&pending)), Ok(80));
    }

    #[test]
    fn test_dp_blocks_higher_priority() {
        let high = periodic(1, 5, 100, 50, 60);
        let table = vec![dp(2, 1, 30), high];
        assert_eq!(response_time(&table, &high, 1, None), Err(Unschedulable::LimitExceeded {
            demand_us: 80,
            limit_us: 60
        }));

        let table = vec![dp(2, 1, 10), high];
        assert_eq!(response_time(&table, &high, 1, None), Ok(60));
    }

    #[test]
    fn test_self_is_skipped() {
        let a = periodic(1, 10, 100, 20, 0);
        let b = periodic(2, 10, 100, 30, 0);
        let table = vec![a, b];
        // Equal priorities interfere with each other, but never with themselves
        assert_eq!(response_time(&table, &a, 0, None), Ok(50));
        assert_eq!(response_time(&table, &b, 0, None), Ok(50));
    }

    #[test]
    fn test_optional_uses_period_as_limit() {
        let a = periodic(1, 10, 100, 120, 0);
        assert!(response_time(&[a], &a, 0, None).is_err());
    }
}
