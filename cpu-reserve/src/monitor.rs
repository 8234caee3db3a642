//! Deadline monitoring
//!
//! When monitoring is enabled, each watched reservation gets a histogram of
//! the CPU time its thread consumed between two consecutive period ends.

use crate::config::HistogramConfig;
use crate::error::{ReserveError, Result};
use serde::{Deserialize, Serialize};

/// Fixed-width histogram over `[low_us, high_us)`
#[derive(Debug, Clone)]
pub struct DeadlineHistogram {
    name: String,
    low_us: u64,
    bucket_us: u64,
    bins: Vec<u64>,
    underflow: u64,
    overflow: u64,
    samples: u64,
    min_us: Option<u64>,
    max_us: Option<u64>,
    sum_us: u64,
}

/// Serializable view of a histogram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub name: String,
    pub low_us: u64,
    pub bucket_us: u64,
    pub bins: Vec<u64>,
    pub underflow: u64,
    pub overflow: u64,
    pub samples: u64,
    pub min_us: Option<u64>,
    pub max_us: Option<u64>,
    pub mean_us: Option<u64>,
}

impl DeadlineHistogram {
    /// Create an empty histogram
    pub fn new(name: impl Into<String>, config: &HistogramConfig) -> Result<Self> {
        if config.bins == 0 || config.high_us <= config.low_us {
            return Err(ReserveError::Invalid(format!(
                "histogram range [{}, {}) with {} bins",
                config.low_us, config.high_us, config.bins
            )));
        }
        let bucket_us = (config.high_us - config.low_us).div_ceil(config.bins as u64);
        Ok(Self {
            name: name.into(),
            low_us: config.low_us,
            bucket_us,
            bins: vec![0; config.bins],
            underflow: 0,
            overflow: 0,
            samples: 0,
            min_us: None,
            max_us: None,
            sum_us: 0,
        })
    }

    /// Record one sample
    pub fn add(&mut self, value_us: u64) {
        self.samples += 1;
        self.sum_us = self.sum_us.saturating_add(value_us);
        self.min_us = Some(self.min_us.map_or(value_us, |m| m.min(value_us)));
        self.max_us = Some(self.max_us.map_or(value_us, |m| m.max(value_us)));

        if value_us < self.low_us {
            self.underflow += 1;
            return;
        }
        let index = ((value_us - self.low_us) / self.bucket_us) as usize;
        match self.bins.get_mut(index) {
            Some(bin) => *bin += 1,
            None => self.overflow += 1,
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            name: self.name.clone(),
            low_us: self.low_us,
            bucket_us: self.bucket_us,
            bins: self.bins.clone(),
            underflow: self.underflow,
            overflow: self.overflow,
            samples: self.samples,
            min_us: self.min_us,
            max_us: self.max_us,
            mean_us: self.sum_us.checked_div(self.samples),
        }
    }
}

/// Per-reservation monitoring state
#[derive(Debug)]
pub struct DeadlineMonitor {
    histogram: DeadlineHistogram,
    last_consumed_us: Option<u64>,
}

impl DeadlineMonitor {
    pub fn new(histogram: DeadlineHistogram) -> Self {
        Self {
            histogram,
            last_consumed_us: None,
        }
    }

    /// Feed a consumed-time sample taken at a period end
    ///
    /// The first sample only establishes the baseline.
    pub fn record(&mut self, consumed_us: u64) {
        if let Some(previous) = self.last_consumed_us {
            self.histogram.add(consumed_us.saturating_sub(previous));
        }
        self.last_consumed_us = Some(consumed_us);
    }

    pub fn histogram(&self) -> &DeadlineHistogram {
        &self.histogram
    }
}
