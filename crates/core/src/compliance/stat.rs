//! Running min/max/sum aggregates and the drained compliance report.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Classification;
use super::video::FrameTiming;

/// Min/max/sum of one integer metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metric {
    pub min: i64,
    pub max: i64,
    pub sum: i64,
    pub count: u64,
}

impl Metric {
    pub fn record(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    pub fn merge(&mut self, other: &Metric) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.avg() {
            Some(avg) => write!(f, "avg {avg:.2} min {} max {}", self.min, self.max),
            None => f.write_str("n/a"),
        }
    }
}

/// Narrow/wide/failed counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerdictCounts {
    pub narrow: u64,
    pub wide: u64,
    pub failed: u64,
}

impl VerdictCounts {
    pub fn record(&mut self, classification: Classification) {
        match classification {
            Classification::Narrow => self.narrow += 1,
            Classification::Wide => self.wide += 1,
            Classification::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.narrow + self.wide + self.failed
    }
}

impl fmt::Display for VerdictCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "narrow {} wide {} failed {}",
            self.narrow, self.wide, self.failed
        )
    }
}

/// Video compliance aggregate over every frame parsed since the last drain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComplianceStat {
    pub verdicts: VerdictCounts,
    pub frames: u64,
    pub packets: u64,
    pub vrx: Metric,
    pub cinst: Metric,
    /// Inter-packet time, ns.
    pub ipt: Metric,
    /// First packet offset from its epoch, ns.
    pub fpt: Metric,
    pub latency: Metric,
    pub rtp_offset: Metric,
    /// Only frames that had a predecessor contribute.
    pub rtp_ts_delta: Metric,
}

impl ComplianceStat {
    pub(crate) fn fold(&mut self, timing: &FrameTiming) {
        self.verdicts.record(timing.classification);
        self.frames += 1;
        self.packets += timing.packets as u64;
        self.vrx.merge(&timing.vrx);
        self.cinst.merge(&timing.cinst);
        self.ipt.merge(&timing.ipt);
        self.fpt.record(timing.fpt);
        self.latency.record(timing.latency);
        self.rtp_offset.record(timing.rtp_offset);
        if let Some(delta) = timing.rtp_ts_delta {
            self.rtp_ts_delta.record(delta as i64);
        }
    }

    /// Spread of the first-packet offsets, ns.
    pub fn fpt_diff(&self) -> Option<i64> {
        (!self.fpt.is_empty()).then(|| self.fpt.max - self.fpt.min)
    }
}

impl fmt::Display for ComplianceStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} frames, {} pkts)", self.verdicts, self.frames, self.packets)?;
        writeln!(f, "  cinst        {}", self.cinst)?;
        writeln!(f, "  vrx          {}", self.vrx)?;
        writeln!(f, "  ipt(ns)      {}", self.ipt)?;
        writeln!(f, "  fpt(ns)      {}", self.fpt)?;
        writeln!(f, "  latency(ns)  {}", self.latency)?;
        writeln!(f, "  rtp_offset   {}", self.rtp_offset)?;
        write!(f, "  rtp_ts_delta {}", self.rtp_ts_delta)
    }
}

/// Shared handle to an aggregate, drained by a reporting thread while the
/// receive thread keeps folding into it.
#[derive(Debug)]
pub struct StatHandle<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for StatHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Default + Clone> StatHandle<S> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(S::default())),
        }
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut S)) {
        f(&mut *self.inner.lock());
    }

    /// Copy of the aggregate without resetting it.
    pub fn snapshot(&self) -> S {
        self.inner.lock().clone()
    }

    /// Returns the aggregate and resets it to zero.
    pub fn drain(&self) -> S {
        std::mem::take(&mut *self.inner.lock())
    }
}
