//! Per-session pipeline counters.

use std::fmt;

use super::{FrameState, SessionId};

/// Number of slots in each state at the time of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateHistogram {
    pub free: u16,
    pub in_user: u16,
    pub ready: u16,
    pub in_transmitting: u16,
}

impl StateHistogram {
    pub(crate) fn record(&mut self, state: FrameState) {
        match state {
            FrameState::Free => self.free += 1,
            FrameState::InUser => self.in_user += 1,
            FrameState::Ready => self.ready += 1,
            FrameState::InTransmitting => self.in_transmitting += 1,
        }
    }

    pub fn count(&self, state: FrameState) -> u16 {
        match state {
            FrameState::Free => self.free,
            FrameState::InUser => self.in_user,
            FrameState::Ready => self.ready,
            FrameState::InTransmitting => self.in_transmitting,
        }
    }

    pub fn total(&self) -> u16 {
        self.free + self.in_user + self.ready + self.in_transmitting
    }
}

/// Empty states are omitted: `F:2 U:1 T:1`.
impl fmt::Display for StateHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for state in FrameState::ALL {
            let n = self.count(state);
            if n == 0 {
                continue;
            }
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", state.short_name(), n)?;
            first = false;
        }
        Ok(())
    }
}

/// Running counters of a pipeline, kept under the pipeline lock.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub get_try: u64,
    pub get_success: u64,
    pub put: u64,
    pub dropped: u64,
    pub cancelled: u64,
    pub busy: u64,
}

/// Snapshot returned by `stats()` / `drain_stats()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub session: SessionId,
    pub name: String,
    pub histogram: StateHistogram,
    /// `get_frame` calls, including ones that returned `None`.
    pub get_try: u64,
    pub get_success: u64,
    pub put: u64,
    /// Ready frames superseded (newest-wins or late drop) without being sent.
    pub dropped: u64,
    /// Handles dropped without being returned.
    pub cancelled: u64,
    /// RX frames refused because no slot was free.
    pub busy: u64,
}

impl PipelineStats {
    pub(crate) fn new(
        session: SessionId,
        name: &str,
        histogram: StateHistogram,
        counters: &Counters,
    ) -> Self {
        Self {
            session,
            name: name.to_string(),
            histogram,
            get_try: counters.get_try,
            get_success: counters.get_success,
            put: counters.put,
            dropped: counters.dropped,
            cancelled: counters.cancelled,
            busy: counters.busy,
        }
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}): [{}] get {}/{}, put {}",
            self.name, self.session, self.histogram, self.get_success, self.get_try, self.put
        )?;
        if self.dropped > 0 {
            write!(f, ", dropped {}", self.dropped)?;
        }
        if self.cancelled > 0 {
            write!(f, ", cancelled {}", self.cancelled)?;
        }
        if self.busy > 0 {
            write!(f, ", busy {}", self.busy)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_skips_empty_states() {
        let mut h = StateHistogram::default();
        for s in [
            FrameState::Free,
            FrameState::Free,
            FrameState::InUser,
            FrameState::InTransmitting,
        ] {
            h.record(s);
        }
        assert_eq!(h.to_string(), "F:2 U:1 T:1");
        assert_eq!(h.total(), 4);
    }

    #[test]
    fn stats_line() {
        let counters = Counters {
            get_try: 5,
            get_success: 4,
            put: 4,
            dropped: 1,
            ..Default::default()
        };
        let mut h = StateHistogram::default();
        h.record(FrameState::Free);
        let stats = PipelineStats::new(SessionId(2), "tx_video_2", h, &counters);
        assert_eq!(
            stats.to_string(),
            "tx_video_2(2): [F:1] get 4/5, put 4, dropped 1"
        );
    }
}
