use super::FrameState;
use crate::error::{Result, St2110Error};

/// One entry of a pipeline's slot array.
///
/// `payload` is `Some` only while the pipeline itself holds the buffer (Free
/// and Ready). In InUser/InTransmitting it lives in the outstanding handle.
#[derive(Debug)]
pub(crate) struct FrameSlot<T, M> {
    pub index: u16,
    pub state: FrameState,
    pub payload: Option<T>,
    pub sequence: u32,
    pub meta: M,
}

impl<T, M: Default> FrameSlot<T, M> {
    pub fn new(index: u16, payload: Option<T>) -> Self {
        Self {
            index,
            state: FrameState::Free,
            payload,
            sequence: 0,
            meta: M::default(),
        }
    }
}

impl<T, M> FrameSlot<T, M> {
    /// Moves the slot from `from` to `to`, or reports the actual state.
    pub fn transition(&mut self, session: &str, from: FrameState, to: FrameState) -> Result<()> {
        if self.state != from {
            return Err(St2110Error::InvalidState {
                session: session.to_string(),
                index: self.index,
                expected: from,
                actual: self.state,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Index after `idx` in a ring of `count` slots.
pub(crate) fn next_idx(idx: u16, count: u16) -> u16 {
    if idx + 1 >= count { 0 } else { idx + 1 }
}

/// First slot in `state`, scanning the ring once starting at `start`.
pub(crate) fn scan_from<T, M>(slots: &[FrameSlot<T, M>], start: u16, state: FrameState) -> Option<u16> {
    let count = slots.len() as u16;
    let mut idx = start;
    for _ in 0..count {
        if slots[idx as usize].state == state {
            return Some(idx);
        }
        idx = next_idx(idx, count);
    }
    None
}

/// Slot in `state` with the highest sequence number (wrap-aware).
pub(crate) fn newest<T, M>(slots: &[FrameSlot<T, M>], state: FrameState) -> Option<u16> {
    slots
        .iter()
        .filter(|s| s.state == state)
        .reduce(|best, s| if seq_greater(s.sequence, best.sequence) { s } else { best })
        .map(|s| s.index)
}

/// `a` is newer than `b` under u32 wrap-around.
pub(crate) fn seq_greater(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
