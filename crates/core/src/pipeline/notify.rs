//! Frame notifications from a pipeline to the application.
//!
//! Callbacks run on whichever thread drove the transition (the app thread for
//! `put_frame`, the transport thread for `next_frame`/`frame_done`), always
//! after the pipeline lock has been released. They must not block: a slow
//! observer stalls the transport.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::meta::TxDoneMeta;

/// Receives pipeline events. Every method defaults to a no-op.
pub trait FrameObserver: Send + Sync {
    /// A slot became free, so `get_frame` can succeed again.
    fn on_frame_available(&self) {}

    /// A frame was put by the application and is waiting for the transport.
    fn on_frame_ready(&self, _index: u16) {}

    /// The transport finished sending a frame.
    fn on_frame_done(&self, _index: u16, _meta: &TxDoneMeta) {}

    /// The transport skipped an epoch. `index` is the discarded frame, if any.
    fn on_frame_late(&self, _index: Option<u16>, _epoch_skipped: u64) {}

    /// A Ready frame was superseded by a newer one and never sent.
    fn on_frame_dropped(&self, _index: u16) {}
}

/// Event posted by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    FrameAvailable,
    FrameReady(u16),
    FrameDone(u16, TxDoneMeta),
    FrameLate {
        index: Option<u16>,
        epoch_skipped: u64,
    },
    FrameDropped(u16),
}

/// Observer that forwards every event into a bounded channel.
///
/// Uses `try_send`: when the receiver falls behind, events are discarded and
/// counted rather than blocking the transport thread.
pub struct ChannelObserver {
    tx: Sender<PipelineEvent>,
    lost: AtomicU64,
}

impl ChannelObserver {
    /// Creates the observer and the receiving end of its channel.
    pub fn bounded(capacity: usize) -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                tx,
                lost: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Number of events discarded because the channel was full or closed.
    pub fn lost_events(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    fn post(&self, event: PipelineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(?ev, "event channel full, dropping");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl FrameObserver for ChannelObserver {
    fn on_frame_available(&self) {
        self.post(PipelineEvent::FrameAvailable);
    }

    fn on_frame_ready(&self, index: u16) {
        self.post(PipelineEvent::FrameReady(index));
    }

    fn on_frame_done(&self, index: u16, meta: &TxDoneMeta) {
        self.post(PipelineEvent::FrameDone(index, *meta));
    }

    fn on_frame_late(&self, index: Option<u16>, epoch_skipped: u64) {
        self.post(PipelineEvent::FrameLate {
            index,
            epoch_skipped,
        });
    }

    fn on_frame_dropped(&self, index: u16) {
        self.post(PipelineEvent::FrameDropped(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_never_blocks() {
        let (obs, rx) = ChannelObserver::bounded(1);
        obs.on_frame_ready(0);
        obs.on_frame_ready(1);
        assert_eq!(obs.lost_events(), 1);
        assert_eq!(rx.try_recv().unwrap(), PipelineEvent::FrameReady(0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnected_receiver_is_counted() {
        let (obs, rx) = ChannelObserver::bounded(4);
        drop(rx);
        obs.on_frame_available();
        assert_eq!(obs.lost_events(), 1);
    }
}
