//! Transmit pipeline: application fills frames, transport sends them.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use super::config::PipelineConfig;
use super::meta::{PacingTimestamp, TxDoneMeta, TxFrameMeta};
use super::notify::FrameObserver;
use super::slot::{self, FrameSlot};
use super::stats::{Counters, PipelineStats, StateHistogram};
use super::{FrameState, SelectPolicy, SessionId};
use crate::error::{ConfigErrorKind, Result, St2110Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Default)]
struct TxSlotMeta {
    pacing: Option<PacingTimestamp>,
    done: TxDoneMeta,
}

struct Inner<T> {
    slots: Vec<FrameSlot<T, TxSlotMeta>>,
    producer_idx: u16,
    consumer_idx: u16,
    next_sequence: u32,
    lifecycle: Lifecycle,
    block_timeout: Duration,
    counters: Counters,
}

struct Shared<T> {
    session: SessionId,
    name: String,
    config: PipelineConfig,
    inner: Mutex<Inner<T>>,
    /// Signalled whenever a slot returns to Free.
    available: Condvar,
    observer: RwLock<Option<Arc<dyn FrameObserver>>>,
}

impl<T> Shared<T> {
    fn observer(&self) -> Option<Arc<dyn FrameObserver>> {
        self.observer.read().clone()
    }

    fn notify_available(&self) {
        self.available.notify_all();
        if let Some(obs) = self.observer() {
            obs.on_frame_available();
        }
    }

    /// Returns the payload of an abandoned handle to the free pool.
    fn cancel(&self, index: u16, held: FrameState, payload: T) {
        let mut inner = self.inner.lock();
        if inner.lifecycle == Lifecycle::Closed {
            return;
        }
        let slot = &mut inner.slots[index as usize];
        if slot.state != held {
            tracing::warn!(
                session = %self.name,
                index,
                state = %slot.state,
                "cancelled frame in unexpected state"
            );
            return;
        }
        slot.state = FrameState::Free;
        slot.payload = Some(payload);
        inner.counters.cancelled += 1;
        drop(inner);

        tracing::debug!(session = %self.name, index, from = %held, "frame cancelled");
        self.notify_available();
    }
}

/// A frame slot handed to the application by [`TxPipeline::get_frame`].
///
/// Dereferences to the payload. Redeem it with [`TxPipeline::put_frame`];
/// dropping it instead returns the slot to the free pool unsent.
pub struct FrameHandle<T> {
    shared: Arc<Shared<T>>,
    index: u16,
    sequence: u32,
    pacing: Option<PacingTimestamp>,
    payload: Option<T>,
}

impl<T> FrameHandle<T> {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Requests a transmit time. Only honored when the pipeline was created
    /// with `user_pacing`.
    pub fn set_pacing(&mut self, timestamp: PacingTimestamp) {
        self.pacing = Some(timestamp);
    }
}

impl<T> Deref for FrameHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.payload
            .as_ref()
            .expect("payload is held until the handle is consumed")
    }
}

impl<T> DerefMut for FrameHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.payload
            .as_mut()
            .expect("payload is held until the handle is consumed")
    }
}

impl<T> Drop for FrameHandle<T> {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            self.shared.cancel(self.index, FrameState::InUser, payload);
        }
    }
}

impl<T> std::fmt::Debug for FrameHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandle")
            .field("session", &self.shared.name)
            .field("index", &self.index)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// A frame handed to the transport by [`TxPipeline::next_frame`].
///
/// Redeem it with [`TxPipeline::frame_done`]. Dropping it frees the slot and
/// counts the frame as cancelled.
pub struct TransmitFrame<T> {
    shared: Arc<Shared<T>>,
    index: u16,
    meta: TxFrameMeta,
    payload: Option<T>,
}

impl<T> TransmitFrame<T> {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn meta(&self) -> &TxFrameMeta {
        &self.meta
    }
}

impl<T> Deref for TransmitFrame<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.payload
            .as_ref()
            .expect("payload is held until the frame is done")
    }
}

impl<T> Drop for TransmitFrame<T> {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            self.shared
                .cancel(self.index, FrameState::InTransmitting, payload);
        }
    }
}

impl<T> std::fmt::Debug for TransmitFrame<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmitFrame")
            .field("session", &self.shared.name)
            .field("index", &self.index)
            .field("meta", &self.meta)
            .finish()
    }
}

/// A slot that did not reach Free within the flush retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckFrame {
    pub index: u16,
    pub state: FrameState,
}

/// Outcome of [`TxPipeline::flush_and_close`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub session: String,
    /// Slots still being sent when the drain reached them; given the grace period.
    pub in_flight: Vec<u16>,
    /// Slots that never returned to Free.
    pub stuck: Vec<StuckFrame>,
    /// Payload buffers released by the pipeline at close.
    pub released: usize,
    pub elapsed: Duration,
}

impl FlushReport {
    /// No slot was left behind by the application or the transport.
    pub fn is_clean(&self) -> bool {
        self.stuck.is_empty()
    }
}

/// Frame-exchange pipeline for a transmit session.
///
/// Cloning is cheap and yields another handle to the same pipeline, so the
/// application and the transport thread can each hold one.
pub struct TxPipeline<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TxPipeline<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> TxPipeline<T> {
    /// Creates a pipeline for session 0 over `buffers`, one per slot.
    pub fn new(config: PipelineConfig, buffers: Vec<T>) -> Result<Self> {
        Self::with_session(SessionId::default(), config, buffers)
    }

    /// Creates a pipeline with an explicit session index.
    pub fn with_session(session: SessionId, config: PipelineConfig, buffers: Vec<T>) -> Result<Self> {
        if buffers.len() > u16::MAX as usize {
            return Err(St2110Error::config(ConfigErrorKind::TooManyFrameBuffers(
                buffers.len(),
            )));
        }
        config.validate(buffers.len())?;

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("tx_{}_{}", config.media.as_str(), session));
        let slots = buffers
            .into_iter()
            .enumerate()
            .map(|(i, buf)| FrameSlot::new(i as u16, Some(buf)))
            .collect();

        tracing::info!(
            session = %name,
            frames = config.framebuff_cnt,
            policy = ?config.policy,
            block_get = config.block_get,
            "tx pipeline created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                session,
                name,
                inner: Mutex::new(Inner {
                    slots,
                    producer_idx: 0,
                    consumer_idx: 0,
                    next_sequence: 0,
                    lifecycle: Lifecycle::Open,
                    block_timeout: config.block_timeout,
                    counters: Counters::default(),
                }),
                config,
                available: Condvar::new(),
                observer: RwLock::new(None),
            }),
        })
    }

    pub fn session(&self) -> SessionId {
        self.shared.session
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn frame_count(&self) -> u16 {
        self.shared.config.framebuff_cnt
    }

    /// Registers the observer notified of frame events, replacing any previous one.
    pub fn set_observer(&self, observer: Arc<dyn FrameObserver>) {
        *self.shared.observer.write() = Some(observer);
    }

    /// Changes the wait of a blocking `get_frame`.
    pub fn set_block_timeout(&self, timeout: Duration) {
        self.shared.inner.lock().block_timeout = timeout;
    }

    /// Wakes every thread blocked in `get_frame`. Each one retries once and
    /// returns.
    pub fn wake_block(&self) {
        let _inner = self.shared.inner.lock();
        self.shared.available.notify_all();
    }

    /// Takes a free frame for the application to fill.
    ///
    /// Returns `None` when no slot is free (after one bounded wait and one
    /// retry when `block_get` is set) or when the pipeline is closing.
    pub fn get_frame(&self) -> Option<FrameHandle<T>> {
        let mut inner = self.shared.inner.lock();
        inner.counters.get_try += 1;
        if inner.lifecycle != Lifecycle::Open {
            return None;
        }
        if let Some(handle) = self.take_free(&mut inner) {
            return Some(handle);
        }
        if !self.shared.config.block_get {
            return None;
        }

        let timeout = inner.block_timeout;
        tracing::trace!(session = %self.shared.name, ?timeout, "waiting for a free frame");
        self.shared.available.wait_for(&mut inner, timeout);
        if inner.lifecycle != Lifecycle::Open {
            return None;
        }
        self.take_free(&mut inner)
    }

    fn take_free(&self, inner: &mut Inner<T>) -> Option<FrameHandle<T>> {
        let count = inner.slots.len() as u16;
        let idx = match self.shared.config.policy {
            SelectPolicy::RoundRobin => {
                slot::scan_from(&inner.slots, inner.producer_idx, FrameState::Free)?
            }
            SelectPolicy::NewestWins => slot::scan_from(&inner.slots, 0, FrameState::Free)?,
        };

        let sequence = inner.next_sequence;
        let slot = &mut inner.slots[idx as usize];
        let Some(payload) = slot.payload.take() else {
            tracing::warn!(session = %self.shared.name, index = idx, "free frame has no buffer");
            return None;
        };
        slot.state = FrameState::InUser;
        slot.sequence = sequence;
        slot.meta.pacing = None;

        inner.next_sequence = sequence.wrapping_add(1);
        inner.producer_idx = slot::next_idx(idx, count);
        inner.counters.get_success += 1;

        tracing::trace!(session = %self.shared.name, index = idx, sequence, "frame get");
        Some(FrameHandle {
            shared: Arc::clone(&self.shared),
            index: idx,
            sequence,
            pacing: None,
            payload: Some(payload),
        })
    }

    /// Hands a filled frame back for transmission.
    pub fn put_frame(&self, mut frame: FrameHandle<T>) -> Result<()> {
        if !Arc::ptr_eq(&frame.shared, &self.shared) {
            return Err(St2110Error::ForeignHandle {
                session: self.shared.name.clone(),
            });
        }
        let index = frame.index;
        let Some(payload) = frame.payload.take() else {
            return Err(St2110Error::InvalidState {
                session: self.shared.name.clone(),
                index,
                expected: FrameState::InUser,
                actual: FrameState::Free,
            });
        };

        let mut inner = self.shared.inner.lock();
        if inner.lifecycle == Lifecycle::Closed {
            return Err(St2110Error::Closed(self.shared.name.clone()));
        }
        let slot = &mut inner.slots[index as usize];
        if let Err(e) = slot.transition(&self.shared.name, FrameState::InUser, FrameState::Ready) {
            tracing::warn!(session = %self.shared.name, index, error = %e, "put_frame rejected");
            if slot.payload.is_none() {
                slot.payload = Some(payload);
            }
            return Err(e);
        }
        slot.payload = Some(payload);
        slot.meta.pacing = frame.pacing;
        inner.counters.put += 1;
        drop(inner);

        tracing::debug!(session = %self.shared.name, index, sequence = frame.sequence, "frame put");
        if let Some(obs) = self.shared.observer() {
            obs.on_frame_ready(index);
        }
        Ok(())
    }

    /// Transport side: takes the next frame to send. Never blocks.
    ///
    /// Under [`SelectPolicy::NewestWins`] every other Ready frame is returned
    /// to Free and counted as dropped.
    pub fn next_frame(&self) -> Option<TransmitFrame<T>> {
        let mut inner = self.shared.inner.lock();
        if inner.lifecycle == Lifecycle::Closed {
            return None;
        }

        let mut dropped = Vec::new();
        let idx = match self.shared.config.policy {
            SelectPolicy::RoundRobin => {
                let idx = slot::scan_from(&inner.slots, inner.consumer_idx, FrameState::Ready)?;
                inner.consumer_idx = slot::next_idx(idx, inner.slots.len() as u16);
                idx
            }
            SelectPolicy::NewestWins => {
                let idx = slot::newest(&inner.slots, FrameState::Ready)?;
                for s in inner.slots.iter_mut() {
                    if s.state == FrameState::Ready && s.index != idx {
                        s.state = FrameState::Free;
                        dropped.push(s.index);
                    }
                }
                inner.counters.dropped += dropped.len() as u64;
                idx
            }
        };

        let user_pacing = self.shared.config.user_pacing;
        let slot = &mut inner.slots[idx as usize];
        let payload = slot.payload.take()?;
        slot.state = FrameState::InTransmitting;
        let meta = TxFrameMeta {
            sequence: slot.sequence,
            pacing: if user_pacing { slot.meta.pacing } else { None },
        };
        drop(inner);

        tracing::trace!(session = %self.shared.name, index = idx, sequence = meta.sequence, "frame next");
        if !dropped.is_empty() {
            tracing::debug!(session = %self.shared.name, ?dropped, "stale frames dropped");
            if let Some(obs) = self.shared.observer() {
                for &i in &dropped {
                    obs.on_frame_dropped(i);
                }
            }
            self.shared.notify_available();
        }

        Some(TransmitFrame {
            shared: Arc::clone(&self.shared),
            index: idx,
            meta,
            payload: Some(payload),
        })
    }

    /// Transport side: the frame has been sent and its slot is free again.
    pub fn frame_done(&self, mut frame: TransmitFrame<T>, meta: TxDoneMeta) -> Result<()> {
        if !Arc::ptr_eq(&frame.shared, &self.shared) {
            return Err(St2110Error::ForeignHandle {
                session: self.shared.name.clone(),
            });
        }
        let index = frame.index;
        let Some(payload) = frame.payload.take() else {
            return Err(St2110Error::InvalidState {
                session: self.shared.name.clone(),
                index,
                expected: FrameState::InTransmitting,
                actual: FrameState::Free,
            });
        };

        let mut inner = self.shared.inner.lock();
        if inner.lifecycle == Lifecycle::Closed {
            return Err(St2110Error::Closed(self.shared.name.clone()));
        }
        let slot = &mut inner.slots[index as usize];
        if let Err(e) = slot.transition(&self.shared.name, FrameState::InTransmitting, FrameState::Free) {
            tracing::warn!(session = %self.shared.name, index, error = %e, "frame_done rejected");
            if slot.payload.is_none() {
                slot.payload = Some(payload);
            }
            return Err(e);
        }
        slot.payload = Some(payload);
        slot.meta.done = meta;
        drop(inner);

        tracing::trace!(session = %self.shared.name, index, epoch = meta.epoch, "frame done");
        self.shared.available.notify_all();
        if let Some(obs) = self.shared.observer() {
            obs.on_frame_done(index, &meta);
            obs.on_frame_available();
        }
        Ok(())
    }

    /// Transport side: an epoch was skipped because no frame was ready in time.
    ///
    /// With `drop_when_late`, the newest Ready frame is discarded so the next
    /// epoch starts from fresh data. Returns whether a frame was dropped.
    pub fn drop_late_frame(&self, epoch_skipped: u64) -> bool {
        let dropped = if self.shared.config.drop_when_late {
            let mut inner = self.shared.inner.lock();
            let idx = slot::newest(&inner.slots, FrameState::Ready);
            if let Some(idx) = idx {
                inner.slots[idx as usize].state = FrameState::Free;
                inner.counters.dropped += 1;
            }
            idx
        } else {
            None
        };

        tracing::debug!(session = %self.shared.name, epoch_skipped, index = ?dropped, "epoch skipped");
        if let Some(obs) = self.shared.observer() {
            obs.on_frame_late(dropped, epoch_skipped);
        }
        if dropped.is_some() {
            self.shared.notify_available();
        }
        dropped.is_some()
    }

    /// State of slot `index`.
    pub fn frame_state(&self, index: u16) -> Result<FrameState> {
        let inner = self.shared.inner.lock();
        inner
            .slots
            .get(index as usize)
            .map(|s| s.state)
            .ok_or_else(|| self.out_of_range(index))
    }

    /// Metadata the transport reported the last time slot `index` was done.
    pub fn last_done_meta(&self, index: u16) -> Result<TxDoneMeta> {
        let inner = self.shared.inner.lock();
        inner
            .slots
            .get(index as usize)
            .map(|s| s.meta.done)
            .ok_or_else(|| self.out_of_range(index))
    }

    fn out_of_range(&self, index: u16) -> St2110Error {
        St2110Error::SlotOutOfRange {
            session: self.shared.name.clone(),
            index,
            count: self.shared.config.framebuff_cnt,
        }
    }

    /// Snapshot of the slot histogram and counters.
    pub fn stats(&self) -> PipelineStats {
        let inner = self.shared.inner.lock();
        self.snapshot(&inner)
    }

    /// Like [`stats`](Self::stats), then resets the counters.
    pub fn drain_stats(&self) -> PipelineStats {
        let mut inner = self.shared.inner.lock();
        let stats = self.snapshot(&inner);
        inner.counters = Counters::default();
        stats
    }

    fn snapshot(&self, inner: &Inner<T>) -> PipelineStats {
        let mut histogram = StateHistogram::default();
        for s in &inner.slots {
            histogram.record(s.state);
        }
        PipelineStats::new(self.shared.session, &self.shared.name, histogram, &inner.counters)
    }

    /// Drains every slot and closes the pipeline.
    ///
    /// New `get_frame` calls fail immediately; the transport may keep calling
    /// `next_frame`/`frame_done` while the drain runs. Each slot is polled up
    /// to `flush_retries` times. A slot found in transmission gets
    /// `flush_grace` to finish. Slots still held afterwards are logged and
    /// listed in the report. Never fails.
    pub fn flush_and_close(&self) -> FlushReport {
        let started = Instant::now();
        let mut report = FlushReport {
            session: self.shared.name.clone(),
            ..Default::default()
        };
        {
            let mut inner = self.shared.inner.lock();
            if inner.lifecycle != Lifecycle::Open {
                tracing::debug!(session = %self.shared.name, "pipeline already closed");
                return report;
            }
            inner.lifecycle = Lifecycle::Closing;
        }
        self.shared.available.notify_all();

        let cfg = &self.shared.config;
        for index in 0..cfg.framebuff_cnt {
            let mut retries = 0;
            loop {
                let state = self.shared.inner.lock().slots[index as usize].state;
                match state {
                    FrameState::Free => break,
                    FrameState::InTransmitting => {
                        std::thread::sleep(cfg.flush_grace);
                        report.in_flight.push(index);
                        break;
                    }
                    _ if retries >= cfg.flush_retries => {
                        tracing::warn!(
                            session = %self.shared.name,
                            index,
                            %state,
                            retries,
                            "frame stuck at close"
                        );
                        report.stuck.push(StuckFrame { index, state });
                        break;
                    }
                    _ => {
                        retries += 1;
                        std::thread::sleep(cfg.flush_interval);
                    }
                }
            }
        }

        let mut inner = self.shared.inner.lock();
        inner.lifecycle = Lifecycle::Closed;
        for s in inner.slots.iter_mut() {
            if s.payload.take().is_some() {
                report.released += 1;
            }
            s.state = FrameState::Free;
        }
        drop(inner);

        report.elapsed = started.elapsed();
        tracing::info!(
            session = %self.shared.name,
            released = report.released,
            stuck = report.stuck.len(),
            in_flight = report.in_flight.len(),
            "tx pipeline closed"
        );
        report
    }
}
