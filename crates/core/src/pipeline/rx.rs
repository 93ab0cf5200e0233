//! Receive pipeline: transport delivers complete frames, application consumes them.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use super::config::RxPipelineConfig;
use super::meta::RxFrameMeta;
use super::notify::FrameObserver;
use super::slot::{self, FrameSlot};
use super::stats::{Counters, PipelineStats, StateHistogram};
use super::tx::{FlushReport, StuckFrame};
use super::{FrameState, SessionId};
use crate::compliance::FrameTiming;
use crate::error::{Result, St2110Error};

/// Buffer owner on the receive side. Payloads the application is done with
/// go back through [`release`](Self::release).
pub trait RxTransport<T>: Send + Sync {
    /// Called outside the pipeline lock, from the thread that returned the frame.
    fn release(&self, payload: T);
}

/// No free slot for a received frame. The payload is handed back untouched.
#[derive(Debug)]
pub struct RxBusy<T> {
    pub payload: T,
    pub meta: RxFrameMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing,
    Closed,
}

struct Inner<T> {
    slots: Vec<FrameSlot<T, RxFrameMeta>>,
    producer_idx: u16,
    consumer_idx: u16,
    lifecycle: Lifecycle,
    block_timeout: Duration,
    counters: Counters,
}

struct Shared<T> {
    session: SessionId,
    name: String,
    config: RxPipelineConfig,
    inner: Mutex<Inner<T>>,
    /// Signalled whenever a frame becomes Ready.
    ready: Condvar,
    transport: Arc<dyn RxTransport<T>>,
    observer: RwLock<Option<Arc<dyn FrameObserver>>>,
}

impl<T> Shared<T> {
    fn observer(&self) -> Option<Arc<dyn FrameObserver>> {
        self.observer.read().clone()
    }

    fn cancel(&self, index: u16, payload: T) {
        let mut inner = self.inner.lock();
        if inner.lifecycle != Lifecycle::Closed {
            let slot = &mut inner.slots[index as usize];
            if slot.state == FrameState::InUser {
                slot.state = FrameState::Free;
                inner.counters.cancelled += 1;
            }
        }
        drop(inner);

        tracing::debug!(session = %self.name, index, "rx frame dropped by application");
        self.transport.release(payload);
        if let Some(obs) = self.observer() {
            obs.on_frame_available();
        }
    }
}

/// A received frame held by the application.
///
/// Return it with [`RxPipeline::put_frame`]. Dropping it has the same effect
/// but is counted as cancelled.
pub struct RxFrame<T> {
    shared: Arc<Shared<T>>,
    index: u16,
    meta: RxFrameMeta,
    payload: Option<T>,
}

impl<T> RxFrame<T> {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn meta(&self) -> &RxFrameMeta {
        &self.meta
    }

    /// Timing verdict of the compliance parser, if the session runs one.
    pub fn timing(&self) -> Option<&FrameTiming> {
        self.meta.timing.as_ref()
    }
}

impl<T> Deref for RxFrame<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.payload
            .as_ref()
            .expect("payload is held until the frame is returned")
    }
}

impl<T> DerefMut for RxFrame<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.payload
            .as_mut()
            .expect("payload is held until the frame is returned")
    }
}

impl<T> Drop for RxFrame<T> {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            self.shared.cancel(self.index, payload);
        }
    }
}

impl<T> std::fmt::Debug for RxFrame<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxFrame")
            .field("session", &self.shared.name)
            .field("index", &self.index)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame-exchange pipeline for a receive session.
pub struct RxPipeline<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RxPipeline<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> RxPipeline<T> {
    pub fn new(config: RxPipelineConfig, transport: Arc<dyn RxTransport<T>>) -> Result<Self> {
        Self::with_session(SessionId::default(), config, transport)
    }

    pub fn with_session(
        session: SessionId,
        config: RxPipelineConfig,
        transport: Arc<dyn RxTransport<T>>,
    ) -> Result<Self> {
        config.validate()?;
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("rx_{}_{}", config.media.as_str(), session));
        let slots = (0..config.framebuff_cnt)
            .map(|i| FrameSlot::new(i, None))
            .collect();

        tracing::info!(session = %name, frames = config.framebuff_cnt, "rx pipeline created");

        Ok(Self {
            shared: Arc::new(Shared {
                session,
                name,
                inner: Mutex::new(Inner {
                    slots,
                    producer_idx: 0,
                    consumer_idx: 0,
                    lifecycle: Lifecycle::Open,
                    block_timeout: config.block_timeout,
                    counters: Counters::default(),
                }),
                config,
                ready: Condvar::new(),
                transport,
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

    pub fn set_observer(&self, observer: Arc<dyn FrameObserver>) {
        *self.shared.observer.write() = Some(observer);
    }

    pub fn set_block_timeout(&self, timeout: Duration) {
        self.shared.inner.lock().block_timeout = timeout;
    }

    pub fn wake_block(&self) {
        let _inner = self.shared.inner.lock();
        self.shared.ready.notify_all();
    }

    /// Transport side: a complete frame arrived. Never blocks.
    ///
    /// Returns the slot index, or the payload back when every slot is taken or
    /// the pipeline is closing.
    pub fn frame_ready(&self, payload: T, meta: RxFrameMeta) -> std::result::Result<u16, RxBusy<T>> {
        let mut inner = self.shared.inner.lock();
        let idx = match inner.lifecycle {
            Lifecycle::Open => slot::scan_from(&inner.slots, inner.producer_idx, FrameState::Free),
            _ => None,
        };
        let Some(idx) = idx else {
            inner.counters.busy += 1;
            drop(inner);
            tracing::debug!(session = %self.shared.name, rtp = meta.rtp_timestamp, "no free rx frame");
            return Err(RxBusy { payload, meta });
        };

        let count = inner.slots.len() as u16;
        let slot = &mut inner.slots[idx as usize];
        slot.state = FrameState::Ready;
        slot.payload = Some(payload);
        slot.meta = meta;
        inner.producer_idx = slot::next_idx(idx, count);
        drop(inner);

        tracing::trace!(session = %self.shared.name, index = idx, "rx frame ready");
        self.shared.ready.notify_all();
        if let Some(obs) = self.shared.observer() {
            obs.on_frame_ready(idx);
        }
        Ok(idx)
    }

    /// Takes the oldest received frame.
    pub fn get_frame(&self) -> Option<RxFrame<T>> {
        let mut inner = self.shared.inner.lock();
        inner.counters.get_try += 1;
        if inner.lifecycle != Lifecycle::Open {
            return None;
        }
        if let Some(frame) = self.take_ready(&mut inner) {
            return Some(frame);
        }
        if !self.shared.config.block_get {
            return None;
        }

        let timeout = inner.block_timeout;
        self.shared.ready.wait_for(&mut inner, timeout);
        if inner.lifecycle != Lifecycle::Open {
            return None;
        }
        self.take_ready(&mut inner)
    }

    fn take_ready(&self, inner: &mut Inner<T>) -> Option<RxFrame<T>> {
        let idx = slot::scan_from(&inner.slots, inner.consumer_idx, FrameState::Ready)?;
        let count = inner.slots.len() as u16;
        let slot = &mut inner.slots[idx as usize];
        let payload = slot.payload.take()?;
        slot.state = FrameState::InUser;
        let meta = std::mem::take(&mut slot.meta);
        inner.consumer_idx = slot::next_idx(idx, count);
        inner.counters.get_success += 1;

        Some(RxFrame {
            shared: Arc::clone(&self.shared),
            index: idx,
            meta,
            payload: Some(payload),
        })
    }

    /// Returns a consumed frame; its payload goes back to the transport.
    ///
    /// After close the payload is still released to the transport, and
    /// [`St2110Error::Closed`] is returned.
    pub fn put_frame(&self, mut frame: RxFrame<T>) -> Result<()> {
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
        let outcome = if inner.lifecycle == Lifecycle::Closed {
            Err(St2110Error::Closed(self.shared.name.clone()))
        } else {
            inner.slots[index as usize].transition(&self.shared.name, FrameState::InUser, FrameState::Free)
        };
        if outcome.is_ok() {
            inner.counters.put += 1;
        }
        drop(inner);

        self.shared.transport.release(payload);
        match &outcome {
            Ok(()) => {
                tracing::trace!(session = %self.shared.name, index, "rx frame put");
                if let Some(obs) = self.shared.observer() {
                    obs.on_frame_available();
                }
            }
            Err(e) => tracing::warn!(session = %self.shared.name, index, error = %e, "rx put_frame rejected"),
        }
        outcome
    }

    pub fn frame_state(&self, index: u16) -> Result<FrameState> {
        let inner = self.shared.inner.lock();
        inner
            .slots
            .get(index as usize)
            .map(|s| s.state)
            .ok_or_else(|| St2110Error::SlotOutOfRange {
                session: self.shared.name.clone(),
                index,
                count: self.shared.config.framebuff_cnt,
            })
    }

    pub fn stats(&self) -> PipelineStats {
        let inner = self.shared.inner.lock();
        self.snapshot(&inner)
    }

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

    /// Stops delivery and drains the pipeline.
    ///
    /// Ready frames nobody will read are released to the transport at once.
    /// Frames held by the application are polled up to `flush_retries` times
    /// and reported as stuck if they are not returned.
    pub fn flush_and_close(&self) -> FlushReport {
        let started = Instant::now();
        let mut report = FlushReport {
            session: self.shared.name.clone(),
            ..Default::default()
        };
        let unread = {
            let mut inner = self.shared.inner.lock();
            if inner.lifecycle != Lifecycle::Open {
                return report;
            }
            inner.lifecycle = Lifecycle::Closing;
            let mut unread = Vec::new();
            for s in inner.slots.iter_mut() {
                if s.state == FrameState::Ready {
                    s.state = FrameState::Free;
                    if let Some(p) = s.payload.take() {
                        unread.push(p);
                    }
                }
            }
            unread
        };
        self.shared.ready.notify_all();
        report.released = unread.len();
        for p in unread {
            self.shared.transport.release(p);
        }

        let cfg = &self.shared.config;
        for index in 0..cfg.framebuff_cnt {
            let mut retries = 0;
            loop {
                let state = self.shared.inner.lock().slots[index as usize].state;
                if state == FrameState::Free {
                    break;
                }
                if retries >= cfg.flush_retries {
                    tracing::warn!(
                        session = %self.shared.name,
                        index,
                        %state,
                        retries,
                        "rx frame stuck at close"
                    );
                    report.stuck.push(StuckFrame { index, state });
                    break;
                }
                retries += 1;
                std::thread::sleep(cfg.flush_interval);
            }
        }

        let mut inner = self.shared.inner.lock();
        inner.lifecycle = Lifecycle::Closed;
        for s in inner.slots.iter_mut() {
            s.state = FrameState::Free;
        }
        drop(inner);

        report.elapsed = started.elapsed();
        tracing::info!(
            session = %self.shared.name,
            released = report.released,
            stuck = report.stuck.len(),
            "rx pipeline closed"
        );
        report
    }
}
